//! Online SGD for the KalmanFormer output head and blend predictor.
//!
//! The Kalman block and the encoder stay fixed; only the layers that turn the
//! last context vector into an estimate are trained. Each step forecasts the
//! next observation, takes the gradient of its squared error and then filters
//! the true observation into the state.

use rayon::prelude::*;

use cogstate_shared::StateObservation;

use super::engine::{filter_update, seed_state, step_forecast, StepForecast};
use super::weights::KalmanFormerWeights;
use crate::config::BlendMode;
use crate::linalg::{dot, mat_vec, outer, transpose, vec_scale, vec_sub, Matrix};
use crate::plrnn::gradient::{apply_matrix, apply_vector, clip};

/// State-space error `δ = Hᵀ·err` for an observation-space error.
pub fn state_error(observation: &Matrix, err: &[f64]) -> Vec<f64> {
    mat_vec(&transpose(observation), err)
}

/// Output projection gradient: `r·δ·ctxᵀ`.
pub fn output_projection_gradient(state_err: &[f64], context: &[f64], ratio: f64) -> Matrix {
    outer(&vec_scale(state_err, ratio), context)
}

/// Output bias gradient: `r·δ`.
pub fn output_bias_gradient(state_err: &[f64], ratio: f64) -> Vec<f64> {
    vec_scale(state_err, ratio)
}

/// Gradient at the blend logit: `δ·(t − k)·r(1 − r)`.
pub fn blend_logit_gradient(
    state_err: &[f64],
    transformer: &[f64],
    kalman: &[f64],
    ratio: f64,
) -> f64 {
    dot(state_err, &vec_sub(transformer, kalman)) * ratio * (1.0 - ratio)
}

pub(crate) fn mean_squared(err: &[f64]) -> f64 {
    if err.is_empty() {
        return 0.0;
    }
    err.iter().map(|e| e * e).sum::<f64>() / err.len() as f64
}

/// Observation-space error of a one-step forecast.
fn forecast_error(
    weights: &KalmanFormerWeights,
    forecast: &StepForecast,
    target: &[f64],
) -> Vec<f64> {
    vec_sub(target, &mat_vec(&weights.kalman.observation, &forecast.blended))
}

/// One SGD update from a single forecast; gradients are taken from the
/// pre-update weights.
pub(crate) fn gradient_step(
    weights: &mut KalmanFormerWeights,
    forecast: &StepForecast,
    err: &[f64],
) {
    let (lr, limit) = (weights.config.learning_rate, weights.config.gradient_clip);
    let delta = state_error(&weights.kalman.observation, err);
    let grad_out = output_projection_gradient(&delta, &forecast.context, forecast.ratio);
    let grad_bias = output_bias_gradient(&delta, forecast.ratio);
    let learned_blend = weights.config.blend_mode == BlendMode::Learned;
    let grad_logit = blend_logit_gradient(
        &delta,
        &forecast.transformer,
        &forecast.kalman,
        forecast.ratio,
    );

    apply_matrix(&mut weights.output_projection, &grad_out, lr, limit);
    apply_vector(&mut weights.output_bias, &grad_bias, lr, limit);
    if let (true, Some(predictor)) = (learned_blend, weights.blend_predictor.as_mut()) {
        let grad_weights = vec_scale(&forecast.context, grad_logit);
        apply_vector(&mut predictor.weights, &grad_weights, lr, limit);
        predictor.bias += lr * clip(grad_logit, limit);
    }
}

/// Train on one ordered sequence; returns the average one-step loss, or
/// infinity when there is no transition.
pub(crate) fn train_sequence(
    weights: &mut KalmanFormerWeights,
    sequence: &[StateObservation],
) -> f64 {
    let Some((first, rest)) = sequence.split_first() else {
        return f64::INFINITY;
    };
    if rest.is_empty() {
        return f64::INFINITY;
    }
    let mut state = seed_state(weights, &first.values, first.timestamp);
    let mut total = 0.0;
    for target in rest {
        let forecast = step_forecast(weights, &state);
        let err = forecast_error(weights, &forecast, &target.values);
        total += mean_squared(&err);
        gradient_step(weights, &forecast, &err);
        filter_update(weights, &mut state, &target.values, target.timestamp);
    }
    total / rest.len() as f64
}

/// Sum of one-step losses along a sequence and the number of transitions.
pub(crate) fn sequence_loss(
    weights: &KalmanFormerWeights,
    sequence: &[StateObservation],
) -> (f64, usize) {
    let Some((first, rest)) = sequence.split_first() else {
        return (0.0, 0);
    };
    let mut state = seed_state(weights, &first.values, first.timestamp);
    let mut total = 0.0;
    for target in rest {
        let forecast = step_forecast(weights, &state);
        total += mean_squared(&forecast_error(weights, &forecast, &target.values));
        filter_update(weights, &mut state, &target.values, target.timestamp);
    }
    (total, rest.len())
}

/// Mean one-step loss over many sequences, evaluated in parallel.
pub(crate) fn batch_loss(
    weights: &KalmanFormerWeights,
    sequences: &[Vec<StateObservation>],
) -> f64 {
    let (sum, count) = sequences
        .par_iter()
        .map(|sequence| sequence_loss(weights, sequence))
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
    if count == 0 {
        f64::INFINITY
    } else {
        sum / count as f64
    }
}
