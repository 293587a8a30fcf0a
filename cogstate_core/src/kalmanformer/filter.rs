//! Kalman predict/update primitives and the filter's rolling estimate.

use serde::{Deserialize, Serialize};

use super::weights::{GainPredictor, KalmanBlock};
use crate::linalg::{
    dot, mat_add, mat_inverse, mat_mul, mat_sub, mat_vec, sigmoid, transpose, vec_add, vec_sub,
    Matrix,
};

/// Current Kalman bookkeeping for one tracked user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanEstimate {
    /// Posterior (blended) state estimate.
    pub state: Vec<f64>,
    /// Posterior error covariance `P`.
    pub covariance: Matrix,
    pub predicted_state: Vec<f64>,
    pub predicted_covariance: Matrix,
    /// `y = z − H·x̂⁻`.
    pub innovation: Vec<f64>,
    /// `S = H·P⁻·Hᵀ + R`.
    pub innovation_covariance: Matrix,
    pub gain: Matrix,
    /// Set when the last observation's normalised innovation exceeded the
    /// outlier threshold.
    pub outlier: bool,
}

impl KalmanEstimate {
    pub fn new(state: Vec<f64>, covariance: Matrix, obs_dim: usize) -> Self {
        let dim = state.len();
        Self {
            predicted_state: state.clone(),
            predicted_covariance: covariance.clone(),
            state,
            covariance,
            innovation: vec![0.0; obs_dim],
            innovation_covariance: Matrix::identity(obs_dim),
            gain: Matrix::zeros(dim, obs_dim),
            outlier: false,
        }
    }

    /// Diagonal of `P`.
    pub fn variances(&self) -> Vec<f64> {
        self.covariance.diag()
    }
}

/// `x̂⁻ = A·x̂`, `P⁻ = A·P·Aᵀ + Q`.
pub fn predict_step(
    kalman: &KalmanBlock,
    state: &[f64],
    covariance: &Matrix,
) -> (Vec<f64>, Matrix) {
    let a = &kalman.transition;
    let predicted_state = mat_vec(a, state);
    let predicted_covariance = mat_add(
        &mat_mul(&mat_mul(a, covariance), &transpose(a)),
        &kalman.process_noise,
    );
    (predicted_state, predicted_covariance)
}

/// Innovation `y` and its covariance `S` for an observation.
pub fn innovation(
    kalman: &KalmanBlock,
    predicted_state: &[f64],
    predicted_covariance: &Matrix,
    observation: &[f64],
) -> (Vec<f64>, Matrix) {
    let h = &kalman.observation;
    let y = vec_sub(observation, &mat_vec(h, predicted_state));
    let s = mat_add(
        &mat_mul(&mat_mul(h, predicted_covariance), &transpose(h)),
        &kalman.measurement_noise,
    );
    (y, s)
}

/// `K = P⁻·Hᵀ·S⁻¹`.
pub fn closed_form_gain(predicted_covariance: &Matrix, observation: &Matrix, s: &Matrix) -> Matrix {
    let cross = mat_mul(predicted_covariance, &transpose(observation));
    mat_mul(&cross, &mat_inverse(s))
}

/// `sigmoid(G·ctx + g)` reshaped to `state × obs`.
pub fn learned_gain(
    predictor: &GainPredictor,
    context: &[f64],
    state_dim: usize,
    obs_dim: usize,
) -> Matrix {
    let logits = vec_add(&mat_vec(&predictor.weights, context), &predictor.bias);
    Matrix::from_fn(state_dim, obs_dim, |r, c| sigmoid(logits[r * obs_dim + c]))
}

/// `yᵀ·S⁻¹·y`.
pub fn normalized_innovation_squared(y: &[f64], s: &Matrix) -> f64 {
    dot(y, &mat_vec(&mat_inverse(s), y))
}

/// `x̂ = x̂⁻ + K·y`, `P = (I − K·H)·P⁻`, symmetrised.
pub fn update_step(
    predicted_state: &[f64],
    predicted_covariance: &Matrix,
    gain: &Matrix,
    observation: &Matrix,
    y: &[f64],
) -> (Vec<f64>, Matrix) {
    let state = vec_add(predicted_state, &mat_vec(gain, y));
    let identity = Matrix::identity(predicted_covariance.rows());
    let covariance = mat_mul(
        &mat_sub(&identity, &mat_mul(gain, observation)),
        predicted_covariance,
    );
    (state, symmetrize(&covariance))
}

fn symmetrize(m: &Matrix) -> Matrix {
    Matrix::from_fn(m.rows(), m.cols(), |r, c| 0.5 * (m[(r, c)] + m[(c, r)]))
}
