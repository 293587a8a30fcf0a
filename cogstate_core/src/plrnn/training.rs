//! Teacher-forced online SGD over observation sequences.

use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;

use super::gradient::{
    apply_matrix, apply_vector, basis_gradient, coupling_gradient, latent_bias_gradient,
    latent_error, observation_gradient, observed_bias_gradient, recurrent_gradient,
    self_weight_gradient,
};
use super::weights::{ModelWeights, StepTrace};
use crate::config::PlrnnConfig;
use crate::linalg::{mat_inverse, mat_vec, vec_sub};

/// Update hyperparameters captured at the start of a training call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SgdParams {
    pub learning_rate: f64,
    pub gradient_clip: f64,
    pub l1: f64,
    pub teacher_forcing_ratio: f64,
    pub exact_latent_backprop: bool,
}

impl SgdParams {
    pub(crate) fn from_config(config: &PlrnnConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            gradient_clip: config.gradient_clip,
            l1: config.l1_regularization,
            teacher_forcing_ratio: config.teacher_forcing_ratio,
            exact_latent_backprop: config.exact_latent_backprop,
        }
    }
}

/// `z = B⁻¹(x − b_x)`; a singular `B` degrades to `z = x − b_x`.
pub(crate) fn latent_from_observation(weights: &ModelWeights, observation: &[f64]) -> Vec<f64> {
    let centred = vec_sub(observation, &weights.bias_observed);
    mat_vec(&mat_inverse(&weights.observation), &centred)
}

pub(crate) fn mean_squared(err: &[f64]) -> f64 {
    if err.is_empty() {
        return 0.0;
    }
    err.iter().map(|e| e * e).sum::<f64>() / err.len() as f64
}

/// One SGD update against a single target.
///
/// All directions are computed from the pre-update weights before any tensor
/// is modified.
pub(crate) fn gradient_step(
    weights: &mut ModelWeights,
    latent_prev: &[f64],
    trace: &StepTrace,
    err: &[f64],
    params: &SgdParams,
) {
    let delta = latent_error(&weights.observation, err, params.exact_latent_backprop);
    let grad_b = observation_gradient(err, &trace.latent);
    let grad_bx = observed_bias_gradient(err);
    let grad_a = self_weight_gradient(&delta, latent_prev);
    let grad_w = recurrent_gradient(&delta, &trace.activation, &weights.recurrent, params.l1);
    let grad_bz = latent_bias_gradient(&delta);
    let dendritic_grads = match (&weights.dendritic, &trace.bases) {
        (Some(dendritic), Some(bases)) => Some((
            coupling_gradient(&delta, bases),
            basis_gradient(&delta, &dendritic.coupling, bases, latent_prev),
        )),
        _ => None,
    };

    let (lr, limit) = (params.learning_rate, params.gradient_clip);
    apply_matrix(&mut weights.observation, &grad_b, lr, limit);
    apply_vector(&mut weights.bias_observed, &grad_bx, lr, limit);
    apply_vector(&mut weights.self_weights, &grad_a, lr, limit);
    apply_matrix(&mut weights.recurrent, &grad_w, lr, limit);
    apply_vector(&mut weights.bias_latent, &grad_bz, lr, limit);
    if let (Some(dendritic), Some((grad_c, grad_basis))) =
        (weights.dendritic.as_mut(), dendritic_grads)
    {
        apply_matrix(&mut dendritic.coupling, &grad_c, lr, limit);
        apply_matrix(&mut dendritic.basis, &grad_basis, lr, limit);
    }
}

/// Train on one ordered sequence and return its average one-step loss.
///
/// After each update the next step starts from the ground truth with
/// probability `teacher_forcing_ratio`, otherwise from the model's own
/// prediction. Sequences shorter than two return infinity untouched.
pub(crate) fn train_sequence(
    weights: &mut ModelWeights,
    sequence: &[Vec<f64>],
    params: &SgdParams,
    rng: &mut StdRng,
) -> f64 {
    if sequence.len() < 2 {
        return f64::INFINITY;
    }
    let mut latent = latent_from_observation(weights, &sequence[0]);
    let mut total = 0.0;
    for target in &sequence[1..] {
        let trace = weights.step(&latent, None);
        let err = vec_sub(target, &trace.observed);
        total += mean_squared(&err);
        gradient_step(weights, &latent, &trace, &err, params);

        latent = if rng.gen::<f64>() < params.teacher_forcing_ratio {
            latent_from_observation(weights, target)
        } else {
            trace.latent
        };
    }
    total / (sequence.len() - 1) as f64
}

/// Sum of fully teacher-forced one-step losses and the number of transitions.
pub(crate) fn sequence_loss(weights: &ModelWeights, sequence: &[Vec<f64>]) -> (f64, usize) {
    sequence
        .windows(2)
        .map(|pair| {
            let latent = latent_from_observation(weights, &pair[0]);
            let trace = weights.step(&latent, None);
            mean_squared(&vec_sub(&pair[1], &trace.observed))
        })
        .fold((0.0, 0), |(sum, count), loss| (sum + loss, count + 1))
}

/// Mean one-step loss over many sequences, evaluated in parallel.
pub(crate) fn batch_loss(weights: &ModelWeights, sequences: &[Vec<Vec<f64>>]) -> f64 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::Matrix;
    use rand::SeedableRng;

    fn weights() -> ModelWeights {
        let config = PlrnnConfig {
            learning_rate: 0.05,
            l1_regularization: 0.0,
            teacher_forcing_ratio: 1.0,
            ..PlrnnConfig::default()
        };
        ModelWeights::initialize(&config, &mut StdRng::seed_from_u64(3))
    }

    fn sequence() -> Vec<Vec<f64>> {
        (0..12)
            .map(|t| {
                let phase = t as f64 * 0.4;
                vec![
                    0.5 + 0.2 * phase.sin(),
                    0.5,
                    0.4,
                    0.6 + 0.1 * phase.cos(),
                    0.7,
                ]
            })
            .collect()
    }

    #[test]
    fn latent_inverts_identity_observation() {
        let mut w = weights();
        w.bias_observed = vec![0.1; 5];
        let latent = latent_from_observation(&w, &[0.6; 5]);
        for z in latent {
            assert!((z - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn singular_observation_falls_back_to_centring() {
        let mut w = weights();
        w.observation = Matrix::zeros(5, 5);
        w.bias_observed = vec![0.0; 5];
        assert_eq!(latent_from_observation(&w, &[0.3; 5]), vec![0.3; 5]);
    }

    #[test]
    fn repeated_training_reduces_loss() {
        let mut w = weights();
        let params = SgdParams::from_config(&w.config);
        let mut rng = StdRng::seed_from_u64(9);
        let data = sequence();

        let first = train_sequence(&mut w, &data, &params, &mut rng);
        let mut last = first;
        for _ in 0..40 {
            last = train_sequence(&mut w, &data, &params, &mut rng);
        }
        assert!(last.is_finite());
        assert!(last < first, "loss {} did not drop below {}", last, first);
    }

    #[test]
    fn short_sequence_is_untouched() {
        let mut w = weights();
        let before = w.clone();
        let params = SgdParams::from_config(&w.config);
        let loss = train_sequence(&mut w, &[vec![0.5; 5]], &params, &mut StdRng::seed_from_u64(1));
        assert!(loss.is_infinite());
        assert_eq!(w, before);
    }

    #[test]
    fn batch_loss_matches_serial_mean() {
        let w = weights();
        let data = sequence();
        let (sum, count) = sequence_loss(&w, &data);
        let parallel = batch_loss(&w, &[data.clone(), data]);
        assert!((parallel - sum / count as f64).abs() < 1e-12);
        assert!(batch_loss(&w, &[]).is_infinite());
    }
}
