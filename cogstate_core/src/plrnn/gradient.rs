//! Hand-derived gradients of the one-step PLRNN loss.
//!
//! For the loss `½‖x_target − x_pred‖²` each function returns the descent
//! direction for one tensor (the negative gradient), so updates are applied
//! as `param += lr · clip(g)`. `err` is always `target − predicted`.

use crate::linalg::{mat_vec, outer, transpose, Matrix};

/// Direction for `B`: `err · z_{t+1}ᵀ`.
pub fn observation_gradient(err: &[f64], latent_next: &[f64]) -> Matrix {
    outer(err, latent_next)
}

/// Direction for `b_x`.
pub fn observed_bias_gradient(err: &[f64]) -> Vec<f64> {
    err.to_vec()
}

/// Output error carried back to the latent layer.
///
/// The exact chain rule uses `Bᵀ·err`. The default propagates through `B`
/// itself, which coincides with the exact form whenever `B` is symmetric
/// (including its identity initialisation).
pub fn latent_error(observation: &Matrix, err: &[f64], exact: bool) -> Vec<f64> {
    if exact {
        mat_vec(&transpose(observation), err)
    } else {
        mat_vec(observation, err)
    }
}

/// Direction for the self-weights `A`: `δ ⊙ z_t`.
pub fn self_weight_gradient(latent_err: &[f64], latent_prev: &[f64]) -> Vec<f64> {
    latent_err
        .iter()
        .zip(latent_prev)
        .map(|(d, z)| d * z)
        .collect()
}

/// Direction for `W`: `δ · ReLU(z_t)ᵀ − λ·sign(W)`.
pub fn recurrent_gradient(
    latent_err: &[f64],
    activation_prev: &[f64],
    recurrent: &Matrix,
    l1: f64,
) -> Matrix {
    let mut grad = outer(latent_err, activation_prev);
    for (g, w) in grad.iter_mut().zip(recurrent.iter()) {
        *g -= l1 * sign(*w);
    }
    grad
}

/// Direction for `b_z`.
pub fn latent_bias_gradient(latent_err: &[f64]) -> Vec<f64> {
    latent_err.to_vec()
}

/// Direction for the dendritic coupling `C`: `δ · basesᵀ`.
pub fn coupling_gradient(latent_err: &[f64], bases: &[f64]) -> Matrix {
    outer(latent_err, bases)
}

/// Direction for the dendritic basis: `((Cᵀ·δ) ⊙ 1[bases > 0]) · z_tᵀ`.
pub fn basis_gradient(
    latent_err: &[f64],
    coupling: &Matrix,
    bases: &[f64],
    latent_prev: &[f64],
) -> Matrix {
    let gated: Vec<f64> = mat_vec(&transpose(coupling), latent_err)
        .into_iter()
        .zip(bases)
        .map(|(g, b)| if *b > 0.0 { g } else { 0.0 })
        .collect();
    outer(&gated, latent_prev)
}

pub fn clip(value: f64, limit: f64) -> f64 {
    value.clamp(-limit, limit)
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// `param += lr · clip(g)` elementwise.
pub(crate) fn apply_vector(param: &mut [f64], grad: &[f64], lr: f64, limit: f64) {
    for (p, g) in param.iter_mut().zip(grad) {
        *p += lr * clip(*g, limit);
    }
}

pub(crate) fn apply_matrix(param: &mut Matrix, grad: &Matrix, lr: f64, limit: f64) {
    debug_assert_eq!(param.shape(), grad.shape(), "gradient shape mismatch");
    for (p, g) in param.iter_mut().zip(grad.iter()) {
        *p += lr * clip(*g, limit);
    }
}
