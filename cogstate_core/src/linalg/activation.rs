//! Elementwise activations and normalisations.

/// Small constant added to variances in layer normalisation.
const LAYER_NORM_EPSILON: f64 = 1e-5;

pub fn relu(x: &[f64]) -> Vec<f64> {
    x.iter().map(|&v| v.max(0.0)).collect()
}

/// ReLU derivative (0 at the kink).
pub fn relu_derivative(x: &[f64]) -> Vec<f64> {
    x.iter().map(|&v| if v > 0.0 { 1.0 } else { 0.0 }).collect()
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Inverse of [`sigmoid`] for `p` in `(0, 1)`, clamped away from the edges.
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

/// Softmax with max subtraction.
///
/// Non-finite inputs are treated as very negative scores; an all-invalid row
/// yields the uniform distribution.
pub fn softmax(x: &[f64]) -> Vec<f64> {
    if x.is_empty() {
        return Vec::new();
    }
    let max = x
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / x.len() as f64; x.len()];
    }
    let exp: Vec<f64> = x
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|v| v / sum).collect()
}

/// Layer normalisation with learned gain and bias.
pub fn layer_norm(x: &[f64], gain: &[f64], bias: &[f64]) -> Vec<f64> {
    let n = x.len().max(1) as f64;
    let mean = x.iter().sum::<f64>() / n;
    let variance = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let inv_std = 1.0 / (variance + LAYER_NORM_EPSILON).sqrt();
    x.iter()
        .zip(gain.iter().zip(bias))
        .map(|(v, (g, b))| (v - mean) * inv_std * g + b)
        .collect()
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
