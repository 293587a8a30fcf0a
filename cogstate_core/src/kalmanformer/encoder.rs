//! Observation embedding and the self-attention encoder stack.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::weights::{EncoderLayer, KalmanFormerWeights, TIME_FEATURES};
use crate::linalg::{dot, layer_norm, mat_vec, relu, softmax, vec_add};

/// Hour-of-day and day-of-week angles in radians.
fn time_angles(timestamp: DateTime<Utc>) -> (f64, f64) {
    let hour = timestamp.hour() as f64 + timestamp.minute() as f64 / 60.0;
    let weekday = timestamp.weekday().num_days_from_monday() as f64;
    (2.0 * PI * hour / 24.0, 2.0 * PI * weekday / 7.0)
}

/// `[sin h, cos h, sin d, cos d]` for the learned time projection.
pub fn time_features(timestamp: DateTime<Utc>) -> [f64; TIME_FEATURES] {
    let (hour, day) = time_angles(timestamp);
    [hour.sin(), hour.cos(), day.sin(), day.cos()]
}

/// Fixed time embedding. Consecutive sine/cosine pairs alternate between the
/// hour and day angle, with the frequency rising every two pairs.
pub fn sinusoidal_time_embedding(timestamp: DateTime<Utc>, dim: usize) -> Vec<f64> {
    let (hour, day) = time_angles(timestamp);
    (0..dim)
        .map(|k| {
            let pair = k / 2;
            let base = if pair % 2 == 0 { hour } else { day };
            let angle = base * (pair / 2 + 1) as f64;
            if k % 2 == 0 {
                angle.sin()
            } else {
                angle.cos()
            }
        })
        .collect()
}

/// Observation projection plus time embedding. Position is added at encode
/// time so buffered embeddings stay valid as the window slides.
pub fn embed_observation(
    weights: &KalmanFormerWeights,
    observation: &[f64],
    timestamp: DateTime<Utc>,
) -> Vec<f64> {
    let embeddings = &weights.embeddings;
    let projected = vec_add(
        &mat_vec(&embeddings.observation, observation),
        &embeddings.observation_bias,
    );
    let time = match &embeddings.time {
        Some(matrix) => mat_vec(matrix, &time_features(timestamp)),
        None => sinusoidal_time_embedding(timestamp, projected.len()),
    };
    vec_add(&projected, &time)
}

/// Row-wise softmax of scaled dot-product scores.
///
/// Scores are divided by `√d · temperature`; every row sums to one.
pub fn compute_attention_weights(
    queries: &[Vec<f64>],
    keys: &[Vec<f64>],
    temperature: f64,
) -> Vec<Vec<f64>> {
    let dim = keys.first().map_or(1, Vec::len).max(1);
    let scale = 1.0 / ((dim as f64).sqrt() * temperature.max(f64::EPSILON));
    queries
        .iter()
        .map(|q| {
            let scores: Vec<f64> = keys.iter().map(|k| dot(q, k) * scale).collect();
            softmax(&scores)
        })
        .collect()
}

fn head_slice(v: &[f64], head: usize, head_dim: usize) -> Vec<f64> {
    v[head * head_dim..(head + 1) * head_dim].to_vec()
}

fn multi_head_attention(
    inputs: &[Vec<f64>],
    layer: &EncoderLayer,
    num_heads: usize,
    temperature: f64,
) -> Vec<Vec<f64>> {
    let embed = layer.query.rows();
    let head_dim = embed / num_heads.max(1);
    let queries: Vec<Vec<f64>> = inputs.iter().map(|x| mat_vec(&layer.query, x)).collect();
    let keys: Vec<Vec<f64>> = inputs.iter().map(|x| mat_vec(&layer.key, x)).collect();
    let values: Vec<Vec<f64>> = inputs.iter().map(|x| mat_vec(&layer.value, x)).collect();

    let mut concatenated = vec![vec![0.0; embed]; inputs.len()];
    for head in 0..num_heads.max(1) {
        let q: Vec<Vec<f64>> = queries.iter().map(|v| head_slice(v, head, head_dim)).collect();
        let k: Vec<Vec<f64>> = keys.iter().map(|v| head_slice(v, head, head_dim)).collect();
        let attention = compute_attention_weights(&q, &k, temperature);
        for (row, weights) in attention.iter().enumerate() {
            for (col, weight) in weights.iter().enumerate() {
                let offset = head * head_dim;
                for d in 0..head_dim {
                    concatenated[row][offset + d] += weight * values[col][offset + d];
                }
            }
        }
    }
    concatenated
        .iter()
        .map(|v| mat_vec(&layer.output, v))
        .collect()
}

fn encoder_layer(
    inputs: &[Vec<f64>],
    layer: &EncoderLayer,
    num_heads: usize,
    temperature: f64,
) -> Vec<Vec<f64>> {
    let attended = multi_head_attention(inputs, layer, num_heads, temperature);
    inputs
        .iter()
        .zip(&attended)
        .map(|(x, a)| {
            let normed = layer_norm(
                &vec_add(x, a),
                &layer.attention_norm_gain,
                &layer.attention_norm_bias,
            );
            let hidden = relu(&vec_add(
                &mat_vec(&layer.ffn_hidden, &normed),
                &layer.ffn_hidden_bias,
            ));
            let ffn = vec_add(&mat_vec(&layer.ffn_output, &hidden), &layer.ffn_output_bias);
            layer_norm(&vec_add(&normed, &ffn), &layer.ffn_norm_gain, &layer.ffn_norm_bias)
        })
        .collect()
}

/// Add positions to buffered embeddings and run every encoder layer.
pub fn encode(weights: &KalmanFormerWeights, embeddings: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let positional = &weights.embeddings.positional;
    let last_position = positional.rows().saturating_sub(1);
    let mut sequence: Vec<Vec<f64>> = embeddings
        .iter()
        .enumerate()
        .map(|(pos, e)| vec_add(e, positional.row(pos.min(last_position))))
        .collect();

    let config = &weights.config;
    for layer in &weights.layers {
        sequence = encoder_layer(
            &sequence,
            layer,
            config.num_heads,
            config.attention_temperature,
        );
    }
    sequence
}
