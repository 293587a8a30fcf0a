//! Per-user rolling KalmanFormer state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::filter::KalmanEstimate;
use crate::ring::RingBuffer;

const BLEND_STEP: f64 = 0.05;
const BLEND_CEILING: f64 = 0.8;
const BLEND_FLOOR: f64 = 0.2;
/// RMS error above which the blend shifts towards the transformer.
const HIGH_ERROR: f64 = 0.5;
/// RMS error below which the blend shifts towards the Kalman filter.
const LOW_ERROR: f64 = 0.25;

/// One buffered observation with its position-free embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub observation: Vec<f64>,
    pub timestamp: DateTime<Utc>,
    pub embedding: Vec<f64>,
}

/// Filter estimate, encoder context and sliding window for one user.
///
/// Created by `KalmanFormerEngine::initial_state` and advanced by `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanFormerState {
    pub estimate: KalmanEstimate,
    /// Encoder output for every buffered position.
    pub context: Vec<Vec<f64>>,
    pub window: RingBuffer<WindowEntry>,
    /// Weight of the transformer estimate in the blend.
    pub blend_ratio: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub step: u64,
}

impl KalmanFormerState {
    pub fn dim(&self) -> usize {
        self.estimate.state.len()
    }

    pub fn last_context(&self) -> Option<&[f64]> {
        self.context.last().map(Vec::as_slice)
    }

    pub fn last_observation(&self) -> Option<&[f64]> {
        self.window.newest().map(|entry| entry.observation.as_slice())
    }

    pub(crate) fn embeddings(&self) -> Vec<Vec<f64>> {
        self.window.iter().map(|entry| entry.embedding.clone()).collect()
    }

    /// Nudge the blend ratio from the RMS error of recent forecasts.
    ///
    /// Returns the (possibly unchanged) ratio. Mismatched or empty inputs
    /// leave it alone.
    pub fn adapt_blend_ratio(&mut self, predictions: &[Vec<f64>], actuals: &[Vec<f64>]) -> f64 {
        let Some(rms) = rms_error(predictions, actuals) else {
            return self.blend_ratio;
        };
        if rms > HIGH_ERROR && self.blend_ratio < BLEND_CEILING {
            self.blend_ratio = (self.blend_ratio + BLEND_STEP).min(BLEND_CEILING);
        } else if rms < LOW_ERROR && self.blend_ratio > BLEND_FLOOR {
            self.blend_ratio = (self.blend_ratio - BLEND_STEP).max(BLEND_FLOOR);
        }
        self.blend_ratio
    }
}

fn rms_error(predictions: &[Vec<f64>], actuals: &[Vec<f64>]) -> Option<f64> {
    if predictions.is_empty() || predictions.len() != actuals.len() {
        return None;
    }
    let mut total = 0.0;
    let mut count = 0usize;
    for (prediction, actual) in predictions.iter().zip(actuals) {
        if prediction.len() != actual.len() {
            return None;
        }
        total += prediction
            .iter()
            .zip(actual)
            .map(|(p, a)| (p - a).powi(2))
            .sum::<f64>();
        count += prediction.len();
    }
    if count == 0 {
        return None;
    }
    Some((total / count as f64).sqrt())
}
