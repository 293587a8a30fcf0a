//! Raw observation vectors handed to the forecasting engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::{StateDimension, STATE_DIMENSIONS};

/// A single time-stamped observation of the psychological state.
///
/// Producers may sample irregularly; the engine handles gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateObservation {
    pub values: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

impl StateObservation {
    pub fn new(values: Vec<f64>, timestamp: DateTime<Utc>) -> Self {
        Self { values, timestamp }
    }

    /// Build the canonical five-dimensional observation from affect scores.
    ///
    /// All scores are expected in `[0, 1]` and are clamped. Risk is stored as
    /// the inverted depression score and resources as the inverted stress
    /// score.
    pub fn from_affect_scores(
        valence: f64,
        arousal: f64,
        dominance: f64,
        depression: f64,
        stress: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut values = vec![0.0; STATE_DIMENSIONS];
        values[StateDimension::Valence.index()] = clamp_unit(valence);
        values[StateDimension::Arousal.index()] = clamp_unit(arousal);
        values[StateDimension::Dominance.index()] = clamp_unit(dominance);
        values[StateDimension::Risk.index()] = 1.0 - clamp_unit(depression);
        values[StateDimension::Resources.index()] = 1.0 - clamp_unit(stress);
        Self { values, timestamp }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, dimension: StateDimension) -> Option<f64> {
        self.values.get(dimension.index()).copied()
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
