//! Latent state, trajectories and forecast containers shared by both engines.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cogstate_shared::StateDimension;

use crate::signals::EarlyWarningSignal;

/// z-score of the two-sided 95% interval.
pub const CONFIDENCE_Z: f64 = 1.96;

/// Time-stamped, uncertainty-annotated latent state.
///
/// `latent`, `observed` and `uncertainty` always share the engine's
/// configured dimensionality; every uncertainty component stays within
/// `[0, ceiling]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentState {
    pub latent: Vec<f64>,
    pub observed: Vec<f64>,
    pub uncertainty: Vec<f64>,
    pub timestamp: DateTime<Utc>,
    pub timestep: u64,
}

impl LatentState {
    /// State whose latent and observed vectors both equal `values`.
    pub fn from_values(values: Vec<f64>, uncertainty: f64, timestamp: DateTime<Utc>) -> Self {
        let dim = values.len();
        Self {
            observed: values.clone(),
            latent: values,
            uncertainty: vec![uncertainty.max(0.0); dim],
            timestamp,
            timestep: 0,
        }
    }

    pub fn zeros(dim: usize, timestamp: DateTime<Utc>) -> Self {
        Self::from_values(vec![0.0; dim], 0.0, timestamp)
    }

    pub fn dim(&self) -> usize {
        self.latent.len()
    }

    /// Observed value of a named dimension, if the state has it.
    pub fn value(&self, dimension: StateDimension) -> Option<f64> {
        self.observed.get(dimension.index()).copied()
    }

    pub fn is_consistent(&self, dim: usize) -> bool {
        self.latent.len() == dim && self.observed.len() == dim && self.uncertainty.len() == dim
    }

    pub fn mean_uncertainty(&self) -> f64 {
        if self.uncertainty.is_empty() {
            return 0.0;
        }
        self.uncertainty.iter().sum::<f64>() / self.uncertainty.len() as f64
    }
}

/// Advance a timestamp by a fractional number of hours.
pub(crate) fn advance_hours(timestamp: DateTime<Utc>, hours: f64) -> DateTime<Utc> {
    let millis = (hours * 3_600_000.0).round() as i64;
    timestamp + Duration::milliseconds(millis)
}

/// Hours elapsed between two timestamps (negative when `to` precedes `from`).
pub(crate) fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

/// Finite, append-only sequence of states produced by repeated transitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    states: Vec<LatentState>,
}

impl Trajectory {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            states: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, state: LatentState) {
        self.states.push(state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[LatentState] {
        &self.states
    }

    pub fn last(&self) -> Option<&LatentState> {
        self.states.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LatentState> {
        self.states.iter()
    }

    /// Observed values of one dimension across the trajectory.
    pub fn observed_series(&self, index: usize) -> Vec<f64> {
        self.states
            .iter()
            .filter_map(|state| state.observed.get(index).copied())
            .collect()
    }

    /// Per-step uncertainty vectors.
    pub fn variances(&self) -> Vec<Vec<f64>> {
        self.states
            .iter()
            .map(|state| state.uncertainty.clone())
            .collect()
    }
}

/// Symmetric `mean ± 1.96·√variance` band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBand {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl ConfidenceBand {
    pub fn from_mean_variance(mean: &[f64], variance: &[f64]) -> Self {
        let (lower, upper) = mean
            .iter()
            .zip(variance)
            .map(|(m, v)| {
                let half = CONFIDENCE_Z * v.max(0.0).sqrt();
                (m - half, m + half)
            })
            .unzip();
        Self { lower, upper }
    }

    pub fn width(&self, index: usize) -> Option<f64> {
        Some(self.upper.get(index)? - self.lower.get(index)?)
    }

    pub fn contains(&self, values: &[f64]) -> bool {
        values
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .all(|(v, (lo, hi))| *v >= *lo && *v <= *hi)
    }
}

/// Multi-step forecast with uncertainty and early-warning annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Point forecast in observed space at the horizon.
    pub mean: Vec<f64>,
    /// Per-dimension variance at the horizon.
    pub variance: Vec<f64>,
    pub confidence_band: ConfidenceBand,
    pub horizon: usize,
    pub trajectory: Trajectory,
    pub early_warnings: Vec<EarlyWarningSignal>,
}

impl Prediction {
    /// Per-step variance vectors along the trajectory.
    pub fn step_variances(&self) -> Vec<Vec<f64>> {
        self.trajectory.variances()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn band_uses_sqrt_variance() {
        let band = ConfidenceBand::from_mean_variance(&[1.0, 0.0], &[0.25, 0.0]);
        assert!((band.lower[0] - (1.0 - 0.98)).abs() < 1e-12);
        assert!((band.upper[0] - (1.0 + 0.98)).abs() < 1e-12);
        assert_eq!(band.width(1), Some(0.0));
        assert!(band.contains(&[1.5, 0.0]));
        assert!(!band.contains(&[3.0, 0.0]));
    }

    #[test]
    fn advance_hours_is_exact_for_whole_hours() {
        let later = advance_hours(ts(), 1.0);
        assert_eq!(later, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
        assert!((hours_between(ts(), later) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn from_values_mirrors_latent_and_observed() {
        let state = LatentState::from_values(vec![0.1, 0.2], 0.3, ts());
        assert_eq!(state.latent, state.observed);
        assert!(state.is_consistent(2));
        assert!((state.mean_uncertainty() - 0.3).abs() < 1e-12);
        assert_eq!(state.value(StateDimension::Arousal), Some(0.2));
        assert_eq!(state.value(StateDimension::Risk), None);
    }
}
