//! Critical-transition detectors over a state history.
//!
//! Per dimension, the window just before the latest one ("early") is compared
//! with the latest window ("late") for rising lag-1 autocorrelation, rising
//! variance and flickering. Network-wide, the average absolute pairwise
//! correlation of the first half of the history is compared with the second
//! half.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cogstate_shared::dimension_label;

use super::statistics::{
    average_abs_correlation, column, lag1_autocorrelation, mean_crossing_rate, variance,
    VARIANCE_EPSILON,
};
use crate::linalg::clamp_unit;
use crate::state::Trajectory;

/// Minimum rise in lag-1 autocorrelation between windows.
const AUTOCORRELATION_RISE: f64 = 0.1;
/// Late-window autocorrelation required before slowing down is reported.
const AUTOCORRELATION_FLOOR: f64 = 0.5;
/// Late-window autocorrelation above which a time-to-transition is estimated.
const AUTOCORRELATION_TIMING: f64 = 0.7;
/// Cap on the estimated time to transition, in hours.
const MAX_TRANSITION_HOURS: f64 = 48.0;
/// Relative variance increase required for a variance signal.
const VARIANCE_RISE: f64 = 0.5;
/// Upper bound on reported variance strength.
const MAX_VARIANCE_STRENGTH: f64 = 10.0;
/// Relative excess of late crossing rate over the expected rate.
const FLICKER_EXCESS: f64 = 0.3;
/// Floor on the expected mean-crossing rate.
const FLICKER_BASE_RATE: f64 = 0.1;
const FLICKER_TRANSITION_HOURS: f64 = 12.0;
const FLICKER_CONFIDENCE: f64 = 0.6;
/// Relative rise of average absolute correlation between halves.
const CONNECTIVITY_RISE: f64 = 0.3;
/// Floor on the early-half correlation used as the denominator.
const CONNECTIVITY_BASE: f64 = 0.05;
/// Leading forecast states scanned for warnings (one day of hourly steps).
const TRAJECTORY_SCAN_STATES: usize = 24;
/// Smallest scan window whose lag-1 autocorrelation can exceed the floor.
const TRAJECTORY_MIN_WINDOW: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Critical slowing down: rising lag-1 autocorrelation.
    Autocorrelation,
    Variance,
    Flickering,
    /// Rising coupling between dimensions.
    Connectivity,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::Autocorrelation => "autocorrelation",
            WarningKind::Variance => "variance",
            WarningKind::Flickering => "flickering",
            WarningKind::Connectivity => "connectivity",
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyWarningSignal {
    pub kind: WarningKind,
    /// Affected dimension; `None` for network-wide signals.
    pub dimension: Option<usize>,
    pub label: String,
    pub strength: f64,
    pub time_to_transition_hours: Option<f64>,
    pub confidence: f64,
    pub recommendation: String,
}

/// Run every detector over `history` (one state vector per timestep).
///
/// Returns no signals when fewer than `2 × window_size` samples exist or the
/// window size is below 2.
pub fn detect_early_warnings(
    history: &[Vec<f64>],
    window_size: usize,
    dt_hours: f64,
) -> Vec<EarlyWarningSignal> {
    if window_size < 2 || history.len() < 2 * window_size {
        return Vec::new();
    }
    let dim = history.iter().map(|row| row.len()).min().unwrap_or(0);
    let n = history.len();
    let early_rows = &history[n - 2 * window_size..n - window_size];
    let late_rows = &history[n - window_size..];

    let mut signals = Vec::new();
    for index in 0..dim {
        let early = column(early_rows, index);
        let late = column(late_rows, index);
        let label = dimension_label(index);

        signals.extend(autocorrelation_signal(&early, &late, index, &label, dt_hours));
        signals.extend(variance_signal(&early, &late, index, &label));
        signals.extend(flickering_signal(&early, &late, index, &label));
    }
    signals.extend(connectivity_signal(history, dim));

    debug!(
        samples = n,
        window_size,
        signals = signals.len(),
        "early-warning scan complete"
    );
    signals
}

/// Scan the leading states of a forecast, split into two equal windows.
///
/// Forecasts too short to fill two windows of `TRAJECTORY_MIN_WINDOW`
/// states yield no signals.
pub(crate) fn trajectory_warnings(
    trajectory: &Trajectory,
    dt_hours: f64,
) -> Vec<EarlyWarningSignal> {
    let history: Vec<Vec<f64>> = trajectory
        .iter()
        .take(TRAJECTORY_SCAN_STATES)
        .map(|state| state.observed.clone())
        .collect();
    let window = history.len() / 2;
    if window < TRAJECTORY_MIN_WINDOW {
        return Vec::new();
    }
    detect_early_warnings(&history, window, dt_hours)
}

fn autocorrelation_signal(
    early: &[f64],
    late: &[f64],
    index: usize,
    label: &str,
    dt_hours: f64,
) -> Option<EarlyWarningSignal> {
    let early_ac = lag1_autocorrelation(early);
    let late_ac = lag1_autocorrelation(late);
    if late_ac - early_ac <= AUTOCORRELATION_RISE || late_ac <= AUTOCORRELATION_FLOOR {
        return None;
    }
    let strength = (late_ac - early_ac) / (1.0 - early_ac).max(VARIANCE_EPSILON);
    let time_to_transition_hours = if late_ac >= AUTOCORRELATION_TIMING {
        Some((dt_hours / (1.0 - late_ac).max(VARIANCE_EPSILON)).min(MAX_TRANSITION_HOURS))
    } else {
        None
    };
    Some(EarlyWarningSignal {
        kind: WarningKind::Autocorrelation,
        dimension: Some(index),
        label: label.to_string(),
        strength: clamp_unit(strength),
        time_to_transition_hours,
        confidence: clamp_unit(late_ac),
        recommendation: format!(
            "{} is recovering more slowly from perturbations; schedule a stabilising check-in before it shifts.",
            label
        ),
    })
}

fn variance_signal(
    early: &[f64],
    late: &[f64],
    index: usize,
    label: &str,
) -> Option<EarlyWarningSignal> {
    let early_var = variance(early);
    let late_var = variance(late);
    if late_var <= VARIANCE_EPSILON {
        return None;
    }
    let strength =
        ((late_var - early_var) / early_var.max(VARIANCE_EPSILON)).min(MAX_VARIANCE_STRENGTH);
    if strength <= VARIANCE_RISE {
        return None;
    }
    Some(EarlyWarningSignal {
        kind: WarningKind::Variance,
        dimension: Some(index),
        label: label.to_string(),
        strength,
        time_to_transition_hours: None,
        confidence: clamp_unit(strength / (1.0 + strength)),
        recommendation: format!(
            "{} is fluctuating more widely than before; monitor closely and reinforce daily routines.",
            label
        ),
    })
}

fn flickering_signal(
    early: &[f64],
    late: &[f64],
    index: usize,
    label: &str,
) -> Option<EarlyWarningSignal> {
    let expected = mean_crossing_rate(early).max(FLICKER_BASE_RATE);
    let observed = mean_crossing_rate(late);
    if observed <= expected * (1.0 + FLICKER_EXCESS) {
        return None;
    }
    Some(EarlyWarningSignal {
        kind: WarningKind::Flickering,
        dimension: Some(index),
        label: label.to_string(),
        strength: clamp_unit((observed - expected) / expected),
        time_to_transition_hours: Some(FLICKER_TRANSITION_HOURS),
        confidence: FLICKER_CONFIDENCE,
        recommendation: format!(
            "{} is switching back and forth between states; a transition may be close, arrange a follow-up.",
            label
        ),
    })
}

fn connectivity_signal(history: &[Vec<f64>], dim: usize) -> Option<EarlyWarningSignal> {
    if dim < 2 {
        return None;
    }
    let half = history.len() / 2;
    let split = |rows: &[Vec<f64>]| -> Vec<Vec<f64>> {
        (0..dim).map(|index| column(rows, index)).collect()
    };
    let early = average_abs_correlation(&split(&history[..half]));
    let late = average_abs_correlation(&split(&history[half..]));
    let increase = (late - early) / early.max(CONNECTIVITY_BASE);
    if increase <= CONNECTIVITY_RISE {
        return None;
    }
    Some(EarlyWarningSignal {
        kind: WarningKind::Connectivity,
        dimension: None,
        label: "network".to_string(),
        strength: clamp_unit(increase),
        time_to_transition_hours: None,
        confidence: clamp_unit(late),
        recommendation: "State dimensions are becoming tightly coupled; a change in one area \
                         may cascade, consider a broad check-in."
            .to_string(),
    })
}
