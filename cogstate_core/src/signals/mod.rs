//! Early-warning signals of critical transitions.

pub mod detector;
pub mod statistics;

pub use detector::{detect_early_warnings, EarlyWarningSignal, WarningKind};
pub use statistics::{
    average_abs_correlation, lag1_autocorrelation, mean, mean_crossing_rate,
    pearson_correlation, variance,
};
