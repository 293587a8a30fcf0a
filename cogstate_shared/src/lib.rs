//! Cognitive State Shared Library
//!
//! Types shared between the forecasting engine and the collaborators that
//! produce observations (voice features, text affect scoring).
//!
//! This library provides:
//! - The five named state dimensions and their canonical ordering
//! - Time-stamped raw observation vectors
//! - Conversion from raw affect scores into the observation layout

pub mod dimension;
pub mod observation;

pub use dimension::{dimension_label, StateDimension, STATE_DIMENSIONS};
pub use observation::StateObservation;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
