//! Named latent dimensions of the psychological state vector.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of named dimensions in the canonical state layout.
pub const STATE_DIMENSIONS: usize = 5;

/// One axis of the canonical state vector.
///
/// The discriminant is the index of the dimension inside every state,
/// observation and weight vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateDimension {
    Valence = 0,
    Arousal = 1,
    Dominance = 2,
    /// Inverted depression score.
    Risk = 3,
    /// Inverted stress score.
    Resources = 4,
}

impl StateDimension {
    pub const ALL: [StateDimension; STATE_DIMENSIONS] = [
        StateDimension::Valence,
        StateDimension::Arousal,
        StateDimension::Dominance,
        StateDimension::Risk,
        StateDimension::Resources,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateDimension::Valence => "valence",
            StateDimension::Arousal => "arousal",
            StateDimension::Dominance => "dominance",
            StateDimension::Risk => "risk",
            StateDimension::Resources => "resources",
        }
    }
}

impl fmt::Display for StateDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StateDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "valence" => Ok(StateDimension::Valence),
            "arousal" => Ok(StateDimension::Arousal),
            "dominance" => Ok(StateDimension::Dominance),
            "risk" => Ok(StateDimension::Risk),
            "resources" => Ok(StateDimension::Resources),
            _ => Err(format!("unknown state dimension '{}'", s)),
        }
    }
}

/// Human-readable label for a dimension index.
///
/// Engines configured with more than the five canonical dimensions label the
/// extra axes `latent_<index>`.
pub fn dimension_label(index: usize) -> String {
    match StateDimension::from_index(index) {
        Some(dimension) => dimension.as_str().to_string(),
        None => format!("latent_{}", index),
    }
}
