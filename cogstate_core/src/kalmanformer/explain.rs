//! Attention summaries over a user's buffered observations.

use std::fmt;

use chrono::{DateTime, Utc};
use cogstate_shared::dimension_label;
use serde::{Deserialize, Serialize};

use super::encoder::compute_attention_weights;
use super::state::WindowEntry;
use crate::linalg::Matrix;
use crate::ring::RingBuffer;

/// Number of influential observations reported.
pub const TOP_INFLUENCES: usize = 5;
/// Positions averaged at each end of the window for the recency test.
const RECENCY_SPAN: usize = 5;
const RECENCY_RATIO: f64 = 1.5;
/// Attention mass the newest row must put on the last two positions for
/// the window to count as locally focused.
const LOCAL_MASS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalPattern {
    /// Recent observations draw markedly more attention than early ones.
    RecencyBias,
    /// The newest position attends to similar states further back.
    PatternMatching,
    Uniform,
}

impl TemporalPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalPattern::RecencyBias => "recency_bias",
            TemporalPattern::PatternMatching => "pattern_matching",
            TemporalPattern::Uniform => "uniform",
        }
    }
}

impl fmt::Display for TemporalPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluentialObservation {
    /// Window position, 0 = oldest.
    pub position: usize,
    pub timestamp: DateTime<Utc>,
    /// Mean attention received from every position.
    pub attention: f64,
    pub dominant_dimension: usize,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionExplanation {
    /// Row-normalised attention matrix over the window.
    pub attention: Vec<Vec<f64>>,
    pub top_influences: Vec<InfluentialObservation>,
    pub pattern: TemporalPattern,
}

impl AttentionExplanation {
    /// Result for windows too short to explain.
    pub fn neutral() -> Self {
        Self {
            attention: Vec::new(),
            top_influences: Vec::new(),
            pattern: TemporalPattern::Uniform,
        }
    }
}

/// Raw dimension with the largest `|x_d| · Σ_e |W_emb[e][d]|`.
fn dominant_dimension(observation: &[f64], embedding: &Matrix) -> usize {
    observation
        .iter()
        .enumerate()
        .map(|(d, x)| {
            let column: f64 = embedding.column(d).iter().map(|w| w.abs()).sum();
            (d, x.abs() * column)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(d, _)| d)
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn classify(influence: &[f64], attention: &[Vec<f64>]) -> TemporalPattern {
    let span = RECENCY_SPAN.min(influence.len());
    let early = average(&influence[..span]);
    let late = average(&influence[influence.len() - span..]);
    if early > 0.0 && late >= RECENCY_RATIO * early {
        return TemporalPattern::RecencyBias;
    }

    let local_mass: f64 = attention
        .last()
        .map(|row| row.iter().rev().take(2).sum())
        .unwrap_or(1.0);
    if local_mass < LOCAL_MASS {
        TemporalPattern::PatternMatching
    } else {
        TemporalPattern::Uniform
    }
}

/// Self-attention over buffered embeddings, the most attended positions and
/// the overall temporal pattern.
pub(crate) fn explain_window(
    window: &RingBuffer<WindowEntry>,
    observation_embedding: &Matrix,
    temperature: f64,
) -> AttentionExplanation {
    if window.len() < 2 {
        return AttentionExplanation::neutral();
    }
    let embeddings: Vec<Vec<f64>> = window.iter().map(|e| e.embedding.clone()).collect();
    let attention = compute_attention_weights(&embeddings, &embeddings, temperature);

    let n = attention.len();
    let influence: Vec<f64> = (0..n)
        .map(|col| attention.iter().map(|row| row[col]).sum::<f64>() / n as f64)
        .collect();

    let mut ranked: Vec<usize> = (0..n).collect();
    ranked.sort_by(|&a, &b| influence[b].total_cmp(&influence[a]));
    let top_influences = ranked
        .into_iter()
        .take(TOP_INFLUENCES)
        .filter_map(|position| {
            let entry = window.get(position)?;
            let dominant = dominant_dimension(&entry.observation, observation_embedding);
            Some(InfluentialObservation {
                position,
                timestamp: entry.timestamp,
                attention: influence[position],
                dominant_dimension: dominant,
                label: dimension_label(dominant),
            })
        })
        .collect();

    let pattern = classify(&influence, &attention);
    AttentionExplanation {
        attention,
        top_influences,
        pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window(embeddings: &[Vec<f64>]) -> RingBuffer<WindowEntry> {
        let start = Utc::now();
        let mut buffer = RingBuffer::with_capacity(embeddings.len().max(1));
        for (i, embedding) in embeddings.iter().enumerate() {
            buffer.push(WindowEntry {
                observation: vec![0.1, 0.9],
                timestamp: start + Duration::hours(i as i64),
                embedding: embedding.clone(),
            });
        }
        buffer
    }

    #[test]
    fn short_window_is_neutral() {
        let explanation = explain_window(&window(&[vec![1.0, 0.0]]), &Matrix::identity(2), 1.0);
        assert_eq!(explanation, AttentionExplanation::neutral());
    }

    #[test]
    fn strong_recent_embeddings_show_recency_bias() {
        let mut embeddings = vec![vec![0.0, 0.0]; 5];
        embeddings.extend(vec![vec![3.0, 0.0]; 5]);
        let explanation = explain_window(&window(&embeddings), &Matrix::identity(2), 1.0);
        assert_eq!(explanation.pattern, TemporalPattern::RecencyBias);
        assert_eq!(explanation.top_influences.len(), TOP_INFLUENCES);
        assert!(explanation.top_influences.iter().all(|o| o.position >= 5));
        for row in &explanation.attention {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn alternating_states_are_pattern_matching() {
        let embeddings: Vec<Vec<f64>> = (0..10)
            .map(|i| if i % 2 == 0 { vec![0.0, 3.0] } else { vec![3.0, 0.0] })
            .collect();
        let explanation = explain_window(&window(&embeddings), &Matrix::identity(2), 1.0);
        assert_eq!(explanation.pattern, TemporalPattern::PatternMatching);
    }

    #[test]
    fn identical_embeddings_are_uniform() {
        let buffer = window(&vec![vec![1.0, 1.0]; 3]);
        let explanation = explain_window(&buffer, &Matrix::identity(2), 1.0);
        assert_eq!(explanation.pattern, TemporalPattern::Uniform);
        assert_eq!(explanation.top_influences.len(), 3);
    }

    #[test]
    fn influences_are_tagged_with_their_dominant_dimension() {
        let buffer = window(&vec![vec![1.0, 1.0]; 3]);
        let explanation = explain_window(&buffer, &Matrix::identity(2), 1.0);
        let first = &explanation.top_influences[0];
        assert_eq!(first.dominant_dimension, 1);
        assert_eq!(first.label, "arousal");
        assert_eq!(TemporalPattern::RecencyBias.to_string(), "recency_bias");
    }
}
