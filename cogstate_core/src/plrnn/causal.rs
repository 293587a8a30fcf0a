//! Causal-graph extraction and counterfactual intervention summaries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cogstate_shared::dimension_label;

use super::weights::ModelWeights;
use crate::linalg::clamp_unit;
use crate::state::Trajectory;

/// Off-diagonal weights at or below this magnitude are not edges.
pub const EDGE_THRESHOLD: f64 = 0.1;
/// Steps simulated by an intervention.
pub const INTERVENTION_HORIZON: usize = 24;
/// Fraction of the peak effect below which an intervention has worn off.
const DECAY_FRACTION: f64 = 0.1;
/// Horizon effect on a non-target dimension that counts as a side effect.
const SIDE_EFFECT_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalNode {
    pub index: usize,
    pub label: String,
    pub self_weight: f64,
    pub centrality: f64,
    /// Always 0; the network is built from weights alone.
    pub value: f64,
}

/// Directed influence `source → target` taken from `W[target][source]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalEdge {
    pub source: usize,
    pub target: usize,
    pub weight: f64,
    pub lag: usize,
    pub significance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Edges over possible directed off-diagonal pairs.
    pub density: f64,
    pub most_central: Option<usize>,
    /// Pairs `(i, j)`, `i < j`, with significant weights in both directions.
    pub feedback_loops: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalNetwork {
    pub nodes: Vec<CausalNode>,
    pub edges: Vec<CausalEdge>,
    pub metrics: NetworkMetrics,
}

impl CausalNetwork {
    /// Snapshot of the influence structure encoded in `A` and `W`.
    pub fn from_weights(weights: &ModelWeights) -> Self {
        let dim = weights.dim();
        let w = &weights.recurrent;
        let scale = dim.max(1) as f64;

        let nodes: Vec<CausalNode> = (0..dim)
            .map(|i| {
                let row: f64 = w.row(i).iter().map(|v| v.abs()).sum();
                let col: f64 = w.column(i).iter().map(|v| v.abs()).sum();
                CausalNode {
                    index: i,
                    label: dimension_label(i),
                    self_weight: weights.self_weights[i],
                    centrality: (row + col) / (2.0 * scale),
                    value: 0.0,
                }
            })
            .collect();

        let mut edges = Vec::new();
        for target in 0..dim {
            for source in 0..dim {
                let weight = w[(target, source)];
                if source != target && weight.abs() > EDGE_THRESHOLD {
                    edges.push(CausalEdge {
                        source,
                        target,
                        weight,
                        lag: 1,
                        significance: (weight.abs() * scale).min(1.0),
                    });
                }
            }
        }

        let mut feedback_loops = Vec::new();
        for i in 0..dim {
            for j in (i + 1)..dim {
                if w[(i, j)].abs() > EDGE_THRESHOLD && w[(j, i)].abs() > EDGE_THRESHOLD {
                    feedback_loops.push((i, j));
                }
            }
        }

        let possible = dim * dim.saturating_sub(1);
        let density = if possible == 0 {
            0.0
        } else {
            edges.len() as f64 / possible as f64
        };
        let most_central = nodes
            .iter()
            .max_by(|a, b| a.centrality.total_cmp(&b.centrality))
            .map(|node| node.index);

        Self {
            nodes,
            edges,
            metrics: NetworkMetrics {
                density,
                most_central,
                feedback_loops,
            },
        }
    }

    pub fn edges_from(&self, source: usize) -> impl Iterator<Item = &CausalEdge> {
        self.edges.iter().filter(move |edge| edge.source == source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionKind {
    Increase,
    Decrease,
    /// Pull the target towards zero with half its current value.
    Stabilize,
}

impl InterventionKind {
    /// Constant input applied to the target at every step.
    pub fn input_for(&self, magnitude: f64, current: f64) -> f64 {
        match self {
            InterventionKind::Increase => magnitude,
            InterventionKind::Decrease => -magnitude,
            InterventionKind::Stabilize => -0.5 * current,
        }
    }
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterventionKind::Increase => "increase",
            InterventionKind::Decrease => "decrease",
            InterventionKind::Stabilize => "stabilize",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for InterventionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "increase" => Ok(InterventionKind::Increase),
            "decrease" => Ok(InterventionKind::Decrease),
            "stabilize" | "stabilise" => Ok(InterventionKind::Stabilize),
            other => Err(format!("unknown intervention kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub dimension: usize,
    pub label: String,
    pub effect: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionResult {
    pub target: usize,
    pub kind: InterventionKind,
    pub magnitude: f64,
    /// Intervened minus baseline observed state, one row per step.
    pub effects: Vec<Vec<f64>>,
    /// Effect per dimension at the horizon.
    pub net_effect: Vec<f64>,
    /// 1-based step of the largest absolute effect on the target.
    pub time_to_peak: usize,
    /// Steps after the peak until the target effect falls below 10% of it.
    pub duration: usize,
    pub side_effects: Vec<SideEffect>,
    pub confidence: f64,
}

impl InterventionResult {
    /// Target effect at the step of peak magnitude.
    pub fn peak_effect(&self) -> f64 {
        self.time_to_peak
            .checked_sub(1)
            .and_then(|step| self.effects.get(step))
            .and_then(|row| row.get(self.target).copied())
            .unwrap_or(0.0)
    }
}

/// Compare an intervened rollout against its baseline.
pub(crate) fn summarize_intervention(
    target: usize,
    kind: InterventionKind,
    magnitude: f64,
    baseline: &Trajectory,
    intervened: &Trajectory,
) -> InterventionResult {
    let effects: Vec<Vec<f64>> = baseline
        .iter()
        .zip(intervened.iter())
        .map(|(base, moved)| {
            moved
                .observed
                .iter()
                .zip(&base.observed)
                .map(|(m, b)| m - b)
                .collect()
        })
        .collect();

    let target_series: Vec<f64> = effects
        .iter()
        .map(|row| row.get(target).copied().unwrap_or(0.0))
        .collect();
    let (peak_index, peak) = target_series
        .iter()
        .enumerate()
        .fold((0, 0.0_f64), |(best_i, best), (i, v)| {
            if v.abs() > best.abs() {
                (i, *v)
            } else {
                (best_i, best)
            }
        });
    let duration = if peak == 0.0 {
        0
    } else {
        target_series[peak_index + 1..]
            .iter()
            .position(|v| v.abs() < DECAY_FRACTION * peak.abs())
            .map(|offset| offset + 1)
            .unwrap_or(target_series.len() - (peak_index + 1))
    };

    let net_effect = effects.last().cloned().unwrap_or_default();
    let side_effects = net_effect
        .iter()
        .enumerate()
        .filter(|(dim, effect)| *dim != target && effect.abs() > SIDE_EFFECT_THRESHOLD)
        .map(|(dim, effect)| SideEffect {
            dimension: dim,
            label: dimension_label(dim),
            effect: *effect,
        })
        .collect();
    let horizon_uncertainty = intervened
        .last()
        .and_then(|state| state.uncertainty.get(target).copied())
        .unwrap_or(1.0);

    InterventionResult {
        target,
        kind,
        magnitude,
        time_to_peak: if effects.is_empty() { 0 } else { peak_index + 1 },
        effects,
        net_effect,
        duration,
        side_effects,
        confidence: clamp_unit(1.0 - horizon_uncertainty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlrnnConfig;
    use crate::linalg::Matrix;
    use crate::state::LatentState;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weights_with(recurrent: Matrix) -> ModelWeights {
        let config = PlrnnConfig {
            latent_dim: 3,
            ..PlrnnConfig::default()
        };
        let mut weights = ModelWeights::initialize(&config, &mut StdRng::seed_from_u64(1));
        weights.recurrent = recurrent;
        weights
    }

    #[test]
    fn edges_follow_threshold() {
        let w = Matrix::from_rows(&[
            vec![0.0, 0.3, 0.05],
            vec![-0.2, 0.0, 0.0],
            vec![0.0, 0.0, 0.0],
        ])
        .unwrap();
        let network = CausalNetwork::from_weights(&weights_with(w));

        assert_eq!(network.edges.len(), 2);
        let edge = network
            .edges
            .iter()
            .find(|e| e.source == 1 && e.target == 0)
            .expect("1 → 0");
        assert!((edge.weight - 0.3).abs() < 1e-12);
        assert_eq!(edge.lag, 1);
        assert!((edge.significance - 0.9).abs() < 1e-12);
        assert_eq!(network.metrics.feedback_loops, vec![(0, 1)]);
        assert!((network.metrics.density - 2.0 / 6.0).abs() < 1e-12);
        assert_eq!(network.edges_from(0).count(), 1);
    }

    #[test]
    fn centrality_uses_row_and_column_mass() {
        let w = Matrix::from_rows(&[
            vec![0.0, 0.6, 0.0],
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0],
        ])
        .unwrap();
        let network = CausalNetwork::from_weights(&weights_with(w));
        assert!((network.nodes[0].centrality - 0.1).abs() < 1e-12);
        assert!((network.nodes[1].centrality - 0.1).abs() < 1e-12);
        assert_eq!(network.nodes[2].centrality, 0.0);
        assert!(network.nodes.iter().all(|n| n.value == 0.0));
        assert_eq!(network.nodes[0].label, "valence");
    }

    #[test]
    fn intervention_kind_parsing() {
        assert_eq!("Increase".parse::<InterventionKind>(), Ok(InterventionKind::Increase));
        assert_eq!("stabilise".parse::<InterventionKind>(), Ok(InterventionKind::Stabilize));
        assert!("boost".parse::<InterventionKind>().is_err());
        assert_eq!(InterventionKind::Stabilize.input_for(1.0, 0.4), -0.2);
    }

    #[test]
    fn summary_reports_peak_and_decay() {
        let now = Utc::now();
        let mut baseline = Trajectory::default();
        let mut intervened = Trajectory::default();
        for (i, effect) in [0.2, 0.5, 0.3, 0.04, 0.01].iter().enumerate() {
            let mut base = LatentState::from_values(vec![0.0, 0.0], 0.1, now);
            base.timestep = i as u64;
            let mut moved = LatentState::from_values(vec![*effect, 0.2], 0.3, now);
            moved.timestep = i as u64;
            baseline.push(base);
            intervened.push(moved);
        }
        let summary =
            summarize_intervention(0, InterventionKind::Increase, 1.0, &baseline, &intervened);
        assert_eq!(summary.time_to_peak, 2);
        assert!((summary.peak_effect() - 0.5).abs() < 1e-12);
        assert_eq!(summary.duration, 2);
        assert_eq!(summary.side_effects.len(), 1);
        assert_eq!(summary.side_effects[0].dimension, 1);
        assert!((summary.confidence - 0.7).abs() < 1e-12);
        assert_eq!(summary.net_effect, vec![0.01, 0.2]);
    }
}
