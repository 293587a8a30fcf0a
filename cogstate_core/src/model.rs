//! The capability contract shared by both dynamics engines.
//!
//! [`ForecastEngine`] covers what every engine can do: forecast from a state,
//! convert a state to an observation, and load or hand out weights. Engine
//! specific capabilities live in [`CausalDynamics`] (PLRNN) and
//! [`AttentionExplainer`] (KalmanFormer). [`DynamicsModel`] selects an engine
//! at the call site, using [`LatentState`] as the common state currency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cogstate_shared::StateObservation;

use crate::error::EngineResult;
use crate::kalmanformer::{
    AttentionExplanation, KalmanFormerEngine, KalmanFormerState, KalmanFormerWeights,
};
use crate::plrnn::{CausalNetwork, InterventionKind, InterventionResult, ModelWeights, PlrnnEngine};
use crate::state::{LatentState, Prediction};

/// Training bookkeeping carried by every weight set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub last_trained: Option<DateTime<Utc>>,
    /// Cumulative number of supervised transitions seen.
    pub training_samples: u64,
    pub best_validation_loss: f64,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            last_trained: None,
            training_samples: 0,
            best_validation_loss: f64::INFINITY,
        }
    }
}

impl ModelMetadata {
    pub(crate) fn record_training(&mut self, transitions: usize) {
        self.training_samples += transitions as u64;
        self.last_trained = Some(Utc::now());
    }

    pub(crate) fn record_validation(&mut self, loss: f64) {
        if loss.is_finite() && loss < self.best_validation_loss {
            self.best_validation_loss = loss;
        }
    }
}

/// Loss below which a training call reports convergence.
pub const CONVERGENCE_LOSS: f64 = 0.1;

/// Outcome of `train_online` / `train_batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult<W> {
    /// Average per-transition mean squared error; infinite when nothing
    /// could be trained.
    pub loss: f64,
    pub converged: bool,
    /// Snapshot of the weights after the call.
    pub weights: W,
}

impl<W> TrainingResult<W> {
    pub(crate) fn new(loss: f64, weights: W) -> Self {
        Self {
            loss,
            converged: loss < CONVERGENCE_LOSS,
            weights,
        }
    }
}

/// Operations common to every dynamics engine.
pub trait ForecastEngine {
    type Weights;
    type State;

    /// Multi-step forecast starting from `state`.
    fn forecast(&self, state: &Self::State, horizon: usize) -> EngineResult<Prediction>;

    /// Observation-space view of `state`.
    fn to_observation(&self, state: &Self::State) -> EngineResult<StateObservation>;

    fn load_weights(&mut self, weights: Self::Weights) -> EngineResult<()>;

    fn weights(&self) -> EngineResult<&Self::Weights>;
}

/// Engines with an explicit, inspectable recurrent structure.
pub trait CausalDynamics: ForecastEngine {
    fn causal_network(&self) -> EngineResult<CausalNetwork>;

    fn intervene(
        &self,
        state: &Self::State,
        target: usize,
        kind: InterventionKind,
        magnitude: f64,
    ) -> EngineResult<InterventionResult>;
}

/// Engines that can attribute their estimate to past observations.
pub trait AttentionExplainer: ForecastEngine {
    fn explain_state(&self, state: &Self::State) -> EngineResult<AttentionExplanation>;
}

impl ForecastEngine for PlrnnEngine {
    type Weights = ModelWeights;
    type State = LatentState;

    fn forecast(&self, state: &LatentState, horizon: usize) -> EngineResult<Prediction> {
        self.predict(state, horizon, None)
    }

    fn to_observation(&self, state: &LatentState) -> EngineResult<StateObservation> {
        PlrnnEngine::to_observation(self, state)
    }

    fn load_weights(&mut self, weights: Self::Weights) -> EngineResult<()> {
        PlrnnEngine::load_weights(self, weights)
    }

    fn weights(&self) -> EngineResult<&Self::Weights> {
        PlrnnEngine::weights(self)
    }
}

impl CausalDynamics for PlrnnEngine {
    fn causal_network(&self) -> EngineResult<CausalNetwork> {
        self.extract_causal_network()
    }

    fn intervene(
        &self,
        state: &LatentState,
        target: usize,
        kind: InterventionKind,
        magnitude: f64,
    ) -> EngineResult<InterventionResult> {
        self.simulate_intervention(state, target, kind, magnitude)
    }
}

impl ForecastEngine for KalmanFormerEngine {
    type Weights = KalmanFormerWeights;
    type State = KalmanFormerState;

    fn forecast(&self, state: &KalmanFormerState, horizon: usize) -> EngineResult<Prediction> {
        Ok(self.predict(state, horizon)?.prediction)
    }

    fn to_observation(&self, state: &KalmanFormerState) -> EngineResult<StateObservation> {
        KalmanFormerEngine::to_observation(self, state)
    }

    fn load_weights(&mut self, weights: Self::Weights) -> EngineResult<()> {
        KalmanFormerEngine::load_weights(self, weights)
    }

    fn weights(&self) -> EngineResult<&Self::Weights> {
        KalmanFormerEngine::weights(self)
    }
}

impl AttentionExplainer for KalmanFormerEngine {
    fn explain_state(&self, state: &KalmanFormerState) -> EngineResult<AttentionExplanation> {
        self.explain(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Plrnn,
    KalmanFormer,
}

/// An engine chosen at the call site, e.g. per user or per horizon.
#[derive(Debug)]
pub enum DynamicsModel {
    Plrnn(PlrnnEngine),
    KalmanFormer(KalmanFormerEngine),
}

impl DynamicsModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            DynamicsModel::Plrnn(_) => ModelKind::Plrnn,
            DynamicsModel::KalmanFormer(_) => ModelKind::KalmanFormer,
        }
    }

    /// Forecast from a latent state.
    ///
    /// The KalmanFormer path goes through
    /// [`KalmanFormerEngine::from_plrnn_state`], which starts from a diagonal
    /// covariance and a one-entry observation window.
    pub fn forecast(&self, state: &LatentState, horizon: usize) -> EngineResult<Prediction> {
        match self {
            DynamicsModel::Plrnn(engine) => engine.forecast(state, horizon),
            DynamicsModel::KalmanFormer(engine) => {
                let filter_state = engine.from_plrnn_state(state)?;
                engine.forecast(&filter_state, horizon)
            }
        }
    }

    pub fn to_observation(&self, state: &LatentState) -> EngineResult<StateObservation> {
        match self {
            DynamicsModel::Plrnn(engine) => PlrnnEngine::to_observation(engine, state),
            DynamicsModel::KalmanFormer(engine) => {
                let filter_state = engine.from_plrnn_state(state)?;
                KalmanFormerEngine::to_observation(engine, &filter_state)
            }
        }
    }

    pub fn as_causal(&self) -> Option<&PlrnnEngine> {
        match self {
            DynamicsModel::Plrnn(engine) => Some(engine),
            DynamicsModel::KalmanFormer(_) => None,
        }
    }

    pub fn as_explainer(&self) -> Option<&KalmanFormerEngine> {
        match self {
            DynamicsModel::KalmanFormer(engine) => Some(engine),
            DynamicsModel::Plrnn(_) => None,
        }
    }
}

impl From<PlrnnEngine> for DynamicsModel {
    fn from(engine: PlrnnEngine) -> Self {
        DynamicsModel::Plrnn(engine)
    }
}

impl From<KalmanFormerEngine> for DynamicsModel {
    fn from(engine: KalmanFormerEngine) -> Self {
        DynamicsModel::KalmanFormer(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_tracks_best_validation_loss() {
        let mut meta = ModelMetadata::default();
        assert!(meta.best_validation_loss.is_infinite());
        meta.record_validation(0.4);
        meta.record_validation(0.6);
        meta.record_validation(f64::NAN);
        assert!((meta.best_validation_loss - 0.4).abs() < 1e-12);

        meta.record_training(7);
        assert_eq!(meta.training_samples, 7);
        assert!(meta.last_trained.is_some());
    }

    #[test]
    fn convergence_threshold() {
        assert!(TrainingResult::new(0.05, ()).converged);
        assert!(!TrainingResult::new(0.1, ()).converged);
        assert!(!TrainingResult::new(f64::INFINITY, ()).converged);
    }
}
