//! Piecewise-linear recurrent forecasting engine.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cogstate_shared::{StateDimension, StateObservation};

use super::causal::{
    summarize_intervention, CausalNetwork, InterventionKind, InterventionResult,
    INTERVENTION_HORIZON,
};
use super::training::{batch_loss, latent_from_observation, train_sequence, SgdParams};
use super::weights::ModelWeights;
use crate::config::PlrnnConfig;
use crate::error::{ensure_dim, EngineError, EngineResult};
use crate::linalg::approximate_max_eigenvalue;
use crate::model::TrainingResult;
use crate::signals::{detect_early_warnings, detector::trajectory_warnings, EarlyWarningSignal};
use crate::state::{advance_hours, ConfidenceBand, LatentState, Prediction, Trajectory};

/// Absolute latent value beyond which a dimension counts as saturated.
const SATURATION_LEVEL: f64 = 2.0;

/// Symbolic forecast horizons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastHorizon {
    Short,
    Medium,
    Long,
}

impl ForecastHorizon {
    pub fn steps(&self) -> usize {
        match self {
            ForecastHorizon::Short => 3,
            ForecastHorizon::Medium => 12,
            ForecastHorizon::Long => 48,
        }
    }
}

/// Dominant-eigenvalue summary of the linearised dynamics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub dominant_eigenvalue: f64,
    pub stable: bool,
}

/// PLRNN engine owning one weight set.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use cogstate_core::{LatentState, PlrnnConfig, PlrnnEngine};
///
/// let mut engine = PlrnnEngine::new(PlrnnConfig::default());
/// engine.initialize().unwrap();
///
/// let state = LatentState::from_values(vec![0.5; 5], 0.1, Utc::now());
/// let forecast = engine.predict(&state, 12, None).unwrap();
/// assert_eq!(forecast.trajectory.len(), 12);
/// ```
#[derive(Debug)]
pub struct PlrnnEngine {
    config: PlrnnConfig,
    weights: Option<ModelWeights>,
    rng: StdRng,
}

impl PlrnnEngine {
    /// Engine without weights; call [`initialize`](Self::initialize) or
    /// [`load_weights`](Self::load_weights) before use.
    pub fn new(config: PlrnnConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            weights: None,
            rng,
        }
    }

    /// Validate the configuration and build fresh weights.
    pub fn initialize(&mut self) -> EngineResult<()> {
        self.config.validate()?;
        self.rng = StdRng::seed_from_u64(self.config.seed);
        let weights = ModelWeights::initialize(&self.config, &mut self.rng);
        debug!(
            latent_dim = self.config.latent_dim,
            connectivity = ?self.config.connectivity,
            "plrnn weights initialized"
        );
        self.weights = Some(weights);
        Ok(())
    }

    pub fn config(&self) -> &PlrnnConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.weights.is_some()
    }

    /// Replace the weights wholesale, adopting the configuration they carry.
    pub fn load_weights(&mut self, weights: ModelWeights) -> EngineResult<()> {
        weights.config.validate()?;
        weights.check_shapes()?;
        self.config = weights.config.clone();
        self.weights = Some(weights);
        Ok(())
    }

    pub fn weights(&self) -> EngineResult<&ModelWeights> {
        self.require("weights")
    }

    fn require(&self, operation: &str) -> EngineResult<&ModelWeights> {
        self.weights
            .as_ref()
            .ok_or_else(|| EngineError::not_initialized(operation))
    }

    fn dim(&self) -> usize {
        self.config.latent_dim
    }

    fn check_state(&self, state: &LatentState, context: &str) -> EngineResult<()> {
        let dim = self.dim();
        ensure_dim(dim, state.latent.len(), context)?;
        ensure_dim(dim, state.observed.len(), context)?;
        ensure_dim(dim, state.uncertainty.len(), context)
    }

    fn check_input(&self, input: Option<&[f64]>) -> EngineResult<()> {
        match input {
            Some(input) => ensure_dim(self.dim(), input.len(), "external input"),
            None => Ok(()),
        }
    }

    fn step(
        weights: &ModelWeights,
        config: &PlrnnConfig,
        state: &LatentState,
        input: Option<&[f64]>,
    ) -> LatentState {
        let trace = weights.step(&state.latent, input);
        let uncertainty = trace
            .latent
            .iter()
            .zip(&state.uncertainty)
            .map(|(z, u)| {
                let mut next = u.max(0.0) * (1.0 + config.uncertainty_growth);
                if z.abs() > SATURATION_LEVEL {
                    next += config.saturation_penalty;
                }
                next.min(config.uncertainty_ceiling)
            })
            .collect();

        LatentState {
            latent: trace.latent,
            observed: trace.observed,
            uncertainty,
            timestamp: advance_hours(state.timestamp, config.dt_hours),
            timestep: state.timestep + 1,
        }
    }

    /// One transition of the latent dynamics.
    pub fn forward(
        &self,
        state: &LatentState,
        input: Option<&[f64]>,
    ) -> EngineResult<LatentState> {
        let weights = self.require("forward")?;
        self.check_state(state, "forward state")?;
        self.check_input(input)?;
        Ok(Self::step(weights, &self.config, state, input))
    }

    fn rollout(
        &self,
        weights: &ModelWeights,
        state: &LatentState,
        horizon: usize,
        input: Option<&[f64]>,
    ) -> Trajectory {
        let mut trajectory = Trajectory::with_capacity(horizon);
        let mut current = state.clone();
        for _ in 0..horizon {
            current = Self::step(weights, &self.config, &current, input);
            trajectory.push(current.clone());
        }
        trajectory
    }

    /// Iterate [`forward`](Self::forward) `horizon` times.
    ///
    /// The final observed vector is the point forecast. Early-warning
    /// detection scans up to the first 24 trajectory states and needs at
    /// least 12 of them.
    pub fn predict(
        &self,
        state: &LatentState,
        horizon: usize,
        input: Option<&[f64]>,
    ) -> EngineResult<Prediction> {
        let weights = self.require("predict")?;
        self.check_state(state, "predict state")?;
        self.check_input(input)?;

        let trajectory = self.rollout(weights, state, horizon, input);
        let (mean, variance) = match trajectory.last() {
            Some(last) => (last.observed.clone(), last.uncertainty.clone()),
            None => (weights.observe(&state.latent), state.uncertainty.clone()),
        };
        let early_warnings = trajectory_warnings(&trajectory, self.config.dt_hours);

        Ok(Prediction {
            confidence_band: ConfidenceBand::from_mean_variance(&mean, &variance),
            mean,
            variance,
            horizon,
            trajectory,
            early_warnings,
        })
    }

    /// [`predict`](Self::predict) over the configured `prediction_horizon`.
    pub fn predict_default(
        &self,
        state: &LatentState,
        input: Option<&[f64]>,
    ) -> EngineResult<Prediction> {
        self.predict(state, self.config.prediction_horizon, input)
    }

    /// Forecast over a symbolic horizon.
    ///
    /// Short horizons double the L1 strength for the duration of the call;
    /// the exclusive borrow keeps the toggle invisible to other callers.
    pub fn hybrid_predict(
        &mut self,
        state: &LatentState,
        horizon: ForecastHorizon,
    ) -> EngineResult<Prediction> {
        if horizon != ForecastHorizon::Short {
            return self.predict(state, horizon.steps(), None);
        }
        let original = self.config.l1_regularization;
        self.config.l1_regularization = original * 2.0;
        let result = self.predict(state, horizon.steps(), None);
        self.config.l1_regularization = original;
        result
    }

    /// Online SGD over one ordered observation sequence.
    ///
    /// Fewer than two observations return an infinite loss and leave the
    /// weights untouched.
    pub fn train_online(
        &mut self,
        sample: &[StateObservation],
    ) -> EngineResult<TrainingResult<ModelWeights>> {
        let sequence = self.sequence_values(sample)?;
        let params = SgdParams::from_config(&self.config);
        let weights = self
            .weights
            .as_mut()
            .ok_or_else(|| EngineError::not_initialized("train_online"))?;
        if sequence.len() < 2 {
            return Ok(TrainingResult::new(f64::INFINITY, weights.clone()));
        }

        let loss = train_sequence(weights, &sequence, &params, &mut self.rng);
        weights.metadata.record_training(sequence.len() - 1);
        debug!(transitions = sequence.len() - 1, loss, "plrnn online step");
        Ok(TrainingResult::new(loss, weights.clone()))
    }

    /// Train on every sequence in turn, then evaluate the batch.
    ///
    /// The reported loss is the mean training loss over the sequences that
    /// had at least one transition.
    pub fn train_batch(
        &mut self,
        samples: &[Vec<StateObservation>],
    ) -> EngineResult<TrainingResult<ModelWeights>> {
        self.require("train_batch")?;
        let mut total = 0.0;
        let mut trained = 0usize;
        for sample in samples {
            let result = self.train_online(sample)?;
            if result.loss.is_finite() {
                total += result.loss;
                trained += 1;
            }
        }
        let loss = if trained == 0 {
            f64::INFINITY
        } else {
            total / trained as f64
        };

        let validation = self.evaluate(samples)?;
        let weights = self
            .weights
            .as_mut()
            .ok_or_else(|| EngineError::not_initialized("train_batch"))?;
        weights.metadata.record_validation(validation);
        info!(
            sequences = samples.len(),
            trained,
            loss,
            validation,
            "plrnn batch training complete"
        );
        Ok(TrainingResult::new(loss, weights.clone()))
    }

    /// Mean teacher-forced one-step loss over `samples`, without mutation.
    pub fn evaluate(&self, samples: &[Vec<StateObservation>]) -> EngineResult<f64> {
        let weights = self.require("evaluate")?;
        let sequences = samples
            .iter()
            .map(|sample| self.sequence_values(sample))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(batch_loss(weights, &sequences))
    }

    fn sequence_values(&self, sample: &[StateObservation]) -> EngineResult<Vec<Vec<f64>>> {
        sample
            .iter()
            .map(|observation| {
                ensure_dim(self.dim(), observation.dim(), "training observation")?;
                Ok(observation.values.clone())
            })
            .collect()
    }

    pub fn extract_causal_network(&self) -> EngineResult<CausalNetwork> {
        Ok(CausalNetwork::from_weights(self.require("extract_causal_network")?))
    }

    /// Counterfactual 24-step rollout with a constant input on `target`.
    pub fn simulate_intervention(
        &self,
        state: &LatentState,
        target: usize,
        kind: InterventionKind,
        magnitude: f64,
    ) -> EngineResult<InterventionResult> {
        let weights = self.require("simulate_intervention")?;
        self.check_state(state, "intervention state")?;
        let dim = self.dim();
        if target >= dim {
            return Err(EngineError::InvalidDimension {
                index: target,
                dimensions: dim,
            });
        }

        let mut input = vec![0.0; dim];
        input[target] = kind.input_for(magnitude, state.latent[target]);
        let baseline = self.rollout(weights, state, INTERVENTION_HORIZON, None);
        let intervened = self.rollout(weights, state, INTERVENTION_HORIZON, Some(&input));
        let result = summarize_intervention(target, kind, magnitude, &baseline, &intervened);
        debug!(
            target,
            kind = %kind,
            peak = result.time_to_peak,
            duration = result.duration,
            "intervention simulated"
        );
        Ok(result)
    }

    /// [`simulate_intervention`](Self::simulate_intervention) addressed by
    /// dimension name, e.g. `"arousal"`.
    pub fn simulate_intervention_by_name(
        &self,
        state: &LatentState,
        target: &str,
        kind: InterventionKind,
        magnitude: f64,
    ) -> EngineResult<InterventionResult> {
        let dimension: StateDimension = target
            .parse()
            .map_err(|_| EngineError::unknown_dimension(target))?;
        self.simulate_intervention(state, dimension.index(), kind, magnitude)
    }

    /// Critical-transition scan over an observed history.
    pub fn detect_early_warnings(
        &self,
        history: &[Vec<f64>],
        window_size: usize,
    ) -> Vec<EarlyWarningSignal> {
        detect_early_warnings(history, window_size, self.config.dt_hours)
    }

    /// Latent state for a raw observation, `z = B⁻¹(x − b_x)`.
    pub fn state_from_observation(
        &self,
        observation: &StateObservation,
    ) -> EngineResult<LatentState> {
        let weights = self.require("state_from_observation")?;
        ensure_dim(self.dim(), observation.dim(), "observation")?;
        let latent = latent_from_observation(weights, &observation.values);
        let uncertainty = self
            .config
            .initial_uncertainty
            .min(self.config.uncertainty_ceiling);
        Ok(LatentState {
            latent,
            observed: observation.values.clone(),
            uncertainty: vec![uncertainty; self.dim()],
            timestamp: observation.timestamp,
            timestep: 0,
        })
    }

    pub fn to_observation(&self, state: &LatentState) -> EngineResult<StateObservation> {
        ensure_dim(self.dim(), state.observed.len(), "observed state")?;
        Ok(StateObservation::new(state.observed.clone(), state.timestamp))
    }

    /// Dominant eigenvalue of `diag(A) + W`; below one the linear part of
    /// the dynamics contracts.
    pub fn stability(&self) -> EngineResult<StabilityReport> {
        let weights = self.require("stability")?;
        let dominant_eigenvalue = approximate_max_eigenvalue(&weights.jacobian_proxy());
        Ok(StabilityReport {
            dominant_eigenvalue,
            stable: dominant_eigenvalue < 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Connectivity;
    use crate::linalg::Matrix;
    use crate::signals::WarningKind;
    use chrono::{TimeZone, Utc};

    fn engine() -> PlrnnEngine {
        let mut engine = PlrnnEngine::new(PlrnnConfig::default());
        engine.initialize().unwrap();
        engine
    }

    fn state(value: f64) -> LatentState {
        LatentState::from_values(
            vec![value; 5],
            0.1,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        )
    }

    #[test]
    fn operations_require_initialization() {
        let engine = PlrnnEngine::new(PlrnnConfig::default());
        assert!(matches!(
            engine.forward(&state(0.5), None),
            Err(EngineError::NotInitialized { .. })
        ));
        assert!(engine.weights().is_err());
        assert!(engine.extract_causal_network().is_err());
    }

    #[test]
    fn forward_advances_time_and_step() {
        let engine = engine();
        let next = engine.forward(&state(0.5), None).unwrap();
        assert_eq!(next.timestep, 1);
        assert_eq!(
            next.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        );
        assert!(next.is_consistent(5));
        for u in &next.uncertainty {
            assert!((u - 0.105).abs() < 1e-12);
        }
    }

    #[test]
    fn saturated_dimensions_gain_penalty() {
        let engine = engine();
        let next = engine.forward(&state(5.0), None).unwrap();
        for u in &next.uncertainty {
            assert!((u - (0.105 + 0.1)).abs() < 1e-9);
        }
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let engine = engine();
        let bad = LatentState::from_values(vec![0.5; 3], 0.1, Utc::now());
        assert!(matches!(
            engine.forward(&bad, None),
            Err(EngineError::DimensionMismatch { expected: 5, got: 3, .. })
        ));
        assert!(engine.forward(&state(0.5), Some(&[1.0][..])).is_err());

        let mut short_observed = state(0.5);
        short_observed.observed.truncate(2);
        assert!(matches!(
            engine.predict(&short_observed, 3, None),
            Err(EngineError::DimensionMismatch { expected: 5, got: 2, .. })
        ));
    }

    #[test]
    fn hybrid_predict_restores_l1() {
        let mut engine = engine();
        let before = engine.config().l1_regularization;
        let short = engine.hybrid_predict(&state(0.5), ForecastHorizon::Short).unwrap();
        assert_eq!(short.horizon, 3);
        assert_eq!(engine.config().l1_regularization, before);
        let long = engine.hybrid_predict(&state(0.5), ForecastHorizon::Long).unwrap();
        assert_eq!(long.trajectory.len(), 48);
    }

    #[test]
    fn load_then_get_is_identity() {
        let mut engine = engine();
        let mut weights = engine.weights().unwrap().clone();
        weights.recurrent = Matrix::zeros(5, 5);
        engine.load_weights(weights.clone()).unwrap();
        assert_eq!(engine.weights().unwrap(), &weights);
        assert_eq!(engine.weights().unwrap(), &weights);
    }

    #[test]
    fn degenerate_training_leaves_weights() {
        let mut engine = engine();
        let before = engine.weights().unwrap().clone();
        let result = engine
            .train_online(&[StateObservation::new(vec![0.5; 5], Utc::now())])
            .unwrap();
        assert!(result.loss.is_infinite());
        assert!(!result.converged);
        assert_eq!(engine.weights().unwrap(), &before);
    }

    #[test]
    fn training_updates_metadata() {
        let mut engine = engine();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let sample: Vec<_> = (0..6)
            .map(|i| {
                StateObservation::new(
                    vec![0.5 + 0.01 * i as f64; 5],
                    advance_hours(start, i as f64),
                )
            })
            .collect();
        let result = engine.train_batch(&[sample.clone(), sample]).unwrap();
        assert!(result.loss.is_finite());
        assert_eq!(result.weights.metadata.training_samples, 10);
        assert!(result.weights.metadata.best_validation_loss.is_finite());
        assert!(result.weights.metadata.last_trained.is_some());
    }

    #[test]
    fn intervention_by_name() {
        let engine = engine();
        let result = engine
            .simulate_intervention_by_name(&state(0.5), "Arousal", InterventionKind::Increase, 0.5)
            .unwrap();
        assert_eq!(result.target, 1);
        assert_eq!(result.effects.len(), INTERVENTION_HORIZON);
        assert!(result.peak_effect() > 0.0);
        assert!((0.0..=1.0).contains(&result.confidence));

        assert!(matches!(
            engine.simulate_intervention_by_name(
                &state(0.5),
                "mood",
                InterventionKind::Increase,
                0.5
            ),
            Err(EngineError::UnknownDimension { .. })
        ));
        assert!(matches!(
            engine.simulate_intervention(&state(0.5), 7, InterventionKind::Increase, 0.5),
            Err(EngineError::InvalidDimension { index: 7, dimensions: 5 })
        ));
    }

    #[test]
    fn observation_round_trip_through_latent_space() {
        let engine = engine();
        let observation = StateObservation::new(vec![0.2, 0.4, 0.6, 0.8, 1.0], Utc::now());
        let latent = engine.state_from_observation(&observation).unwrap();
        let weights = engine.weights().unwrap();
        let back = weights.observe(&latent.latent);
        for (a, b) in back.iter().zip(&observation.values) {
            assert!((a - b).abs() < 1e-9);
        }
        assert_eq!(engine.to_observation(&latent).unwrap(), observation);
    }

    #[test]
    fn stability_reflects_self_weights() {
        let mut engine = engine();
        let mut weights = engine.weights().unwrap().clone();
        weights.recurrent = Matrix::zeros(5, 5);
        weights.self_weights = vec![0.5, 0.6, 0.7, 0.8, 0.9];
        engine.load_weights(weights).unwrap();
        let report = engine.stability().unwrap();
        assert!((report.dominant_eigenvalue - 0.9).abs() < 0.05);
        assert!(report.stable);
    }

    #[test]
    fn losing_stability_forecast_reports_autocorrelation() {
        let mut engine = engine();
        let mut weights = engine.weights().unwrap().clone();
        weights.self_weights = vec![-0.5, 1.0, 1.0, 1.0, 1.0];
        weights.recurrent = Matrix::zeros(5, 5);
        weights.recurrent[(0, 1)] = 1.0;
        weights.observation = Matrix::identity(5);
        weights.bias_latent = vec![0.0, 0.1, 0.0, 0.0, 0.0];
        weights.bias_observed = vec![0.0; 5];
        engine.load_weights(weights).unwrap();

        // Valence oscillates and decays until arousal turns positive, then
        // follows arousal upward.
        let start = LatentState::from_values(
            vec![0.4, -1.15, 0.0, 0.0, 0.0],
            0.1,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        );
        let forecast = engine.predict(&start, 24, None).unwrap();
        assert!(forecast
            .early_warnings
            .iter()
            .any(|w| w.kind == WarningKind::Autocorrelation && w.dimension == Some(0)));

        let short = engine.predict(&start, 10, None).unwrap();
        assert!(short.early_warnings.is_empty());
    }

    #[test]
    fn configured_horizon_sets_default_forecast_length() {
        let mut engine = PlrnnEngine::new(PlrnnConfig {
            prediction_horizon: 7,
            ..PlrnnConfig::default()
        });
        engine.initialize().unwrap();
        let forecast = engine.predict_default(&state(0.5), None).unwrap();
        assert_eq!(forecast.horizon, 7);
        assert_eq!(forecast.trajectory.len(), 7);
        assert_eq!(engine.predict_default(&state(0.5), None).unwrap(), forecast);
        assert_eq!(engine.predict(&state(0.5), 7, None).unwrap(), forecast);
    }

    #[test]
    fn dendritic_training_updates_basis_layer() {
        let mut engine = PlrnnEngine::new(PlrnnConfig {
            connectivity: Connectivity::Dendritic,
            ..PlrnnConfig::default()
        });
        engine.initialize().unwrap();
        let mut weights = engine.weights().unwrap().clone();
        if let Some(dendritic) = weights.dendritic.as_mut() {
            let bases = dendritic.basis.rows();
            dendritic.basis = Matrix::from_fn(bases, 5, |_, _| 0.2);
        }
        engine.load_weights(weights.clone()).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let sample: Vec<_> = (0..8)
            .map(|i| {
                StateObservation::new(
                    vec![0.3 + 0.05 * i as f64; 5],
                    advance_hours(start, i as f64),
                )
            })
            .collect();
        let result = engine.train_online(&sample).unwrap();
        assert!(result.loss.is_finite());

        let before = weights.dendritic.as_ref().unwrap();
        let after = engine.weights().unwrap().dendritic.as_ref().unwrap();
        assert_ne!(after.coupling, before.coupling);
        assert_ne!(after.basis, before.basis);
    }
}
