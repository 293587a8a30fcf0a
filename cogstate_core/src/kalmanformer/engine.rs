//! Kalman filter blended with a self-attention context encoder.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cogstate_shared::StateObservation;

use super::encoder::{embed_observation, encode};
use super::explain::{explain_window, AttentionExplanation};
use super::filter::{
    closed_form_gain, innovation, learned_gain, normalized_innovation_squared, predict_step,
    update_step, KalmanEstimate,
};
use super::state::{KalmanFormerState, WindowEntry};
use super::training::{batch_loss, train_sequence};
use super::weights::KalmanFormerWeights;
use crate::config::{BlendMode, KalmanFormerConfig};
use crate::error::{ensure_dim, EngineError, EngineResult};
use crate::linalg::{clamp_unit, dot, lerp, mat_scale, mat_vec, sigmoid, transpose, vec_add, Matrix};
use crate::model::TrainingResult;
use crate::ring::RingBuffer;
use crate::signals::detector::trajectory_warnings;
use crate::state::{
    advance_hours, hours_between, ConfidenceBand, LatentState, Prediction, Trajectory,
};

/// Diagonal of the error covariance for a fresh filter state.
const INITIAL_COVARIANCE: f64 = 0.1;
/// Per-step multiplicative confidence decay during rollouts.
const CONFIDENCE_DECAY: f64 = 0.95;
const OUTLIER_CONFIDENCE_FACTOR: f64 = 0.5;

/// Forecast with the two estimates that went into the blend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanFormerPrediction {
    pub prediction: Prediction,
    /// Final-step Kalman estimate in observation space.
    pub kalman_only: Vec<f64>,
    /// Final-step transformer estimate in observation space.
    pub transformer_only: Vec<f64>,
    pub confidence: f64,
    /// Largest absolute row sum of the final covariance, capped.
    pub uncertainty: f64,
    pub explanation: AttentionExplanation,
}

/// Kalman, transformer and blended one-step estimates from a filter state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StepForecast {
    pub context: Vec<f64>,
    pub kalman: Vec<f64>,
    pub covariance: Matrix,
    pub transformer: Vec<f64>,
    pub ratio: f64,
    pub blended: Vec<f64>,
}

/// `Hᵀ·x_last + W_out·ctx + b_out`: a residual correction of the latest
/// observation.
pub(crate) fn transformer_estimate(
    weights: &KalmanFormerWeights,
    context: &[f64],
    last_observation: &[f64],
) -> Vec<f64> {
    let carried = mat_vec(&transpose(&weights.kalman.observation), last_observation);
    let correction = vec_add(
        &mat_vec(&weights.output_projection, context),
        &weights.output_bias,
    );
    vec_add(&carried, &correction)
}

/// Weight of the transformer estimate for the active blend mode.
pub(crate) fn blend_ratio(weights: &KalmanFormerWeights, context: &[f64], carried: f64) -> f64 {
    let ratio = match (weights.config.blend_mode, &weights.blend_predictor) {
        (BlendMode::Learned, Some(predictor)) => {
            sigmoid(dot(&predictor.weights, context) + predictor.bias)
        }
        (BlendMode::Carried, _) => carried,
        _ => weights.config.blend_ratio,
    };
    clamp_unit(ratio)
}

fn last_context(weights: &KalmanFormerWeights, state: &KalmanFormerState) -> Vec<f64> {
    state
        .last_context()
        .map(<[f64]>::to_vec)
        .unwrap_or_else(|| vec![0.0; weights.embed_dim()])
}

/// One rollout step without an observation.
pub(crate) fn step_forecast(
    weights: &KalmanFormerWeights,
    state: &KalmanFormerState,
) -> StepForecast {
    let (kalman, covariance) = predict_step(
        &weights.kalman,
        &state.estimate.state,
        &state.estimate.covariance,
    );
    let context = last_context(weights, state);
    let last_observation = match state.last_observation() {
        Some(observation) => observation.to_vec(),
        None => mat_vec(&weights.kalman.observation, &state.estimate.state),
    };
    let transformer = transformer_estimate(weights, &context, &last_observation);
    let ratio = blend_ratio(weights, &context, state.blend_ratio);
    let blended = lerp(&kalman, &transformer, ratio);
    StepForecast {
        context,
        kalman,
        covariance,
        transformer,
        ratio,
        blended,
    }
}

/// Predict steps used to bridge a gap between observations.
fn interpolation_steps(gap_hours: f64, dt_hours: f64, max_gap_hours: f64) -> usize {
    let max_steps = ((max_gap_hours / dt_hours).floor() as usize).max(1);
    let steps = (gap_hours / dt_hours).round();
    if steps.is_finite() && steps > 1.0 {
        (steps as usize).min(max_steps)
    } else {
        1
    }
}

fn confidence_for(covariance: &Matrix) -> f64 {
    let variances = covariance.diag();
    let mean = variances.iter().sum::<f64>() / variances.len().max(1) as f64;
    clamp_unit(1.0 / (1.0 + mean.max(0.0)))
}

fn window_entry(
    weights: &KalmanFormerWeights,
    observation: &[f64],
    timestamp: DateTime<Utc>,
) -> WindowEntry {
    WindowEntry {
        observation: observation.to_vec(),
        timestamp,
        embedding: embed_observation(weights, observation, timestamp),
    }
}

/// Fresh filter state seeded from one observation.
pub(crate) fn seed_state(
    weights: &KalmanFormerWeights,
    observation: &[f64],
    timestamp: DateTime<Utc>,
) -> KalmanFormerState {
    let config = &weights.config;
    let state = mat_vec(&transpose(&weights.kalman.observation), observation);
    let covariance = mat_scale(&Matrix::identity(config.state_dim), INITIAL_COVARIANCE);

    let mut window = RingBuffer::with_capacity(config.context_window);
    window.push(window_entry(weights, observation, timestamp));
    let embeddings: Vec<Vec<f64>> = window.iter().map(|e| e.embedding.clone()).collect();
    let context = encode(weights, &embeddings);
    let ratio = blend_ratio(
        weights,
        context.last().map_or(&[][..], Vec::as_slice),
        config.blend_ratio,
    );

    KalmanFormerState {
        confidence: confidence_for(&covariance),
        estimate: KalmanEstimate::new(state, covariance, config.obs_dim),
        context,
        window,
        blend_ratio: ratio,
        timestamp,
        step: 0,
    }
}

/// The full filter transition for one observation, applied in place.
pub(crate) fn filter_update(
    weights: &KalmanFormerWeights,
    state: &mut KalmanFormerState,
    observation: &[f64],
    timestamp: DateTime<Utc>,
) {
    let config = &weights.config;
    let kalman = &weights.kalman;

    state.window.push(window_entry(weights, observation, timestamp));

    let gap = hours_between(state.timestamp, timestamp);
    let steps = interpolation_steps(gap, config.dt_hours, config.max_interpolation_gap_hours);
    let mut predicted_state = state.estimate.state.clone();
    let mut predicted_covariance = state.estimate.covariance.clone();
    for _ in 0..steps {
        let (x, p) = predict_step(kalman, &predicted_state, &predicted_covariance);
        predicted_state = x;
        predicted_covariance = p;
    }

    let embeddings: Vec<Vec<f64>> = state.window.iter().map(|e| e.embedding.clone()).collect();
    let context = encode(weights, &embeddings);
    let last = context
        .last()
        .cloned()
        .unwrap_or_else(|| vec![0.0; weights.embed_dim()]);

    let (y, s) = innovation(kalman, &predicted_state, &predicted_covariance, observation);
    let gain = match &weights.gain_predictor {
        Some(predictor) => learned_gain(predictor, &last, config.state_dim, config.obs_dim),
        None => closed_form_gain(&predicted_covariance, &kalman.observation, &s),
    };
    let nis = normalized_innovation_squared(&y, &s);
    let outlier = nis > config.outlier_threshold;
    if outlier {
        warn!(
            nis,
            threshold = config.outlier_threshold,
            step = state.step + 1,
            "observation flagged as outlier"
        );
    }
    let (filtered, covariance) = update_step(
        &predicted_state,
        &predicted_covariance,
        &gain,
        &kalman.observation,
        &y,
    );

    let transformer = transformer_estimate(weights, &last, observation);
    let ratio = blend_ratio(weights, &last, state.blend_ratio);
    let blended = lerp(&filtered, &transformer, ratio);

    let mut confidence = confidence_for(&covariance);
    if outlier {
        confidence *= OUTLIER_CONFIDENCE_FACTOR;
    }
    debug!(steps, nis, ratio, confidence, "kalmanformer update");

    state.estimate = KalmanEstimate {
        state: blended,
        covariance,
        predicted_state,
        predicted_covariance,
        innovation: y,
        innovation_covariance: s,
        gain,
        outlier,
    };
    state.context = context;
    state.blend_ratio = ratio;
    state.confidence = confidence;
    state.timestamp = timestamp;
    state.step += 1;
}

/// Row-wise absolute sums of `P`, each capped at `ceiling`.
fn row_uncertainty(covariance: &Matrix, ceiling: f64) -> Vec<f64> {
    (0..covariance.rows())
        .map(|r| {
            let sum: f64 = covariance.row(r).iter().map(|v| v.abs()).sum();
            sum.min(ceiling)
        })
        .collect()
}

/// KalmanFormer engine owning one weight set.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use cogstate_core::{KalmanFormerConfig, KalmanFormerEngine};
/// use cogstate_shared::StateObservation;
///
/// let mut engine = KalmanFormerEngine::new(KalmanFormerConfig::default());
/// engine.initialize().unwrap();
///
/// let first = StateObservation::new(vec![0.5; 5], Utc::now());
/// let state = engine.initial_state(&first).unwrap();
/// let forecast = engine.predict(&state, 6).unwrap();
/// assert_eq!(forecast.prediction.trajectory.len(), 6);
/// ```
#[derive(Debug)]
pub struct KalmanFormerEngine {
    config: KalmanFormerConfig,
    weights: Option<KalmanFormerWeights>,
}

impl KalmanFormerEngine {
    pub fn new(config: KalmanFormerConfig) -> Self {
        Self {
            config,
            weights: None,
        }
    }

    /// Validate the configuration and build fresh weights from its seed.
    pub fn initialize(&mut self) -> EngineResult<()> {
        self.config.validate()?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let weights = KalmanFormerWeights::initialize(&self.config, &mut rng);
        debug!(
            state_dim = self.config.state_dim,
            embed_dim = self.config.embed_dim,
            layers = self.config.num_layers,
            "kalmanformer weights initialized"
        );
        self.weights = Some(weights);
        Ok(())
    }

    pub fn config(&self) -> &KalmanFormerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.weights.is_some()
    }

    /// Replace the weights wholesale, adopting the configuration they carry.
    pub fn load_weights(&mut self, weights: KalmanFormerWeights) -> EngineResult<()> {
        weights.config.validate()?;
        weights.check_shapes()?;
        self.config = weights.config.clone();
        self.weights = Some(weights);
        Ok(())
    }

    pub fn weights(&self) -> EngineResult<&KalmanFormerWeights> {
        self.require("weights")
    }

    fn require(&self, operation: &str) -> EngineResult<&KalmanFormerWeights> {
        self.weights
            .as_ref()
            .ok_or_else(|| EngineError::not_initialized(operation))
    }

    fn check_state(&self, state: &KalmanFormerState, context: &str) -> EngineResult<()> {
        ensure_dim(self.config.state_dim, state.estimate.state.len(), context)?;
        ensure_dim(self.config.state_dim, state.estimate.covariance.rows(), context)
    }

    /// Filter state for a user's first observation.
    pub fn initial_state(
        &self,
        observation: &StateObservation,
    ) -> EngineResult<KalmanFormerState> {
        let weights = self.require("initial_state")?;
        ensure_dim(self.config.obs_dim, observation.dim(), "observation")?;
        Ok(seed_state(weights, &observation.values, observation.timestamp))
    }

    /// Fold one observation into the filter state.
    ///
    /// Gaps longer than `dt_hours` repeat the Kalman predict step, up to
    /// `max_interpolation_gap_hours`. The blended estimate becomes the new
    /// filter estimate.
    pub fn update(
        &self,
        state: &KalmanFormerState,
        observation: &[f64],
        timestamp: DateTime<Utc>,
    ) -> EngineResult<KalmanFormerState> {
        let mut next = state.clone();
        self.update_in_place(&mut next, observation, timestamp)?;
        Ok(next)
    }

    /// [`update`](Self::update) without copying the context window.
    ///
    /// On error the state is left unchanged.
    pub fn update_in_place(
        &self,
        state: &mut KalmanFormerState,
        observation: &[f64],
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        let weights = self.require("update")?;
        self.check_state(state, "update state")?;
        ensure_dim(self.config.obs_dim, observation.len(), "observation")?;
        filter_update(weights, state, observation, timestamp);
        Ok(())
    }

    /// Roll the hybrid forward `horizon` steps.
    ///
    /// Each step feeds the blended estimate back into the window as a
    /// synthetic observation one `dt_hours` later. Confidence decays by 5%
    /// per step.
    pub fn predict(
        &self,
        state: &KalmanFormerState,
        horizon: usize,
    ) -> EngineResult<KalmanFormerPrediction> {
        let weights = self.require("predict")?;
        self.check_state(state, "predict state")?;
        let config = &self.config;
        let observation_matrix = &weights.kalman.observation;

        let mut current = state.clone();
        let mut trajectory = Trajectory::with_capacity(horizon);
        let current_observed = mat_vec(observation_matrix, &current.estimate.state);
        let mut kalman_only = current_observed.clone();
        let mut transformer_only = current_observed;

        for _ in 0..horizon {
            let forecast = step_forecast(weights, &current);
            let timestamp = advance_hours(current.timestamp, config.dt_hours);
            let observed = mat_vec(observation_matrix, &forecast.blended);

            current.window.push(window_entry(weights, &observed, timestamp));
            current.context = encode(weights, &current.embeddings());
            current.confidence *= CONFIDENCE_DECAY;
            current.blend_ratio = forecast.ratio;
            current.timestamp = timestamp;
            current.step += 1;
            current.estimate.predicted_state = forecast.kalman.clone();
            current.estimate.predicted_covariance = forecast.covariance.clone();
            current.estimate.state = forecast.blended.clone();
            current.estimate.covariance = forecast.covariance;

            kalman_only = mat_vec(observation_matrix, &forecast.kalman);
            transformer_only = mat_vec(observation_matrix, &forecast.transformer);
            trajectory.push(LatentState {
                latent: forecast.blended,
                observed,
                uncertainty: row_uncertainty(
                    &current.estimate.covariance,
                    config.uncertainty_ceiling,
                ),
                timestamp,
                timestep: current.step,
            });
        }

        let (mean, variance) = match trajectory.last() {
            Some(last) => (last.observed.clone(), last.uncertainty.clone()),
            None => (
                mat_vec(observation_matrix, &state.estimate.state),
                row_uncertainty(&state.estimate.covariance, config.uncertainty_ceiling),
            ),
        };
        let uncertainty = current
            .estimate
            .covariance
            .max_abs_row_sum()
            .min(config.uncertainty_ceiling);
        let early_warnings = trajectory_warnings(&trajectory, config.dt_hours);

        Ok(KalmanFormerPrediction {
            prediction: Prediction {
                confidence_band: ConfidenceBand::from_mean_variance(&mean, &variance),
                mean,
                variance,
                horizon,
                trajectory,
                early_warnings,
            },
            kalman_only,
            transformer_only,
            confidence: current.confidence,
            uncertainty,
            explanation: explain_window(
                &state.window,
                &weights.embeddings.observation,
                config.attention_temperature,
            ),
        })
    }

    /// Attention summary over the observations buffered in `state`.
    ///
    /// Windows with fewer than two entries give a neutral summary.
    pub fn explain(&self, state: &KalmanFormerState) -> EngineResult<AttentionExplanation> {
        let weights = self.require("explain")?;
        Ok(explain_window(
            &state.window,
            &weights.embeddings.observation,
            self.config.attention_temperature,
        ))
    }

    /// See [`KalmanFormerState::adapt_blend_ratio`].
    pub fn adapt_blend_ratio(
        &self,
        state: &mut KalmanFormerState,
        predictions: &[Vec<f64>],
        actuals: &[Vec<f64>],
    ) -> f64 {
        let before = state.blend_ratio;
        let after = state.adapt_blend_ratio(predictions, actuals);
        if after != before {
            debug!(before, after, "blend ratio adapted");
        }
        after
    }

    /// Filter one ordered sequence, updating the output projection and the
    /// blend predictor after every one-step forecast.
    ///
    /// Fewer than two observations return an infinite loss and leave the
    /// weights untouched.
    pub fn train_online(
        &mut self,
        sample: &[StateObservation],
    ) -> EngineResult<TrainingResult<KalmanFormerWeights>> {
        self.check_sample(sample)?;
        let weights = self
            .weights
            .as_mut()
            .ok_or_else(|| EngineError::not_initialized("train_online"))?;
        if sample.len() < 2 {
            return Ok(TrainingResult::new(f64::INFINITY, weights.clone()));
        }

        let loss = train_sequence(weights, sample);
        weights.metadata.record_training(sample.len() - 1);
        debug!(transitions = sample.len() - 1, loss, "kalmanformer online step");
        Ok(TrainingResult::new(loss, weights.clone()))
    }

    /// Train on every sequence in turn, then evaluate the batch in parallel.
    pub fn train_batch(
        &mut self,
        samples: &[Vec<StateObservation>],
    ) -> EngineResult<TrainingResult<KalmanFormerWeights>> {
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
            "kalmanformer batch training complete"
        );
        Ok(TrainingResult::new(loss, weights.clone()))
    }

    /// Mean one-step loss of the filtered forecasts over `samples`.
    pub fn evaluate(&self, samples: &[Vec<StateObservation>]) -> EngineResult<f64> {
        let weights = self.require("evaluate")?;
        for sample in samples {
            self.check_sample(sample)?;
        }
        Ok(batch_loss(weights, samples))
    }

    fn check_sample(&self, sample: &[StateObservation]) -> EngineResult<()> {
        sample.iter().try_for_each(|observation| {
            ensure_dim(self.config.obs_dim, observation.dim(), "training observation")
        })
    }

    /// Flatten a filter state into a [`LatentState`].
    ///
    /// Lossy: only the diagonal of the error covariance survives (capped at
    /// the uncertainty ceiling), and the window, context and blend ratio are
    /// dropped. Requires `obs_dim == state_dim`.
    pub fn to_plrnn_state(&self, state: &KalmanFormerState) -> EngineResult<LatentState> {
        let weights = self.require("to_plrnn_state")?;
        self.check_state(state, "filter state")?;
        ensure_dim(self.config.state_dim, self.config.obs_dim, "observation dimension")?;
        let ceiling = self.config.uncertainty_ceiling;
        Ok(LatentState {
            latent: state.estimate.state.clone(),
            observed: mat_vec(&weights.kalman.observation, &state.estimate.state),
            uncertainty: state
                .estimate
                .variances()
                .into_iter()
                .map(|v| v.clamp(0.0, ceiling))
                .collect(),
            timestamp: state.timestamp,
            timestep: state.step,
        })
    }

    /// Build a filter state from a [`LatentState`].
    ///
    /// Lossy: the covariance becomes `diag(uncertainty)` and the window holds
    /// only the observed vector, so attention has no history to work with.
    pub fn from_plrnn_state(&self, state: &LatentState) -> EngineResult<KalmanFormerState> {
        let weights = self.require("from_plrnn_state")?;
        ensure_dim(self.config.state_dim, state.latent.len(), "latent state")?;
        ensure_dim(self.config.state_dim, state.uncertainty.len(), "latent uncertainty")?;
        ensure_dim(self.config.obs_dim, state.observed.len(), "observed state")?;

        let mut filter_state = seed_state(weights, &state.observed, state.timestamp);
        filter_state.estimate.state = state.latent.clone();
        filter_state.estimate.predicted_state = state.latent.clone();
        let covariance = Matrix::diagonal(&state.uncertainty);
        filter_state.estimate.predicted_covariance = covariance.clone();
        filter_state.confidence = confidence_for(&covariance);
        filter_state.estimate.covariance = covariance;
        filter_state.step = state.timestep;
        Ok(filter_state)
    }

    /// `H·x̂` as an observation.
    pub fn to_observation(&self, state: &KalmanFormerState) -> EngineResult<StateObservation> {
        let weights = self.require("to_observation")?;
        self.check_state(state, "filter state")?;
        Ok(StateObservation::new(
            mat_vec(&weights.kalman.observation, &state.estimate.state),
            state.timestamp,
        ))
    }
}
