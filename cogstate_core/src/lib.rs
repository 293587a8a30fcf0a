//! # Cognitive State Core
//!
//! Forecasting engine for a low-dimensional psychological state (valence,
//! arousal, dominance, risk, resources) observed through noisy, irregularly
//! sampled check-ins. Two interchangeable dynamics models are provided:
//!
//! - a piecewise-linear recurrent network ([`plrnn`]) with a readable causal
//!   graph and counterfactual interventions;
//! - a Kalman filter blended with a self-attention encoder ([`kalmanformer`])
//!   that can attribute its estimate to past observations.
//!
//! Both produce a [`Prediction`] with uncertainty bands and early-warning
//! signals for critical transitions.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::Utc;
//! use cogstate_core::{LatentState, PlrnnConfig, PlrnnEngine};
//!
//! let mut engine = PlrnnEngine::new(PlrnnConfig::default());
//! engine.initialize().unwrap();
//!
//! let state = LatentState::from_values(vec![0.6, 0.4, 0.5, 0.7, 0.6], 0.1, Utc::now());
//! let forecast = engine.predict(&state, 12, None).unwrap();
//! println!("mean in 12h: {:?}", forecast.mean);
//!
//! let network = engine.extract_causal_network().unwrap();
//! println!("edge density: {:.2}", network.metrics.density);
//! ```
//!
//! ## Core Modules
//!
//! - [`config`] - Engine configuration via TOML
//! - [`linalg`] - Small dense matrices and activations
//! - [`plrnn`] / [`kalmanformer`] - The two dynamics engines
//! - [`signals`] - Critical-transition detectors
//! - [`model`] - The shared engine contract and call-site selection
//! - [`logging`] - JSON line-delimited journal
//! - [`checkpoint`] - Versioned binary weight snapshots

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod kalmanformer;
pub mod linalg;
pub mod logging;
pub mod model;
pub mod plrnn;
pub mod ring;
pub mod signals;
pub mod state;

pub use checkpoint::{CheckpointError, Checkpointable, CHECKPOINT_VERSION};
pub use config::{
    BlendMode, ConfigError, Connectivity, EngineConfig, KalmanFormerConfig, PlrnnConfig,
    TimeEmbedding,
};
pub use error::{EngineError, EngineResult};
pub use kalmanformer::{
    AttentionExplanation, KalmanFormerEngine, KalmanFormerPrediction, KalmanFormerState,
    KalmanFormerWeights, TemporalPattern,
};
pub use logging::{log_forecast, log_training_run};
pub use model::{
    AttentionExplainer, CausalDynamics, DynamicsModel, ForecastEngine, ModelKind, ModelMetadata,
    TrainingResult,
};
pub use plrnn::{
    CausalNetwork, ForecastHorizon, InterventionKind, InterventionResult, ModelWeights,
    PlrnnEngine,
};
pub use ring::RingBuffer;
pub use signals::{detect_early_warnings, EarlyWarningSignal, WarningKind};
pub use state::{ConfidenceBand, LatentState, Prediction, Trajectory};

pub use cogstate_shared::{StateDimension, StateObservation};
