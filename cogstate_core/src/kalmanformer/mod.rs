//! KalmanFormer: a classical Kalman filter blended with a self-attention
//! context encoder over a sliding observation window.
//!
//! Lifecycle: `initialize → initial_state → update* → predict / explain`.
//! The blended estimate is written back as the filter estimate, so the
//! filter's covariance and gain bookkeeping track the hybrid signal.

pub mod encoder;
pub mod engine;
pub mod explain;
pub mod filter;
pub mod state;
pub mod training;
pub mod weights;

pub use encoder::compute_attention_weights;
pub use engine::{KalmanFormerEngine, KalmanFormerPrediction};
pub use explain::{AttentionExplanation, InfluentialObservation, TemporalPattern, TOP_INFLUENCES};
pub use filter::KalmanEstimate;
pub use state::{KalmanFormerState, WindowEntry};
pub use weights::{
    BlendPredictor, EncoderLayer, Embeddings, GainPredictor, KalmanBlock, KalmanFormerWeights,
};
