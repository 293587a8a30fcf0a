//! KalmanFormer parameters: Kalman block, encoder stack, embeddings and
//! the optional gain and blend heads.

use std::path::Path;

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointError, Checkpointable, Snapshot};
use crate::config::{BlendMode, KalmanFormerConfig, TimeEmbedding};
use crate::error::{ensure_dim, EngineResult};
use crate::linalg::{logit, Matrix};
use crate::model::ModelMetadata;

/// Time-of-day and day-of-week, each as a sine/cosine pair.
pub const TIME_FEATURES: usize = 4;
/// Feed-forward width as a multiple of the embedding size.
const FFN_EXPANSION: usize = 2;
const TRANSITION_DECAY: f64 = 0.98;
const PROCESS_NOISE: f64 = 0.01;
const MEASUREMENT_NOISE: f64 = 0.1;
const HEAD_INIT_STD: f64 = 0.01;
const TIME_INIT_STD: f64 = 0.1;
/// Initial logit of off-diagonal learned gain entries (sigmoid ≈ 0.018).
const OFF_DIAGONAL_GAIN_BIAS: f64 = -4.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanBlock {
    /// `A`, state × state.
    pub transition: Matrix,
    /// `H`, obs × state.
    pub observation: Matrix,
    /// `Q`, state × state.
    pub process_noise: Matrix,
    /// `R`, obs × obs.
    pub measurement_noise: Matrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderLayer {
    pub query: Matrix,
    pub key: Matrix,
    pub value: Matrix,
    pub output: Matrix,
    pub ffn_hidden: Matrix,
    pub ffn_hidden_bias: Vec<f64>,
    pub ffn_output: Matrix,
    pub ffn_output_bias: Vec<f64>,
    pub attention_norm_gain: Vec<f64>,
    pub attention_norm_bias: Vec<f64>,
    pub ffn_norm_gain: Vec<f64>,
    pub ffn_norm_bias: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embeddings {
    /// embed × obs.
    pub observation: Matrix,
    pub observation_bias: Vec<f64>,
    /// embed × [`TIME_FEATURES`], present for learned time embeddings.
    pub time: Option<Matrix>,
    /// context_window × embed sinusoidal table.
    pub positional: Matrix,
}

/// Sigmoid projection of the last context vector onto a state × obs gain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainPredictor {
    pub weights: Matrix,
    pub bias: Vec<f64>,
}

/// Logistic blend ratio from the last context vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendPredictor {
    pub weights: Vec<f64>,
    pub bias: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanFormerWeights {
    pub kalman: KalmanBlock,
    pub layers: Vec<EncoderLayer>,
    pub embeddings: Embeddings,
    pub gain_predictor: Option<GainPredictor>,
    pub blend_predictor: Option<BlendPredictor>,
    /// state × embed projection of the last context vector.
    pub output_projection: Matrix,
    pub output_bias: Vec<f64>,
    pub metadata: ModelMetadata,
    pub config: KalmanFormerConfig,
}

fn gaussian_matrix(rng: &mut StdRng, rows: usize, cols: usize, std: f64) -> Matrix {
    Matrix::from_fn(rows, cols, |_, _| rng.sample::<f64, _>(StandardNormal) * std)
}

/// Rectangular identity: ones where row equals column.
fn eye(rows: usize, cols: usize) -> Matrix {
    Matrix::from_fn(rows, cols, |r, c| if r == c { 1.0 } else { 0.0 })
}

/// Standard transformer positional table, `len × dim`.
pub fn positional_table(len: usize, dim: usize) -> Matrix {
    Matrix::from_fn(len, dim, |pos, i| {
        let exponent = (2 * (i / 2)) as f64 / dim.max(1) as f64;
        let angle = pos as f64 / 10_000_f64.powf(exponent);
        if i % 2 == 0 {
            angle.sin()
        } else {
            angle.cos()
        }
    })
}

impl EncoderLayer {
    fn initialize(embed: usize, rng: &mut StdRng) -> Self {
        let hidden = embed * FFN_EXPANSION;
        let attn_std = 1.0 / (embed as f64).sqrt();
        let ffn_out_std = 1.0 / (hidden as f64).sqrt();
        Self {
            query: gaussian_matrix(rng, embed, embed, attn_std),
            key: gaussian_matrix(rng, embed, embed, attn_std),
            value: gaussian_matrix(rng, embed, embed, attn_std),
            output: gaussian_matrix(rng, embed, embed, attn_std),
            ffn_hidden: gaussian_matrix(rng, hidden, embed, attn_std),
            ffn_hidden_bias: vec![0.0; hidden],
            ffn_output: gaussian_matrix(rng, embed, hidden, ffn_out_std),
            ffn_output_bias: vec![0.0; embed],
            attention_norm_gain: vec![1.0; embed],
            attention_norm_bias: vec![0.0; embed],
            ffn_norm_gain: vec![1.0; embed],
            ffn_norm_bias: vec![0.0; embed],
        }
    }

    fn check_shapes(&self, embed: usize) -> EngineResult<()> {
        let hidden = self.ffn_hidden.rows();
        for (matrix, context) in [
            (&self.query, "query projection"),
            (&self.key, "key projection"),
            (&self.value, "value projection"),
            (&self.output, "attention output projection"),
        ] {
            ensure_dim(embed, matrix.rows(), context)?;
            ensure_dim(embed, matrix.cols(), context)?;
        }
        ensure_dim(embed, self.ffn_hidden.cols(), "feed-forward input")?;
        ensure_dim(hidden, self.ffn_hidden_bias.len(), "feed-forward hidden bias")?;
        ensure_dim(embed, self.ffn_output.rows(), "feed-forward output")?;
        ensure_dim(hidden, self.ffn_output.cols(), "feed-forward output")?;
        ensure_dim(embed, self.ffn_output_bias.len(), "feed-forward output bias")?;
        for (vector, context) in [
            (&self.attention_norm_gain, "attention norm gain"),
            (&self.attention_norm_bias, "attention norm bias"),
            (&self.ffn_norm_gain, "feed-forward norm gain"),
            (&self.ffn_norm_bias, "feed-forward norm bias"),
        ] {
            ensure_dim(embed, vector.len(), context)?;
        }
        Ok(())
    }
}

impl KalmanFormerWeights {
    pub fn initialize(config: &KalmanFormerConfig, rng: &mut StdRng) -> Self {
        let (state, obs, embed) = (config.state_dim, config.obs_dim, config.embed_dim);

        let kalman = KalmanBlock {
            transition: Matrix::identity(state).map(|v| v * TRANSITION_DECAY),
            observation: eye(obs, state),
            process_noise: Matrix::identity(state).map(|v| v * PROCESS_NOISE),
            measurement_noise: Matrix::identity(obs).map(|v| v * MEASUREMENT_NOISE),
        };
        let layers = (0..config.num_layers)
            .map(|_| EncoderLayer::initialize(embed, rng))
            .collect();
        let embeddings = Embeddings {
            observation: gaussian_matrix(rng, embed, obs, 1.0 / (obs as f64).sqrt()),
            observation_bias: vec![0.0; embed],
            time: match config.time_embedding {
                TimeEmbedding::Learned => {
                    Some(gaussian_matrix(rng, embed, TIME_FEATURES, TIME_INIT_STD))
                }
                TimeEmbedding::Sinusoidal => None,
            },
            positional: positional_table(config.context_window, embed),
        };
        let gain_predictor = config.use_learned_gain.then(|| GainPredictor {
            weights: gaussian_matrix(rng, state * obs, embed, HEAD_INIT_STD),
            bias: (0..state * obs)
                .map(|k| {
                    if k / obs == k % obs {
                        0.0
                    } else {
                        OFF_DIAGONAL_GAIN_BIAS
                    }
                })
                .collect(),
        });
        let blend_predictor = (config.blend_mode == BlendMode::Learned).then(|| BlendPredictor {
            weights: vec![0.0; embed],
            bias: logit(config.blend_ratio),
        });

        Self {
            kalman,
            layers,
            embeddings,
            gain_predictor,
            blend_predictor,
            output_projection: gaussian_matrix(rng, state, embed, HEAD_INIT_STD),
            output_bias: vec![0.0; state],
            metadata: ModelMetadata::default(),
            config: config.clone(),
        }
    }

    pub fn state_dim(&self) -> usize {
        self.kalman.transition.rows()
    }

    pub fn obs_dim(&self) -> usize {
        self.kalman.observation.rows()
    }

    pub fn embed_dim(&self) -> usize {
        self.embeddings.observation.rows()
    }

    /// Check every tensor against the stored configuration.
    pub fn check_shapes(&self) -> EngineResult<()> {
        let config = &self.config;
        let (state, obs, embed) = (config.state_dim, config.obs_dim, config.embed_dim);

        ensure_dim(state, self.kalman.transition.rows(), "transition matrix")?;
        ensure_dim(state, self.kalman.transition.cols(), "transition matrix")?;
        ensure_dim(obs, self.kalman.observation.rows(), "observation matrix rows")?;
        ensure_dim(state, self.kalman.observation.cols(), "observation matrix cols")?;
        ensure_dim(state, self.kalman.process_noise.rows(), "process noise")?;
        ensure_dim(state, self.kalman.process_noise.cols(), "process noise")?;
        ensure_dim(obs, self.kalman.measurement_noise.rows(), "measurement noise")?;
        ensure_dim(obs, self.kalman.measurement_noise.cols(), "measurement noise")?;

        ensure_dim(config.num_layers, self.layers.len(), "encoder layers")?;
        for layer in &self.layers {
            layer.check_shapes(embed)?;
        }

        ensure_dim(embed, self.embeddings.observation.rows(), "observation embedding")?;
        ensure_dim(obs, self.embeddings.observation.cols(), "observation embedding")?;
        ensure_dim(embed, self.embeddings.observation_bias.len(), "embedding bias")?;
        if let Some(time) = &self.embeddings.time {
            ensure_dim(embed, time.rows(), "time embedding")?;
            ensure_dim(TIME_FEATURES, time.cols(), "time embedding")?;
        }
        ensure_dim(
            config.context_window,
            self.embeddings.positional.rows(),
            "positional table rows",
        )?;
        ensure_dim(embed, self.embeddings.positional.cols(), "positional table")?;

        if let Some(gain) = &self.gain_predictor {
            ensure_dim(state * obs, gain.weights.rows(), "gain predictor")?;
            ensure_dim(embed, gain.weights.cols(), "gain predictor")?;
            ensure_dim(state * obs, gain.bias.len(), "gain predictor bias")?;
        }
        if let Some(blend) = &self.blend_predictor {
            ensure_dim(embed, blend.weights.len(), "blend predictor")?;
        }
        ensure_dim(state, self.output_projection.rows(), "output projection")?;
        ensure_dim(embed, self.output_projection.cols(), "output projection")?;
        ensure_dim(state, self.output_bias.len(), "output bias")?;
        Ok(())
    }
}

impl Checkpointable for KalmanFormerWeights {
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        Self::write_snapshot(&Snapshot::current(self), path)
    }

    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let snapshot: Snapshot<KalmanFormerWeights> = Self::read_snapshot(path)?;
        let weights = snapshot.into_payload()?;
        weights.check_shapes()?;
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn weights(config: &KalmanFormerConfig) -> KalmanFormerWeights {
        KalmanFormerWeights::initialize(config, &mut StdRng::seed_from_u64(42))
    }

    #[test]
    fn default_shapes() {
        let w = weights(&KalmanFormerConfig::default());
        assert_eq!(w.layers.len(), 2);
        assert_eq!(w.layers[0].ffn_hidden.shape(), (64, 32));
        assert_eq!(w.embeddings.positional.shape(), (24, 32));
        assert!(w.embeddings.time.is_none());
        assert!(w.gain_predictor.is_none());
        assert!(w.blend_predictor.is_some());
        assert!((w.kalman.transition[(0, 0)] - 0.98).abs() < 1e-12);
        w.check_shapes().unwrap();
    }

    #[test]
    fn short_positional_table_is_rejected() {
        let mut w = weights(&KalmanFormerConfig::default());
        w.embeddings.positional = Matrix::zeros(12, 32);
        assert!(matches!(
            w.check_shapes(),
            Err(crate::error::EngineError::DimensionMismatch { expected: 24, got: 12, .. })
        ));
    }

    #[test]
    fn optional_heads_follow_config() {
        let config = KalmanFormerConfig {
            use_learned_gain: true,
            blend_mode: BlendMode::Fixed,
            time_embedding: TimeEmbedding::Learned,
            state_dim: 3,
            obs_dim: 2,
            ..KalmanFormerConfig::default()
        };
        let w = weights(&config);
        let gain = w.gain_predictor.as_ref().expect("gain head");
        assert_eq!(gain.weights.shape(), (6, 32));
        assert_eq!(gain.bias[0], 0.0);
        assert_eq!(gain.bias[1], OFF_DIAGONAL_GAIN_BIAS);
        assert_eq!(gain.bias[3], 0.0);
        assert!(w.blend_predictor.is_none());
        assert_eq!(w.embeddings.time.as_ref().map(Matrix::shape), Some((32, 4)));
        assert_eq!(w.kalman.observation.shape(), (2, 3));
        assert_eq!(w.kalman.observation[(1, 1)], 1.0);
        w.check_shapes().unwrap();
    }

    #[test]
    fn positional_table_starts_at_sin_zero_cos_one() {
        let table = positional_table(4, 6);
        assert_eq!(table[(0, 0)], 0.0);
        assert_eq!(table[(0, 1)], 1.0);
        assert!((table[(1, 0)] - 1.0_f64.sin()).abs() < 1e-12);
        assert!(table.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn checkpoint_roundtrip() {
        let w = weights(&KalmanFormerConfig {
            embed_dim: 8,
            num_heads: 2,
            num_layers: 1,
            ..KalmanFormerConfig::default()
        });
        let mut path = std::env::temp_dir();
        path.push(format!("cogstate_kalmanformer_weights_{}.bin", std::process::id()));
        w.save_checkpoint(&path).expect("save checkpoint");
        let restored = KalmanFormerWeights::load_checkpoint(&path).expect("load checkpoint");
        std::fs::remove_file(&path).ok();
        assert_eq!(restored, w);
    }
}
