//! Engine configuration management via TOML files.
//!
//! Both engines read their own section (`[plrnn]`, `[kalmanformer]`); missing
//! sections and keys fall back to defaults.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Recurrent parameterisation of the PLRNN transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Dense,
    /// Route the latent state through a ReLU basis layer before coupling it
    /// back into the update.
    Dendritic,
}

impl FromStr for Connectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dense" => Ok(Connectivity::Dense),
            "dendritic" => Ok(Connectivity::Dendritic),
            other => Err(format!("unknown connectivity '{}'", other)),
        }
    }
}

/// How KalmanFormer chooses the weight of the transformer estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// Always use the configured ratio.
    Fixed,
    /// Logistic function of the latest context vector.
    Learned,
    /// Keep whatever ratio the state currently carries.
    Carried,
}

impl FromStr for BlendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BlendMode::Fixed),
            "learned" => Ok(BlendMode::Learned),
            "carried" => Ok(BlendMode::Carried),
            other => Err(format!("unknown blend mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeEmbedding {
    /// Linear projection of the time-of-day/day-of-week features.
    Learned,
    /// Fixed sinusoidal time-of-day/day-of-week encoding.
    Sinusoidal,
}

impl FromStr for TimeEmbedding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "learned" => Ok(TimeEmbedding::Learned),
            "sinusoidal" => Ok(TimeEmbedding::Sinusoidal),
            other => Err(format!("unknown time embedding '{}'", other)),
        }
    }
}

/// PLRNN hyperparameters.
///
/// # Examples
///
/// ```
/// use cogstate_core::PlrnnConfig;
///
/// let config = PlrnnConfig::from_str("[plrnn]\nlatent_dim = 3").unwrap();
/// assert_eq!(config.latent_dim, 3);
/// assert_eq!(config.prediction_horizon, 12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlrnnConfig {
    pub latent_dim: usize,
    /// Carried for compatibility with stored configs; the transition has no
    /// separate hidden layer.
    pub hidden_units: usize,
    pub num_bases: usize,
    pub connectivity: Connectivity,
    pub learning_rate: f64,
    pub teacher_forcing_ratio: f64,
    pub l1_regularization: f64,
    pub gradient_clip: f64,
    pub prediction_horizon: usize,
    pub dt_hours: f64,
    /// Multiplicative per-step uncertainty growth.
    pub uncertainty_growth: f64,
    /// Added to a dimension's uncertainty while `|z| > 2`.
    pub saturation_penalty: f64,
    pub uncertainty_ceiling: f64,
    /// Uncertainty assigned to states built from raw observations.
    pub initial_uncertainty: f64,
    /// Propagate output error to the latent layer through `Bᵀ` instead of `B`.
    pub exact_latent_backprop: bool,
    pub seed: u64,
}

impl PlrnnConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    /// Parse the `[plrnn]` section of a TOML document.
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(EngineConfig::from_str(toml_str)?.plrnn)
    }

    pub fn validate(&self) -> EngineResult<()> {
        positive_dim("plrnn.latent_dim", self.latent_dim)?;
        if self.connectivity == Connectivity::Dendritic {
            positive_dim("plrnn.num_bases", self.num_bases)?;
        }
        positive("plrnn.learning_rate", self.learning_rate)?;
        positive("plrnn.gradient_clip", self.gradient_clip)?;
        positive("plrnn.dt_hours", self.dt_hours)?;
        positive("plrnn.uncertainty_ceiling", self.uncertainty_ceiling)?;
        unit_interval("plrnn.teacher_forcing_ratio", self.teacher_forcing_ratio)?;
        non_negative("plrnn.l1_regularization", self.l1_regularization)?;
        non_negative("plrnn.uncertainty_growth", self.uncertainty_growth)?;
        non_negative("plrnn.saturation_penalty", self.saturation_penalty)?;
        non_negative("plrnn.initial_uncertainty", self.initial_uncertainty)?;
        Ok(())
    }
}

impl Default for PlrnnConfig {
    fn default() -> Self {
        RawPlrnnConfig::default().into_config()
    }
}

/// KalmanFormer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanFormerConfig {
    pub state_dim: usize,
    pub obs_dim: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub context_window: usize,
    /// Accepted and stored; inference and training are deterministic.
    pub dropout: f64,
    pub blend_ratio: f64,
    pub blend_mode: BlendMode,
    pub use_learned_gain: bool,
    pub attention_temperature: f64,
    pub time_embedding: TimeEmbedding,
    /// Longest gap (hours) bridged with repeated Kalman predict steps.
    pub max_interpolation_gap_hours: f64,
    pub dt_hours: f64,
    pub learning_rate: f64,
    pub gradient_clip: f64,
    /// Normalised innovation squared above which an observation is flagged.
    pub outlier_threshold: f64,
    pub uncertainty_ceiling: f64,
    pub seed: u64,
}

impl KalmanFormerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    /// Parse the `[kalmanformer]` section of a TOML document.
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(EngineConfig::from_str(toml_str)?.kalmanformer)
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads.max(1)
    }

    pub fn validate(&self) -> EngineResult<()> {
        positive_dim("kalmanformer.state_dim", self.state_dim)?;
        positive_dim("kalmanformer.obs_dim", self.obs_dim)?;
        positive_dim("kalmanformer.embed_dim", self.embed_dim)?;
        positive_dim("kalmanformer.num_heads", self.num_heads)?;
        positive_dim("kalmanformer.context_window", self.context_window)?;
        if self.embed_dim % self.num_heads != 0 {
            return Err(EngineError::invalid_config(
                "kalmanformer.embed_dim",
                self.embed_dim.to_string(),
                format!("must be divisible by num_heads ({})", self.num_heads),
            ));
        }
        positive("kalmanformer.attention_temperature", self.attention_temperature)?;
        positive("kalmanformer.dt_hours", self.dt_hours)?;
        positive("kalmanformer.learning_rate", self.learning_rate)?;
        positive("kalmanformer.gradient_clip", self.gradient_clip)?;
        positive("kalmanformer.outlier_threshold", self.outlier_threshold)?;
        positive("kalmanformer.uncertainty_ceiling", self.uncertainty_ceiling)?;
        unit_interval("kalmanformer.blend_ratio", self.blend_ratio)?;
        unit_interval("kalmanformer.dropout", self.dropout)?;
        non_negative(
            "kalmanformer.max_interpolation_gap_hours",
            self.max_interpolation_gap_hours,
        )?;
        Ok(())
    }
}

impl Default for KalmanFormerConfig {
    fn default() -> Self {
        RawKalmanFormerConfig::default().into_config()
    }
}

/// Complete engine configuration loaded from a TOML file.
///
/// # Examples
///
/// ```
/// use cogstate_core::EngineConfig;
///
/// let config = EngineConfig::load_from_file("config/engine.toml")
///     .unwrap_or_else(|_| EngineConfig::default());
///
/// println!("latent dimensions: {}", config.plrnn.latent_dim);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineConfig {
    pub plrnn: PlrnnConfig,
    pub kalmanformer: KalmanFormerConfig,
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawEngineConfig =
            toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let plrnn = raw.plrnn.try_into_config()?;
        let kalmanformer = raw.kalmanformer.try_into_config()?;
        plrnn
            .validate()
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        kalmanformer
            .validate()
            .map_err(|err| ConfigError::Parse(err.to_string()))?;

        Ok(Self {
            plrnn,
            kalmanformer,
        })
    }
}

fn positive_dim(parameter: &str, value: usize) -> EngineResult<()> {
    if value == 0 {
        return Err(EngineError::invalid_config(parameter, "0", "must be non-zero"));
    }
    Ok(())
}

fn positive(parameter: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(EngineError::invalid_config(
            parameter,
            value.to_string(),
            "must be positive",
        ));
    }
    Ok(())
}

fn non_negative(parameter: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::invalid_config(
            parameter,
            value.to_string(),
            "must be ≥ 0",
        ));
    }
    Ok(())
}

fn unit_interval(parameter: &str, value: f64) -> EngineResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::invalid_config(
            parameter,
            value.to_string(),
            "must lie in [0, 1]",
        ));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct RawEngineConfig {
    #[serde(default)]
    plrnn: RawPlrnnConfig,
    #[serde(default)]
    kalmanformer: RawKalmanFormerConfig,
}

#[derive(Debug, Deserialize)]
struct RawPlrnnConfig {
    #[serde(default = "default_dim")]
    latent_dim: usize,
    #[serde(default = "default_hidden_units")]
    hidden_units: usize,
    #[serde(default = "default_num_bases")]
    num_bases: usize,
    #[serde(default = "default_connectivity")]
    connectivity: String,
    #[serde(default = "default_learning_rate")]
    learning_rate: f64,
    #[serde(default = "default_teacher_forcing_ratio")]
    teacher_forcing_ratio: f64,
    #[serde(default = "default_l1_regularization")]
    l1_regularization: f64,
    #[serde(default = "default_gradient_clip")]
    gradient_clip: f64,
    #[serde(default = "default_prediction_horizon")]
    prediction_horizon: usize,
    #[serde(default = "default_dt_hours")]
    dt_hours: f64,
    #[serde(default = "default_uncertainty_growth")]
    uncertainty_growth: f64,
    #[serde(default = "default_saturation_penalty")]
    saturation_penalty: f64,
    #[serde(default = "default_uncertainty_ceiling")]
    uncertainty_ceiling: f64,
    #[serde(default = "default_initial_uncertainty")]
    initial_uncertainty: f64,
    #[serde(default)]
    exact_latent_backprop: bool,
    #[serde(default = "default_seed")]
    seed: u64,
}

impl Default for RawPlrnnConfig {
    fn default() -> Self {
        Self {
            latent_dim: default_dim(),
            hidden_units: default_hidden_units(),
            num_bases: default_num_bases(),
            connectivity: default_connectivity(),
            learning_rate: default_learning_rate(),
            teacher_forcing_ratio: default_teacher_forcing_ratio(),
            l1_regularization: default_l1_regularization(),
            gradient_clip: default_gradient_clip(),
            prediction_horizon: default_prediction_horizon(),
            dt_hours: default_dt_hours(),
            uncertainty_growth: default_uncertainty_growth(),
            saturation_penalty: default_saturation_penalty(),
            uncertainty_ceiling: default_uncertainty_ceiling(),
            initial_uncertainty: default_initial_uncertainty(),
            exact_latent_backprop: false,
            seed: default_seed(),
        }
    }
}

impl RawPlrnnConfig {
    fn try_into_config(self) -> Result<PlrnnConfig, ConfigError> {
        let connectivity = self
            .connectivity
            .parse()
            .map_err(|err: String| ConfigError::Parse(format!("plrnn.connectivity: {}", err)))?;
        Ok(self.with_connectivity(connectivity))
    }

    /// Defaults always parse, so the fallback is never taken.
    fn into_config(self) -> PlrnnConfig {
        let connectivity = self.connectivity.parse().unwrap_or(Connectivity::Dense);
        self.with_connectivity(connectivity)
    }

    fn with_connectivity(self, connectivity: Connectivity) -> PlrnnConfig {
        PlrnnConfig {
            latent_dim: self.latent_dim,
            hidden_units: self.hidden_units,
            num_bases: self.num_bases,
            connectivity,
            learning_rate: self.learning_rate,
            teacher_forcing_ratio: self.teacher_forcing_ratio,
            l1_regularization: self.l1_regularization,
            gradient_clip: self.gradient_clip,
            prediction_horizon: self.prediction_horizon,
            dt_hours: self.dt_hours,
            uncertainty_growth: self.uncertainty_growth,
            saturation_penalty: self.saturation_penalty,
            uncertainty_ceiling: self.uncertainty_ceiling,
            initial_uncertainty: self.initial_uncertainty,
            exact_latent_backprop: self.exact_latent_backprop,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawKalmanFormerConfig {
    #[serde(default = "default_dim")]
    state_dim: usize,
    #[serde(default = "default_dim")]
    obs_dim: usize,
    #[serde(default = "default_embed_dim")]
    embed_dim: usize,
    #[serde(default = "default_num_heads")]
    num_heads: usize,
    #[serde(default = "default_num_layers")]
    num_layers: usize,
    #[serde(default = "default_context_window")]
    context_window: usize,
    #[serde(default = "default_dropout")]
    dropout: f64,
    #[serde(default = "default_blend_ratio")]
    blend_ratio: f64,
    #[serde(default = "default_blend_mode")]
    blend_mode: String,
    #[serde(default)]
    use_learned_gain: bool,
    #[serde(default = "default_attention_temperature")]
    attention_temperature: f64,
    #[serde(default = "default_time_embedding")]
    time_embedding: String,
    #[serde(default = "default_max_interpolation_gap_hours")]
    max_interpolation_gap_hours: f64,
    #[serde(default = "default_dt_hours")]
    dt_hours: f64,
    #[serde(default = "default_learning_rate")]
    learning_rate: f64,
    #[serde(default = "default_gradient_clip")]
    gradient_clip: f64,
    #[serde(default = "default_outlier_threshold")]
    outlier_threshold: f64,
    #[serde(default = "default_uncertainty_ceiling")]
    uncertainty_ceiling: f64,
    #[serde(default = "default_seed")]
    seed: u64,
}

impl Default for RawKalmanFormerConfig {
    fn default() -> Self {
        Self {
            state_dim: default_dim(),
            obs_dim: default_dim(),
            embed_dim: default_embed_dim(),
            num_heads: default_num_heads(),
            num_layers: default_num_layers(),
            context_window: default_context_window(),
            dropout: default_dropout(),
            blend_ratio: default_blend_ratio(),
            blend_mode: default_blend_mode(),
            use_learned_gain: false,
            attention_temperature: default_attention_temperature(),
            time_embedding: default_time_embedding(),
            max_interpolation_gap_hours: default_max_interpolation_gap_hours(),
            dt_hours: default_dt_hours(),
            learning_rate: default_learning_rate(),
            gradient_clip: default_gradient_clip(),
            outlier_threshold: default_outlier_threshold(),
            uncertainty_ceiling: default_uncertainty_ceiling(),
            seed: default_seed(),
        }
    }
}

impl RawKalmanFormerConfig {
    fn try_into_config(self) -> Result<KalmanFormerConfig, ConfigError> {
        let blend_mode = self.blend_mode.parse().map_err(|err: String| {
            ConfigError::Parse(format!("kalmanformer.blend_mode: {}", err))
        })?;
        let time_embedding = self.time_embedding.parse().map_err(|err: String| {
            ConfigError::Parse(format!("kalmanformer.time_embedding: {}", err))
        })?;
        Ok(self.with_modes(blend_mode, time_embedding))
    }

    /// Defaults always parse, so the fallbacks are never taken.
    fn into_config(self) -> KalmanFormerConfig {
        let blend_mode = self.blend_mode.parse().unwrap_or(BlendMode::Learned);
        let time_embedding = self
            .time_embedding
            .parse()
            .unwrap_or(TimeEmbedding::Sinusoidal);
        self.with_modes(blend_mode, time_embedding)
    }

    fn with_modes(
        self,
        blend_mode: BlendMode,
        time_embedding: TimeEmbedding,
    ) -> KalmanFormerConfig {
        KalmanFormerConfig {
            state_dim: self.state_dim,
            obs_dim: self.obs_dim,
            embed_dim: self.embed_dim,
            num_heads: self.num_heads,
            num_layers: self.num_layers,
            context_window: self.context_window,
            dropout: self.dropout,
            blend_ratio: self.blend_ratio,
            blend_mode,
            use_learned_gain: self.use_learned_gain,
            attention_temperature: self.attention_temperature,
            time_embedding,
            max_interpolation_gap_hours: self.max_interpolation_gap_hours,
            dt_hours: self.dt_hours,
            learning_rate: self.learning_rate,
            gradient_clip: self.gradient_clip,
            outlier_threshold: self.outlier_threshold,
            uncertainty_ceiling: self.uncertainty_ceiling,
            seed: self.seed,
        }
    }
}

fn default_dim() -> usize {
    5
}

fn default_hidden_units() -> usize {
    16
}

fn default_num_bases() -> usize {
    8
}

fn default_connectivity() -> String {
    "dense".to_string()
}

fn default_learning_rate() -> f64 {
    0.001
}

fn default_teacher_forcing_ratio() -> f64 {
    0.5
}

fn default_l1_regularization() -> f64 {
    0.01
}

fn default_gradient_clip() -> f64 {
    1.0
}

fn default_prediction_horizon() -> usize {
    12
}

fn default_dt_hours() -> f64 {
    1.0
}

fn default_uncertainty_growth() -> f64 {
    0.05
}

fn default_saturation_penalty() -> f64 {
    0.1
}

fn default_uncertainty_ceiling() -> f64 {
    1.0
}

fn default_initial_uncertainty() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_embed_dim() -> usize {
    32
}

fn default_num_heads() -> usize {
    4
}

fn default_num_layers() -> usize {
    2
}

fn default_context_window() -> usize {
    24
}

fn default_dropout() -> f64 {
    0.1
}

fn default_blend_ratio() -> f64 {
    0.5
}

fn default_blend_mode() -> String {
    "learned".to_string()
}

fn default_attention_temperature() -> f64 {
    1.0
}

fn default_time_embedding() -> String {
    "sinusoidal".to_string()
}

fn default_max_interpolation_gap_hours() -> f64 {
    6.0
}

/// χ² with 5 degrees of freedom at p = 0.01.
fn default_outlier_threshold() -> f64 {
    15.09
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "IO error: {}", err),
            ConfigError::Parse(err) => write!(f, "Parse error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_sections_missing() {
        let config = EngineConfig::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.plrnn.latent_dim, 5);
        assert_eq!(config.plrnn.connectivity, Connectivity::Dense);
        assert!((config.plrnn.l1_regularization - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.kalmanformer.context_window, 24);
        assert_eq!(config.kalmanformer.blend_mode, BlendMode::Learned);
        assert_eq!(config.kalmanformer.head_dim(), 8);
    }

    #[test]
    fn plrnn_section_parses_custom_values() {
        let toml = "[plrnn]\nlatent_dim = 3\nconnectivity = \"dendritic\"\nnum_bases = 4\nexact_latent_backprop = true";
        let config = PlrnnConfig::from_str(toml).unwrap();
        assert_eq!(config.latent_dim, 3);
        assert_eq!(config.connectivity, Connectivity::Dendritic);
        assert_eq!(config.num_bases, 4);
        assert!(config.exact_latent_backprop);
        assert_eq!(config.prediction_horizon, 12);
    }

    #[test]
    fn kalmanformer_section_parses_custom_values() {
        let toml = "[kalmanformer]\nembed_dim = 16\nnum_heads = 2\nblend_mode = \"fixed\"\ntime_embedding = \"learned\"\nuse_learned_gain = true";
        let config = KalmanFormerConfig::from_str(toml).unwrap();
        assert_eq!(config.embed_dim, 16);
        assert_eq!(config.blend_mode, BlendMode::Fixed);
        assert_eq!(config.time_embedding, TimeEmbedding::Learned);
        assert!(config.use_learned_gain);
    }

    #[test]
    fn rejects_unknown_modes() {
        let err = EngineConfig::from_str("[plrnn]\nconnectivity = \"sparse\"").unwrap_err();
        assert!(err.to_string().contains("connectivity"));
        assert!(EngineConfig::from_str("[kalmanformer]\nblend_mode = \"auto\"").is_err());
    }

    #[test]
    fn rejects_indivisible_heads() {
        let err = EngineConfig::from_str("[kalmanformer]\nembed_dim = 30\nnum_heads = 4")
            .unwrap_err();
        assert!(err.to_string().contains("num_heads"));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut plrnn = PlrnnConfig::default();
        plrnn.teacher_forcing_ratio = 1.5;
        assert!(matches!(
            plrnn.validate(),
            Err(EngineError::InvalidConfiguration { .. })
        ));

        let mut kf = KalmanFormerConfig::default();
        kf.attention_temperature = 0.0;
        assert!(kf.validate().is_err());
        kf.attention_temperature = 1.0;
        kf.state_dim = 0;
        assert!(kf.validate().is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::load_from_file("does/not/exist.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
