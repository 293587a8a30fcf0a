//! PLRNN parameters and the transition law.

use std::path::Path;

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointError, Checkpointable, Snapshot};
use crate::config::{Connectivity, PlrnnConfig};
use crate::error::{ensure_dim, EngineResult};
use crate::linalg::{mat_vec, relu, Matrix};
use crate::model::ModelMetadata;

/// Fraction of recurrent entries that start non-zero.
const RECURRENT_DENSITY: f64 = 0.2;
const RECURRENT_INIT_STD: f64 = 0.1;
const BIAS_INIT_STD: f64 = 0.01;
const DENDRITIC_INIT_STD: f64 = 0.1;

/// Basis layer used when connectivity is dendritic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DendriticWeights {
    /// `bases × D`; `bases = ReLU(basis · z)`.
    pub basis: Matrix,
    /// `D × bases`; adds `C · bases` to the transition.
    pub coupling: Matrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Diagonal self-connections `A`.
    pub self_weights: Vec<f64>,
    /// Cross-dimension weights `W`; entry `(i, j)` is the effect of `j` on `i`.
    pub recurrent: Matrix,
    /// Latent-to-observed projection `B`.
    pub observation: Matrix,
    pub dendritic: Option<DendriticWeights>,
    pub bias_latent: Vec<f64>,
    pub bias_observed: Vec<f64>,
    pub metadata: ModelMetadata,
    /// Configuration the weights were built with.
    pub config: PlrnnConfig,
}

/// Intermediate values of one transition, kept for the gradient step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTrace {
    /// `ReLU(z_t)`.
    pub activation: Vec<f64>,
    /// Dendritic basis activations, when present.
    pub bases: Option<Vec<f64>>,
    /// `z_{t+1}`.
    pub latent: Vec<f64>,
    /// `B · z_{t+1} + b_x`.
    pub observed: Vec<f64>,
}

fn gaussian(rng: &mut StdRng, std: f64) -> f64 {
    rng.sample::<f64, _>(StandardNormal) * std
}

impl ModelWeights {
    /// Fresh weights: near-identity self-weights, sparse recurrence,
    /// identity observation matrix and small biases.
    pub fn initialize(config: &PlrnnConfig, rng: &mut StdRng) -> Self {
        let dim = config.latent_dim;
        let self_weights = (0..dim).map(|_| rng.gen_range(0.9..=1.0)).collect();
        let recurrent = Matrix::from_fn(dim, dim, |r, c| {
            if r != c && rng.gen::<f64>() < RECURRENT_DENSITY {
                gaussian(rng, RECURRENT_INIT_STD)
            } else {
                0.0
            }
        });
        let bias_latent = (0..dim).map(|_| gaussian(rng, BIAS_INIT_STD)).collect();
        let bias_observed = (0..dim).map(|_| gaussian(rng, BIAS_INIT_STD)).collect();
        let dendritic = match config.connectivity {
            Connectivity::Dense => None,
            Connectivity::Dendritic => {
                let bases = config.num_bases;
                Some(DendriticWeights {
                    basis: Matrix::from_fn(bases, dim, |_, _| gaussian(rng, DENDRITIC_INIT_STD)),
                    coupling: Matrix::from_fn(dim, bases, |_, _| {
                        gaussian(rng, DENDRITIC_INIT_STD)
                    }),
                })
            }
        };

        Self {
            self_weights,
            recurrent,
            observation: Matrix::identity(dim),
            dendritic,
            bias_latent,
            bias_observed,
            metadata: ModelMetadata::default(),
            config: config.clone(),
        }
    }

    pub fn dim(&self) -> usize {
        self.self_weights.len()
    }

    /// Check that every tensor agrees with the latent dimensionality.
    pub fn check_shapes(&self) -> EngineResult<()> {
        let dim = self.dim();
        ensure_dim(self.config.latent_dim, dim, "self weights")?;
        ensure_dim(dim, self.recurrent.rows(), "recurrent rows")?;
        ensure_dim(dim, self.recurrent.cols(), "recurrent cols")?;
        ensure_dim(dim, self.observation.rows(), "observation rows")?;
        ensure_dim(dim, self.observation.cols(), "observation cols")?;
        ensure_dim(dim, self.bias_latent.len(), "latent bias")?;
        ensure_dim(dim, self.bias_observed.len(), "observed bias")?;
        if let Some(dendritic) = &self.dendritic {
            ensure_dim(dim, dendritic.basis.cols(), "dendritic basis cols")?;
            ensure_dim(dim, dendritic.coupling.rows(), "dendritic coupling rows")?;
            ensure_dim(
                dendritic.basis.rows(),
                dendritic.coupling.cols(),
                "dendritic coupling cols",
            )?;
        }
        Ok(())
    }

    /// `x = B·z + b_x`.
    pub fn observe(&self, latent: &[f64]) -> Vec<f64> {
        mat_vec(&self.observation, latent)
            .into_iter()
            .zip(&self.bias_observed)
            .map(|(x, b)| x + b)
            .collect()
    }

    /// `z' = A⊙z + W·ReLU(z) + C·bases + input + b_z`, then observe.
    pub fn step(&self, latent: &[f64], input: Option<&[f64]>) -> StepTrace {
        let activation = relu(latent);
        let recurrent = mat_vec(&self.recurrent, &activation);
        let bases = self
            .dendritic
            .as_ref()
            .map(|dendritic| relu(&mat_vec(&dendritic.basis, latent)));
        let coupled = match (&self.dendritic, &bases) {
            (Some(dendritic), Some(bases)) => Some(mat_vec(&dendritic.coupling, bases)),
            _ => None,
        };

        let next: Vec<f64> = (0..self.dim())
            .map(|i| {
                let mut z = self.self_weights[i] * latent[i] + recurrent[i] + self.bias_latent[i];
                if let Some(coupled) = &coupled {
                    z += coupled[i];
                }
                if let Some(input) = input {
                    z += input[i];
                }
                z
            })
            .collect();
        let observed = self.observe(&next);

        StepTrace {
            activation,
            bases,
            latent: next,
            observed,
        }
    }

    /// Dense view of the linearised dynamics, `diag(A) + W`.
    pub fn jacobian_proxy(&self) -> Matrix {
        let mut matrix = self.recurrent.clone();
        for (i, a) in self.self_weights.iter().enumerate() {
            matrix[(i, i)] += a;
        }
        matrix
    }
}

impl Checkpointable for ModelWeights {
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        Self::write_snapshot(&Snapshot::current(self), path)
    }

    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let snapshot: Snapshot<ModelWeights> = Self::read_snapshot(path)?;
        let weights = snapshot.into_payload()?;
        weights.check_shapes()?;
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn weights(connectivity: Connectivity) -> ModelWeights {
        let config = PlrnnConfig {
            connectivity,
            ..PlrnnConfig::default()
        };
        ModelWeights::initialize(&config, &mut StdRng::seed_from_u64(42))
    }

    #[test]
    fn initialization_ranges() {
        let w = weights(Connectivity::Dense);
        assert_eq!(w.dim(), 5);
        assert!(w.self_weights.iter().all(|a| (0.9..=1.0).contains(a)));
        assert_eq!(w.observation, Matrix::identity(5));
        assert!(w.dendritic.is_none());
        for i in 0..5 {
            assert_eq!(w.recurrent[(i, i)], 0.0);
        }
        assert!(w.bias_latent.iter().all(|b| b.abs() < 0.1));
        w.check_shapes().unwrap();
    }

    #[test]
    fn dendritic_shapes() {
        let w = weights(Connectivity::Dendritic);
        let dendritic = w.dendritic.as_ref().expect("dendritic weights");
        assert_eq!(dendritic.basis.shape(), (8, 5));
        assert_eq!(dendritic.coupling.shape(), (5, 8));
        let trace = w.step(&[0.5; 5], None);
        assert_eq!(trace.bases.as_ref().map(Vec::len), Some(8));
        assert_eq!(trace.latent.len(), 5);
    }

    #[test]
    fn same_seed_same_weights() {
        assert_eq!(weights(Connectivity::Dense), weights(Connectivity::Dense));
    }

    #[test]
    fn step_with_zero_recurrence_is_affine() {
        let mut w = weights(Connectivity::Dense);
        w.recurrent = Matrix::zeros(5, 5);
        w.self_weights = vec![1.0; 5];
        w.bias_latent = vec![0.1; 5];
        w.bias_observed = vec![0.0; 5];
        let input = [0.0, 0.0, 0.0, 0.0, 1.0];
        let trace = w.step(&[0.2, -0.3, 0.0, 1.0, 0.5], Some(&input[..]));
        let expected = [0.3, -0.2, 0.1, 1.1, 1.6];
        for (z, e) in trace.latent.iter().zip(expected) {
            assert!((z - e).abs() < 1e-12);
        }
        assert_eq!(trace.observed, trace.latent);
        assert_eq!(trace.activation, vec![0.2, 0.0, 0.0, 1.0, 0.5]);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let w = weights(Connectivity::Dendritic);
        let mut path = std::env::temp_dir();
        path.push(format!("cogstate_plrnn_weights_{}.bin", std::process::id()));
        w.save_checkpoint(&path).expect("save checkpoint");
        let restored = ModelWeights::load_checkpoint(&path).expect("load checkpoint");
        std::fs::remove_file(&path).ok();
        assert_eq!(restored, w);
    }

    #[test]
    fn checkpoint_rejects_inconsistent_shapes() {
        let mut w = weights(Connectivity::Dense);
        w.bias_latent.pop();
        let mut path = std::env::temp_dir();
        path.push(format!("cogstate_plrnn_bad_{}.bin", std::process::id()));
        w.save_checkpoint(&path).expect("save checkpoint");
        let err = ModelWeights::load_checkpoint(&path).expect_err("shape mismatch");
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, CheckpointError::InvalidFormat(msg) if msg.contains("latent bias")));
    }
}
