//! Piecewise-linear recurrent network (PLRNN) forecasting.
//!
//! Transition law: `z' = A⊙z + W·ReLU(z) + C·bases + input + b_z`, with the
//! observation `x = B·z + b_x`. Training is hand-derived SGD, see
//! [`gradient`].

pub mod causal;
pub mod engine;
pub mod gradient;
pub mod training;
pub mod weights;

pub use causal::{
    CausalEdge, CausalNetwork, CausalNode, InterventionKind, InterventionResult, NetworkMetrics,
    SideEffect, EDGE_THRESHOLD, INTERVENTION_HORIZON,
};
pub use engine::{ForecastHorizon, PlrnnEngine, StabilityReport};
pub use weights::{DendriticWeights, ModelWeights, StepTrace};
