//! Dense linear algebra written for the small matrices the engines use.
//!
//! Matrices here are at most a few dozen rows; clarity wins over blocking or
//! SIMD.

pub mod activation;
pub mod matrix;
pub mod ops;

pub use activation::{clamp_unit, layer_norm, logit, relu, relu_derivative, sigmoid, softmax};
pub use matrix::Matrix;
pub use ops::{
    approximate_max_eigenvalue, dot, lerp, mat_add, mat_inverse, mat_mul, mat_scale, mat_sub,
    mat_vec, norm, outer, transpose, try_inverse, vec_add, vec_scale, vec_sub,
};
