//! Pure matrix and vector operations.
//!
//! Every function allocates its result and leaves its inputs untouched.
//! Shape mismatches are programming errors inside the engines and are caught
//! by debug assertions; degenerate numerics are absorbed (see
//! [`mat_inverse`] and [`approximate_max_eigenvalue`]).

use tracing::warn;

use super::matrix::Matrix;

/// Pivots smaller than this are treated as zero during inversion.
const PIVOT_EPSILON: f64 = 1e-12;

/// Fixed number of power-iteration steps.
const POWER_ITERATIONS: usize = 20;

/// Vector norms below this are treated as underflow.
const NORM_EPSILON: f64 = 1e-12;

/// Matrix-vector product `M·v`.
pub fn mat_vec(m: &Matrix, v: &[f64]) -> Vec<f64> {
    debug_assert_eq!(m.cols(), v.len(), "mat_vec shape mismatch");
    (0..m.rows()).map(|r| dot(m.row(r), v)).collect()
}

/// Matrix product `A·B`.
pub fn mat_mul(a: &Matrix, b: &Matrix) -> Matrix {
    debug_assert_eq!(a.cols(), b.rows(), "mat_mul shape mismatch");
    let mut out = Matrix::zeros(a.rows(), b.cols());
    for i in 0..a.rows() {
        for k in 0..a.cols() {
            let aik = a[(i, k)];
            if aik == 0.0 {
                continue;
            }
            for j in 0..b.cols() {
                out[(i, j)] += aik * b[(k, j)];
            }
        }
    }
    out
}

pub fn transpose(m: &Matrix) -> Matrix {
    Matrix::from_fn(m.cols(), m.rows(), |r, c| m[(c, r)])
}

pub fn mat_add(a: &Matrix, b: &Matrix) -> Matrix {
    debug_assert_eq!(a.shape(), b.shape(), "mat_add shape mismatch");
    Matrix::from_fn(a.rows(), a.cols(), |r, c| a[(r, c)] + b[(r, c)])
}

pub fn mat_sub(a: &Matrix, b: &Matrix) -> Matrix {
    debug_assert_eq!(a.shape(), b.shape(), "mat_sub shape mismatch");
    Matrix::from_fn(a.rows(), a.cols(), |r, c| a[(r, c)] - b[(r, c)])
}

pub fn mat_scale(m: &Matrix, factor: f64) -> Matrix {
    m.map(|v| v * factor)
}

/// Gauss-Jordan inversion with partial pivoting.
///
/// Returns `None` when a pivot is numerically zero or the matrix is not
/// square.
pub fn try_inverse(m: &Matrix) -> Option<Matrix> {
    if !m.is_square() {
        return None;
    }
    let n = m.rows();
    let width = 2 * n;
    let mut aug = Matrix::from_fn(n, width, |r, c| {
        if c < n {
            m[(r, c)]
        } else if c - n == r {
            1.0
        } else {
            0.0
        }
    });

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_abs = aug[(col, col)].abs();
        for r in (col + 1)..n {
            let candidate = aug[(r, col)].abs();
            if candidate > pivot_abs {
                pivot_abs = candidate;
                pivot_row = r;
            }
        }
        if !(pivot_abs > PIVOT_EPSILON) {
            return None;
        }
        if pivot_row != col {
            for c in 0..width {
                let tmp = aug[(col, c)];
                aug[(col, c)] = aug[(pivot_row, c)];
                aug[(pivot_row, c)] = tmp;
            }
        }

        let pivot = aug[(col, col)];
        for value in aug.row_mut(col) {
            *value /= pivot;
        }

        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = aug[(r, col)];
            if factor == 0.0 {
                continue;
            }
            for c in 0..width {
                let delta = factor * aug[(col, c)];
                aug[(r, c)] -= delta;
            }
        }
    }

    Some(Matrix::from_fn(n, n, |r, c| aug[(r, c + n)]))
}

/// Inverse of `m`, or the identity when inversion fails.
///
/// The identity fallback means "proceed without the correction the inverse
/// would have provided"; callers that need to know use [`try_inverse`].
pub fn mat_inverse(m: &Matrix) -> Matrix {
    match try_inverse(m) {
        Some(inverse) => inverse,
        None => {
            warn!(
                rows = m.rows(),
                cols = m.cols(),
                "matrix inversion failed; falling back to identity"
            );
            Matrix::identity(m.rows())
        }
    }
}

/// Dominant eigenvalue magnitude estimate via power iteration.
///
/// Runs a fixed 20 iterations from the all-ones vector, normalising each
/// step. Returns 0 when the iterate underflows (e.g. the zero matrix).
pub fn approximate_max_eigenvalue(m: &Matrix) -> f64 {
    if !m.is_square() || m.rows() == 0 {
        return 0.0;
    }
    let mut v = vec![1.0 / (m.rows() as f64).sqrt(); m.rows()];
    let mut eigenvalue = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let next = mat_vec(m, &v);
        let magnitude = norm(&next);
        if !(magnitude > NORM_EPSILON) {
            return 0.0;
        }
        eigenvalue = magnitude;
        v = next.into_iter().map(|x| x / magnitude).collect();
    }
    eigenvalue
}

/// Outer product `a·bᵀ`.
pub fn outer(a: &[f64], b: &[f64]) -> Matrix {
    Matrix::from_fn(a.len(), b.len(), |r, c| a[r] * b[c])
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

pub fn vec_add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

pub fn vec_sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

pub fn vec_scale(v: &[f64], factor: f64) -> Vec<f64> {
    v.iter().map(|x| x * factor).collect()
}

/// Elementwise `(1 - t)·a + t·b`.
pub fn lerp(a: &[f64], b: &[f64], t: f64) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| (1.0 - t) * x + t * y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_close(a: &Matrix, b: &Matrix, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn mat_vec_and_mul_agree() {
        let a = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = Matrix::from_rows(&[vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        assert_eq!(mat_vec(&a, &[1.0, 1.0]), vec![3.0, 7.0]);
        let ab = mat_mul(&a, &b);
        assert_eq!(ab.to_rows(), vec![vec![2.0, 1.0], vec![4.0, 3.0]]);
        assert_eq!(transpose(&a).to_rows(), vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn inverse_round_trips_well_conditioned_matrices() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let m = Matrix::from_fn(5, 5, |r, c| {
                let noise = rng.gen::<f64>() - 0.5;
                if r == c {
                    3.0 + noise
                } else {
                    noise
                }
            });
            let product = mat_mul(&m, &mat_inverse(&m));
            assert_close(&product, &Matrix::identity(5), 1e-9);
        }
    }

    #[test]
    fn inverse_needs_pivoting() {
        let m = Matrix::from_rows(&[vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let inv = try_inverse(&m).expect("permutation matrix is invertible");
        assert_close(&inv, &m, 1e-12);
    }

    #[test]
    fn singular_inverse_falls_back_to_identity() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![2.0, 4.0]]).unwrap();
        assert!(try_inverse(&m).is_none());
        assert_eq!(mat_inverse(&m), Matrix::identity(2));
    }

    #[test]
    fn power_iteration_finds_dominant_eigenvalue() {
        let m = Matrix::diagonal(&[0.5, 2.0, 1.0]);
        assert!((approximate_max_eigenvalue(&m) - 2.0).abs() < 1e-3);
        assert_eq!(approximate_max_eigenvalue(&Matrix::zeros(3, 3)), 0.0);
    }

    #[test]
    fn outer_product_shape() {
        let m = outer(&[1.0, 2.0], &[3.0, 4.0, 5.0]);
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 2)], 10.0);
    }
}
