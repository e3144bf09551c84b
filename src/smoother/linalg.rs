//! Dense linear-algebra kernel bridging `ndarray` matrices to `faer`
//! decompositions.
//!
//! All smoother algebra is expressed on `Array2<f64>`; this module is the
//! only place that talks to `faer`. Crossing the boundary always copies into
//! an owned `Mat`: the matrices here are at most a few hundred on a side and
//! every decomposition is cubic, so chasing zero-copy layouts would buy
//! nothing but layout bookkeeping.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::Diag;
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{get_global_parallelism, Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: faer::diag::DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

/// Element-wise copy into faer's owned matrix type, indifferent to the
/// ndarray layout (contiguous, transposed or strided alike).
fn to_faer<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    Mat::from_fn(array.nrows(), array.ncols(), |i, j| array[(i, j)])
}

/// Thin SVD. Singular values are returned in descending order; `u` is
/// `m x k` and `v` is `n x k` with `k = min(m, n)`.
pub trait ThinSvd {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> ThinSvd for ArrayBase<S, Ix2> {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError> {
        let faer_mat = to_faer(self);
        let (rows, cols) = (faer_mat.nrows(), faer_mat.ncols());
        let k = rows.min(cols);

        let mut singular = Diag::<f64>::zeros(k);
        let mut u_storage = Mat::<f64>::zeros(rows, rows);
        let mut v_storage = Mat::<f64>::zeros(cols, cols);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Full,
            ComputeSvdVectors::Full,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);
        svd::svd(
            faer_mat.as_ref(),
            singular.as_mut(),
            Some(u_storage.as_mut()),
            Some(v_storage.as_mut()),
            par,
            &mut stack,
            Default::default(),
        )
        .map_err(|_| LinalgError::SvdNoConvergence)?;

        let sigma = diag_to_array(singular.as_ref());
        let u = Array2::from_shape_fn((rows, k), |(i, j)| u_storage[(i, j)]);
        let v = Array2::from_shape_fn((cols, k), |(i, j)| v_storage[(i, j)]);
        Ok((u, sigma, v))
    }
}

/// Self-adjoint eigendecomposition; eigenvalues ascending, columns of the
/// returned matrix are the matching eigenvectors.
pub trait Eigh {
    fn eigh(&self) -> Result<(Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> Eigh for ArrayBase<S, Ix2> {
    fn eigh(&self) -> Result<(Array1<f64>, Array2<f64>), LinalgError> {
        let eigen = to_faer(self)
            .as_ref()
            .self_adjoint_eigen(Side::Lower)
            .map_err(LinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        Ok((values, mat_to_array(eigen.U())))
    }
}

/// Solve `a x = b` for square `a` via partial-pivot LU.
pub fn lu_solve(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    debug_assert_eq!(a.nrows(), a.ncols());
    debug_assert_eq!(a.ncols(), b.nrows());
    let rhs = to_faer(b);
    let lu = to_faer(a).as_ref().partial_piv_lu();
    let x = lu.solve(rhs.as_ref());
    mat_to_array(x.as_ref())
}

/// Thin QR; returns only the orthonormal factor `q` (`m x min(m, n)`).
pub fn qr_q(a: &Array2<f64>) -> Array2<f64> {
    let qr = to_faer(a).as_ref().qr();
    let q = qr.compute_Q();
    let k = a.nrows().min(a.ncols());
    let q_ref = q.as_ref();
    Array2::from_shape_fn((a.nrows(), k), |(i, j)| q_ref[(i, j)])
}

/// Subtract the mean across columns from every column: `m * (I - 11'/n)`.
pub fn subtract_column_mean<S: Data<Elem = f64>>(m: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let row_means = m
        .mean_axis(Axis(1))
        .expect("anomaly of a matrix with zero columns");
    let mut out = m.to_owned();
    for mut col in out.axis_iter_mut(Axis(1)) {
        col -= &row_means;
    }
    out
}

/// Scaled anomalies `(m - mean) / sqrt(n_cols - 1)`.
pub fn anomalies<S: Data<Elem = f64>>(m: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let nsc = 1.0 / ((m.ncols() as f64 - 1.0).sqrt());
    subtract_column_mean(m) * nsc
}

pub fn frobenius_norm(m: &Array2<f64>) -> f64 {
    m.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Relative Frobenius distance, with an absolute fallback near zero.
pub fn relative_frobenius(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    let denom = frobenius_norm(a).max(frobenius_norm(b));
    let diff = frobenius_norm(&(a - b));
    if denom > 0.0 { diff / denom } else { diff }
}

/// Equality up to a relative Frobenius tolerance.
pub fn approx_eq(a: &Array2<f64>, b: &Array2<f64>, rtol: f64) -> bool {
    a.dim() == b.dim() && relative_frobenius(a, b) <= rtol
}
