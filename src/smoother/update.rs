//! The update kernel: builds the transform `X` from predicted measurements,
//! observation errors and perturbations, and applies it to the ensemble.
//!
//! Two entry points share the same algebra:
//!
//! - [`make_x`] is the single-shot ensemble smoother (ES): it returns the
//!   transform for `A <- A * X` computed with a zero coefficient matrix and
//!   a full Gauss-Newton step.
//! - [`update_ensemble`] is one outer iteration of the iterative ensemble
//!   smoother (IES): it advances the coefficient matrix held in
//!   [`SmootherState`] with step length `gamma` and rebuilds the ensemble
//!   from the stored prior, `A <- A0 * (I + W * pi / sqrt(N - 1))`.
//!
//! With one iteration, `gamma = 1` and the same inversion, the two paths run
//! the identical sequence of operations, which is what the ES/IES
//! equivalence regression test pins down.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use thiserror::Error;

use crate::smoother::config::{Inversion, SmootherConfig, Truncation};
use crate::smoother::linalg::{
    anomalies, frobenius_norm, lu_solve, qr_q, subtract_column_mean, Eigh, LinalgError, ThinSvd,
};
use crate::smoother::state::SmootherState;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    #[error("shape mismatch: {context} is {got:?}, expected {expected:?}")]
    ShapeMismatch {
        context: &'static str,
        got: (usize, usize),
        expected: (usize, usize),
    },
    #[error("predicted measurements carry no ensemble variation; nothing to invert")]
    DegenerateSpectrum,
}

/// What one kernel call did.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOutcome {
    /// False when the call was a numerical no-op (fewer than two active
    /// realizations or no active observations).
    pub applied: bool,
    pub iteration: usize,
    pub step_length: f64,
    pub converged: bool,
}

fn check_shapes(
    s: ArrayView2<f64>,
    r: ArrayView2<f64>,
    e: ArrayView2<f64>,
    d: ArrayView2<f64>,
) -> Result<(), UpdateError> {
    let dim = s.dim();
    let nrobs = dim.0;
    if r.dim() != (nrobs, nrobs) {
        return Err(UpdateError::ShapeMismatch {
            context: "observation-error covariance",
            got: r.dim(),
            expected: (nrobs, nrobs),
        });
    }
    for (context, got) in [("perturbations", e.dim()), ("innovations", d.dim())] {
        if got != dim {
            return Err(UpdateError::ShapeMismatch {
                context,
                got,
                expected: dim,
            });
        }
    }
    Ok(())
}

/// `X = I + (w * pi) / sqrt(N - 1)`.
fn transform_from_coefficients(w: &Array2<f64>) -> Array2<f64> {
    let n = w.ncols();
    let nsc = 1.0 / ((n as f64 - 1.0).sqrt());
    let mut x = subtract_column_mean(w) * nsc;
    for i in 0..n {
        x[(i, i)] += 1.0;
    }
    x
}

/// Project `y` and `d` onto the row space of the ensemble anomalies, to
/// prevent rank collapse when the parameter space is smaller than the
/// ensemble span.
fn aa_project(a: ArrayView2<f64>, y: &mut Array2<f64>, d: &mut Array2<f64>) {
    let delta = anomalies(&a);
    let q = qr_q(&delta.t().to_owned());
    let projector = q.dot(&q.t());
    *y = y.dot(&projector);
    *d = d.dot(&projector);
}

/// One Gauss-Newton move of the coefficient matrix:
/// `w <- (1 - gamma) * w0 + gamma * S' C^+ H` with `H = D + S w0` and `S`
/// the anomalies propagated through `Omega = I + (w0 * pi) / sqrt(N - 1)`.
fn advance_coefficients(
    w0: &Array2<f64>,
    y: &Array2<f64>,
    d: &Array2<f64>,
    r: ArrayView2<f64>,
    e: &Array2<f64>,
    inversion: Inversion,
    truncation: Truncation,
    gamma: f64,
) -> Result<Array2<f64>, UpdateError> {
    let ens_size = y.ncols();
    let nsc = 1.0 / ((ens_size as f64 - 1.0).sqrt());

    let mut omega = subtract_column_mean(w0) * nsc;
    for i in 0..ens_size {
        omega[(i, i)] += 1.0;
    }
    // S solves S Omega = Y, written as Omega' S' = Y'.
    let s_prop_t = lu_solve(&omega.t().to_owned(), &y.t().to_owned());
    let s_prop = s_prop_t.t().to_owned();

    let h = d + &s_prop.dot(w0);

    let target = match inversion {
        Inversion::Exact => exact_solve(&s_prop, r, &h, truncation)?,
        Inversion::SubspaceExactR | Inversion::SubspaceEeR => {
            subspace_solve(&s_prop, r, e, &h, inversion, truncation)?
        }
    };

    Ok(w0 * (1.0 - gamma) + target * gamma)
}

/// `S' C^+ H` with `C = S S' + R` inverted through a truncated self-adjoint
/// eigendecomposition.
fn exact_solve(
    s_prop: &Array2<f64>,
    r: ArrayView2<f64>,
    h: &Array2<f64>,
    truncation: Truncation,
) -> Result<Array2<f64>, UpdateError> {
    let c = s_prop.dot(&s_prop.t()) + &r;
    let (values, vectors) = c.eigh()?;
    let nrobs = values.len();

    // eigh returns ascending order; truncate on the descending spectrum.
    let order: Vec<usize> = (0..nrobs).rev().collect();
    let sigma: Vec<f64> = order.iter().map(|&i| values[i].max(0.0).sqrt()).collect();
    let kept = truncation.significant(&sigma);
    if kept == 0 {
        return Err(UpdateError::DegenerateSpectrum);
    }

    let mut solved = Array2::zeros(h.dim());
    for &i in order.iter().take(kept) {
        let v = vectors.column(i);
        let vt_h = v.dot(h);
        let scale = 1.0 / values[i];
        for (row, &vi) in v.iter().enumerate() {
            for (col, &p) in vt_h.iter().enumerate() {
                solved[(row, col)] += vi * p * scale;
            }
        }
    }
    Ok(s_prop.t().dot(&solved))
}

/// `S' C^+ H` via the subspace pseudo-inversion: truncated SVD of `S`, the
/// error covariance (exact `R` or the `E E'` estimate) rotated into the
/// singular basis, and the eigenvalue correction `1 / (1 + lambda)`.
fn subspace_solve(
    s_prop: &Array2<f64>,
    r: ArrayView2<f64>,
    e: &Array2<f64>,
    h: &Array2<f64>,
    inversion: Inversion,
    truncation: Truncation,
) -> Result<Array2<f64>, UpdateError> {
    let ens_size = s_prop.ncols() as f64;
    let nsc2 = 1.0 / (ens_size - 1.0);

    let (u, sigma, _v) = s_prop.thin_svd()?;
    let nr = truncation.significant(sigma.as_slice().expect("contiguous singular values"));
    if nr == 0 {
        return Err(UpdateError::DegenerateSpectrum);
    }
    let u0 = u.slice(ndarray::s![.., ..nr]);

    let cd = match inversion {
        Inversion::SubspaceExactR => &r * nsc2,
        Inversion::SubspaceEeR => e.dot(&e.t()) * (nsc2 * nsc2),
        Inversion::Exact => unreachable!("exact inversion handled separately"),
    };

    // b = (N - 1) * Sigma^-1 U0' Cd U0 Sigma^-1, symmetric by construction.
    let mut b = u0.t().dot(&cd).dot(&u0) * (ens_size - 1.0);
    for i in 0..nr {
        for j in 0..nr {
            b[(i, j)] /= sigma[i] * sigma[j];
        }
    }
    let (lambda, z) = b.eigh()?;

    // x1 = U0 Sigma^-1 Z
    let mut u0_scaled = u0.to_owned();
    for (j, mut col) in u0_scaled.axis_iter_mut(Axis(1)).enumerate() {
        col /= sigma[j];
    }
    let x1 = u0_scaled.dot(&z);

    let eig: Array1<f64> = lambda.mapv(|l| 1.0 / (1.0 + l.max(0.0)));
    let mut x1t_h = x1.t().dot(h);
    for (i, mut row) in x1t_h.axis_iter_mut(Axis(0)).enumerate() {
        row *= eig[i];
    }
    let x3 = x1.dot(&x1t_h);
    Ok(s_prop.t().dot(&x3))
}

/// Single-shot ES transform. The caller applies it as `A <- A * X`.
///
/// `a` is only consulted when the anti-collapse projection is enabled; pass
/// the current active ensemble in that case.
pub fn make_x(
    s: ArrayView2<f64>,
    r: ArrayView2<f64>,
    e: ArrayView2<f64>,
    d: ArrayView2<f64>,
    config: &SmootherConfig,
    a: Option<ArrayView2<f64>>,
) -> Result<Array2<f64>, UpdateError> {
    let (nrobs, ens_size) = s.dim();
    if ens_size < 2 || nrobs == 0 {
        return Ok(Array2::eye(ens_size));
    }
    check_shapes(s, r, e, d)?;

    let mut y = anomalies(&s);
    let mut d_work = d.to_owned();
    if config.aa_projection {
        if let Some(a) = a {
            if a.nrows() <= ens_size - 1 {
                aa_project(a, &mut y, &mut d_work);
            }
        }
    }

    let w0 = Array2::zeros((ens_size, ens_size));
    let w = advance_coefficients(
        &w0,
        &y,
        &d_work,
        r,
        &e.to_owned(),
        config.inversion,
        config.truncation,
        1.0,
    )?;
    Ok(transform_from_coefficients(&w))
}

/// One IES outer iteration. `a` holds the active ensemble (`n x N_a`) and is
/// rewritten in place from the stored prior; `s`, `r`, `e` and `d` are the
/// active-subspace inputs for this iteration.
///
/// The caller must have installed this iteration's masks with
/// [`SmootherState::begin_update`]. Fewer than two active realizations, or
/// zero active observations, is a silent no-op.
pub fn update_ensemble(
    state: &mut SmootherState,
    a: &mut Array2<f64>,
    s: ArrayView2<f64>,
    r: ArrayView2<f64>,
    e: ArrayView2<f64>,
    d: ArrayView2<f64>,
) -> Result<UpdateOutcome, UpdateError> {
    let (nrobs, ens_size) = s.dim();
    if ens_size < 2 || nrobs == 0 {
        log::debug!(
            "skipping update: {ens_size} active realizations, {nrobs} active observations"
        );
        return Ok(UpdateOutcome {
            applied: false,
            iteration: state.iteration(),
            step_length: 0.0,
            converged: state.converged(),
        });
    }
    check_shapes(s, r, e, d)?;
    if a.ncols() != ens_size {
        return Err(UpdateError::ShapeMismatch {
            context: "ensemble",
            got: a.dim(),
            expected: (a.nrows(), ens_size),
        });
    }

    state.check_state_size(a.nrows());

    let iteration = state.iteration() + 1;
    let config = *state.config();
    let gamma = config.step_length.at(iteration);

    if state.initial_perturbations().is_none() {
        state.store_initial_e(e);
    } else {
        state.augment_initial_e(e);
    }
    state.store_initial_prior(a.view());
    state.allocate_coefficients();

    // Re-anchor the innovations on the stored perturbations so every
    // iteration sees the same noise realizations.
    let e_stored = state.active_e();
    let mut d_work = d.to_owned();
    d_work -= &e;
    d_work += &e_stored;

    let mut y = anomalies(&s);
    if config.aa_projection && a.nrows() <= ens_size - 1 {
        aa_project(a.view(), &mut y, &mut d_work);
    }

    let w0 = state.active_coefficients();
    let w = advance_coefficients(
        &w0,
        &y,
        &d_work,
        r,
        &e_stored,
        config.inversion,
        config.truncation,
        gamma,
    )?;

    let change = frobenius_norm(&(&w - &w0)) / frobenius_norm(&w).max(1.0);
    let converged = change < config.convergence_tolerance;
    state.set_converged(converged);

    let x = transform_from_coefficients(&w);
    state.store_active_coefficients(&w);
    a.assign(&state.active_prior().dot(&x));
    state.advance_iteration();

    log::info!(
        "ies iteration {iteration}: step length {gamma:.3}, coefficient change {change:.3e}{}",
        if converged { ", converged" } else { "" }
    );

    Ok(UpdateOutcome {
        applied: true,
        iteration,
        step_length: gamma,
        converged,
    })
}
