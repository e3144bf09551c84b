//! # draugen
//!
//! Ensemble-based data assimilation for reservoir-style inverse problems.
//!
//! The crate is organised around four loosely coupled pillars:
//!
//! - [`smoother`] — the update algebra: a single-step ensemble smoother with
//!   perturbed observations (ES) and an iterative ensemble smoother (IES)
//!   that accumulates a coefficient matrix across outer iterations, together
//!   with the active-set bookkeeping that re-embeds subspace results into the
//!   full ensemble layout.
//! - [`observations`] — paired observation/measurement containers and the
//!   outlier screening that prunes degenerate or non-overlapping observations
//!   before each update.
//! - [`jobs`] — the forward-model job queue: submission, retry, kill and
//!   completion-callback semantics over a closed set of drivers.
//! - [`storage`] — the per-case filesystem holding serialized ensemble nodes
//!   and the auxiliary maps that survive a run.
//!
//! The algebra runs in one process; parallelism is across forward models.

#![deny(unused_imports)]

pub mod jobs;
pub mod misfit;
pub mod observations;
pub mod smoother;
pub mod storage;
