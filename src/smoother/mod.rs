//! Ensemble smoother core: update algebra, active-set state and the seeded
//! perturbation stream.

pub mod config;
pub mod linalg;
pub mod random;
pub mod state;
pub mod update;

pub use config::{Inversion, SmootherConfig, StepLength, Truncation};
pub use state::SmootherState;
pub use update::{make_x, update_ensemble, UpdateError, UpdateOutcome};

/// Sentinel stored in the initial-perturbation matrix for observation slots
/// that have never been active.
pub const E_SENTINEL: f64 = -999.9;
