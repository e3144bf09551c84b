//! Smoother configuration: inversion scheme, truncation, step length.

/// How the pseudo-inverse of the innovation covariance is formed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inversion {
    /// Truncated eigendecomposition of the full innovation covariance,
    /// honouring an arbitrary observation-error covariance `R`.
    Exact,
    /// Subspace pseudo-inversion combining the left singular vectors of the
    /// propagated anomalies with `R`.
    SubspaceExactR,
    /// Subspace pseudo-inversion with `R` approximated by `E E' / (N - 1)`,
    /// avoiding the explicit covariance.
    SubspaceEeR,
}

/// Truncation of the decomposition spectrum: either the fraction of
/// cumulative singular-value energy to retain, or a fixed rank.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Truncation {
    Energy(f64),
    Rank(usize),
}

impl Truncation {
    /// Number of singular values to keep out of `sigma` (descending order).
    pub fn significant(&self, sigma: &[f64]) -> usize {
        match *self {
            Truncation::Rank(k) => k.clamp(1, sigma.len().max(1)).min(sigma.len()),
            Truncation::Energy(fraction) => {
                let total: f64 = sigma.iter().map(|s| s * s).sum();
                if total <= 0.0 {
                    return 0;
                }
                let mut running = 0.0;
                let mut kept = 0;
                for s in sigma {
                    if running / total >= fraction {
                        break;
                    }
                    running += s * s;
                    kept += 1;
                }
                kept
            }
        }
    }
}

/// Gauss-Newton step length, ramped linearly from `min` at the first outer
/// iteration to `max` at iteration `ramp_iterations` and clamped thereafter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepLength {
    pub min: f64,
    pub max: f64,
    pub ramp_iterations: usize,
}

impl StepLength {
    pub fn fixed(gamma: f64) -> Self {
        Self {
            min: gamma,
            max: gamma,
            ramp_iterations: 1,
        }
    }

    /// Step length for 1-based outer iteration `iteration`.
    pub fn at(&self, iteration: usize) -> f64 {
        if self.ramp_iterations <= 1 || self.min == self.max {
            return self.max;
        }
        let span = (self.ramp_iterations - 1) as f64;
        let progress = ((iteration.max(1) - 1) as f64 / span).min(1.0);
        self.min + (self.max - self.min) * progress
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SmootherConfig {
    pub inversion: Inversion,
    pub truncation: Truncation,
    pub step_length: StepLength,
    /// Project innovations onto the ensemble-anomaly row space to prevent
    /// rank collapse when parameters outnumber independent observations.
    pub aa_projection: bool,
    /// Relative Frobenius change of the coefficient matrix below which the
    /// Gauss-Newton iteration is flagged converged.
    pub convergence_tolerance: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            inversion: Inversion::SubspaceExactR,
            truncation: Truncation::Energy(0.98),
            step_length: StepLength {
                min: 0.3,
                max: 0.6,
                ramp_iterations: 6,
            },
            aa_projection: false,
            convergence_tolerance: 1e-6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_truncation_keeps_leading_spectrum() {
        let sigma = [4.0, 2.0, 1.0, 0.01];
        // total energy 21.0001; leading value alone holds ~76%.
        assert_eq!(Truncation::Energy(0.5).significant(&sigma), 1);
        assert_eq!(Truncation::Energy(0.95).significant(&sigma), 2);
        assert_eq!(Truncation::Energy(1.0).significant(&sigma), 4);
    }

    #[test]
    fn rank_truncation_is_clamped() {
        let sigma = [3.0, 1.0];
        assert_eq!(Truncation::Rank(1).significant(&sigma), 1);
        assert_eq!(Truncation::Rank(10).significant(&sigma), 2);
    }

    #[test]
    fn step_length_ramps_linearly() {
        let sl = StepLength {
            min: 0.2,
            max: 1.0,
            ramp_iterations: 5,
        };
        assert!((sl.at(1) - 0.2).abs() < 1e-12);
        assert!((sl.at(3) - 0.6).abs() < 1e-12);
        assert!((sl.at(5) - 1.0).abs() < 1e-12);
        assert!((sl.at(50) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fixed_step_length_ignores_iteration() {
        let sl = StepLength::fixed(0.6);
        assert_eq!(sl.at(1), 0.6);
        assert_eq!(sl.at(9), 0.6);
    }
}
