//! Seeded Gaussian stream for observation perturbations.
//!
//! Every stochastic quantity in the smoother is drawn from one
//! [`PerturbationStream`] so that a fixed seed reproduces runs bit for bit.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub struct PerturbationStream {
    rng: StdRng,
}

impl PerturbationStream {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One standard-normal draw.
    pub fn standard_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    /// An `rows x cols` matrix of independent standard-normal draws, filled
    /// column by column so the layout of the ensemble does not change the
    /// stream consumption order.
    pub fn standard_normal_matrix(&mut self, rows: usize, cols: usize) -> Array2<f64> {
        let mut out = Array2::zeros((rows, cols));
        for j in 0..cols {
            for i in 0..rows {
                out[(i, j)] = self.standard_normal();
            }
        }
        out
    }

    /// Observation-noise realizations: row `i` is scaled by `obs_std[i]`,
    /// each column is one sample of the full observation-error vector.
    pub fn observation_perturbations(&mut self, obs_std: &[f64], ens_size: usize) -> Array2<f64> {
        let mut e = self.standard_normal_matrix(obs_std.len(), ens_size);
        for (i, &std) in obs_std.iter().enumerate() {
            for j in 0..ens_size {
                e[(i, j)] *= std;
            }
        }
        e
    }
}
