//! Persistent smoother state: masks, coefficient matrix, prior snapshot and
//! the initial perturbation record.
//!
//! Everything here lives in the FULL layout (all `N` realizations, all `m`
//! observation slots). The update kernel extracts the active subspace at the
//! start of a call and this module re-embeds the result afterwards, so that
//! realizations and observations can drop out of (and re-enter) the run
//! without disturbing the stored quantities.

use ndarray::{Array2, ArrayView2};

use crate::smoother::config::SmootherConfig;
use crate::smoother::E_SENTINEL;

pub struct SmootherState {
    config: SmootherConfig,
    iteration: usize,
    state_size: Option<usize>,
    converged: bool,

    ens_mask: Vec<bool>,
    obs_mask: Vec<bool>,
    /// Frozen record of every observation slot that was ever active.
    obs_mask0: Option<Vec<bool>>,

    /// Coefficient matrix, `N x N`, zero until the first update.
    coeff: Option<Array2<f64>>,
    /// Prior ensemble snapshot, captured on the first update.
    prior: Option<Array2<f64>>,
    /// Initial observation perturbations, `m x N`, sentinel for slots that
    /// have never been active.
    initial_e: Option<Array2<f64>>,
}

impl SmootherState {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config,
            iteration: 0,
            state_size: None,
            converged: false,
            ens_mask: Vec::new(),
            obs_mask: Vec::new(),
            obs_mask0: None,
            coeff: None,
            prior: None,
            initial_e: None,
        }
    }

    pub fn config(&self) -> &SmootherConfig {
        &self.config
    }

    /// Outer-iteration counter; 0 means the next update is the first.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub(crate) fn set_converged(&mut self, converged: bool) {
        self.converged = converged;
    }

    pub(crate) fn advance_iteration(&mut self) -> usize {
        self.iteration += 1;
        self.iteration
    }

    /// Install the masks for the coming update. The state deep-copies both;
    /// the initial observation mask is frozen the first time this is called.
    pub fn begin_update(&mut self, ens_mask: &[bool], obs_mask: &[bool]) {
        self.ens_mask = ens_mask.to_vec();
        self.obs_mask = obs_mask.to_vec();
        if self.obs_mask0.is_none() {
            self.obs_mask0 = Some(obs_mask.to_vec());
        }
    }

    /// Latch the parameter-vector length on first use; a different length on
    /// a later call is a caller bug.
    pub(crate) fn check_state_size(&mut self, state_size: usize) {
        match self.state_size {
            None => self.state_size = Some(state_size),
            Some(expected) => assert_eq!(
                expected, state_size,
                "parameter vector length changed between updates ({expected} -> {state_size})"
            ),
        }
    }

    pub fn ens_mask(&self) -> &[bool] {
        &self.ens_mask
    }

    pub fn obs_mask(&self) -> &[bool] {
        &self.obs_mask
    }

    pub fn obs_mask0(&self) -> Option<&[bool]> {
        self.obs_mask0.as_deref()
    }

    pub fn active_ens_size(&self) -> usize {
        self.ens_mask.iter().filter(|&&a| a).count()
    }

    pub fn active_obs_size(&self) -> usize {
        self.obs_mask.iter().filter(|&&a| a).count()
    }

    pub fn coefficients(&self) -> Option<&Array2<f64>> {
        self.coeff.as_ref()
    }

    pub fn initial_perturbations(&self) -> Option<&Array2<f64>> {
        self.initial_e.as_ref()
    }

    pub fn prior_snapshot(&self) -> Option<&Array2<f64>> {
        self.prior.as_ref()
    }

    /// Store the prior ensemble on the first update, scattered to the full
    /// column layout through the ensemble mask.
    pub(crate) fn store_initial_prior(&mut self, a: ArrayView2<f64>) {
        if self.prior.is_some() {
            return;
        }
        let mut full = Array2::zeros((a.nrows(), self.ens_mask.len()));
        let mut active_idx = 0;
        for (iens, &active) in self.ens_mask.iter().enumerate() {
            if active {
                full.column_mut(iens).assign(&a.column(active_idx));
                active_idx += 1;
            }
        }
        self.prior = Some(full);
    }

    /// Prior columns for the currently active realizations.
    pub(crate) fn active_prior(&self) -> Array2<f64> {
        let prior = self.prior.as_ref().expect("prior snapshot not stored");
        gather_columns(prior.view(), &self.ens_mask)
    }

    pub(crate) fn allocate_coefficients(&mut self) {
        if self.coeff.is_none() {
            let n = self.ens_mask.len();
            self.coeff = Some(Array2::zeros((n, n)));
        }
    }

    /// Active block of the coefficient matrix. Realizations that were
    /// deactivated since the last store read back as zero rows/columns.
    pub(crate) fn active_coefficients(&self) -> Array2<f64> {
        let coeff = self.coeff.as_ref().expect("coefficient matrix not allocated");
        let active: Vec<usize> = mask_indices(&self.ens_mask);
        let n = active.len();
        Array2::from_shape_fn((n, n), |(i, j)| coeff[(active[i], active[j])])
    }

    /// Scatter the active coefficient block back; everything outside the
    /// active set is zeroed so re-included realizations start from rest.
    pub(crate) fn store_active_coefficients(&mut self, w: &Array2<f64>) {
        let coeff = self.coeff.as_mut().expect("coefficient matrix not allocated");
        coeff.fill(0.0);
        let active: Vec<usize> = mask_indices(&self.ens_mask);
        for (i, &gi) in active.iter().enumerate() {
            for (j, &gj) in active.iter().enumerate() {
                coeff[(gi, gj)] = w[(i, j)];
            }
        }
    }

    /// First-call path: copy the active perturbations into the full layout
    /// through `(obs_mask0, ens_mask)`; never-seen slots keep the sentinel.
    pub(crate) fn store_initial_e(&mut self, e0: ArrayView2<f64>) {
        if self.initial_e.is_some() {
            return;
        }
        let obs_size = self.obs_mask.len();
        let ens_size = self.ens_mask.len();
        let mask0 = self
            .obs_mask0
            .as_ref()
            .expect("begin_update must precede store_initial_e");
        let mut full = Array2::from_elem((obs_size, ens_size), E_SENTINEL);
        let mut m = 0;
        for iobs in 0..obs_size {
            if mask0[iobs] {
                let mut active_idx = 0;
                for iens in 0..ens_size {
                    if self.ens_mask[iens] {
                        full[(iobs, iens)] = e0[(m, active_idx)];
                        active_idx += 1;
                    }
                }
                m += 1;
            }
        }
        self.initial_e = Some(full);
    }

    /// Later-call path: fill rows for observations admitted for the first
    /// time this iteration and promote them into the frozen mask.
    pub(crate) fn augment_initial_e(&mut self, e0: ArrayView2<f64>) {
        let Some(full) = self.initial_e.as_mut() else {
            return;
        };
        let mask0 = self
            .obs_mask0
            .as_mut()
            .expect("begin_update must precede augment_initial_e");
        let obs_size = self.obs_mask.len();
        let ens_size = self.ens_mask.len();
        let mut m = 0;
        for iobs in 0..obs_size {
            if !mask0[iobs] && self.obs_mask[iobs] {
                let mut active_idx = 0;
                for iens in 0..ens_size {
                    if self.ens_mask[iens] {
                        full[(iobs, iens)] = e0[(m, active_idx)];
                        active_idx += 1;
                    }
                }
                mask0[iobs] = true;
            }
            if self.obs_mask[iobs] {
                m += 1;
            }
        }
    }

    /// Stored perturbations restricted to the currently active subspace.
    pub(crate) fn active_e(&self) -> Array2<f64> {
        let full = self
            .initial_e
            .as_ref()
            .expect("initial perturbations not stored");
        let rows = mask_indices(&self.obs_mask);
        let cols = mask_indices(&self.ens_mask);
        Array2::from_shape_fn((rows.len(), cols.len()), |(i, j)| {
            full[(rows[i], cols[j])]
        })
    }
}

fn mask_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &a)| a.then_some(i))
        .collect()
}

fn gather_columns(m: ArrayView2<f64>, mask: &[bool]) -> Array2<f64> {
    let cols = mask_indices(mask);
    Array2::from_shape_fn((m.nrows(), cols.len()), |(i, j)| m[(i, cols[j])])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn state_with_masks(ens: &[bool], obs: &[bool]) -> SmootherState {
        let mut state = SmootherState::new(SmootherConfig::default());
        state.begin_update(ens, obs);
        state
    }

    #[test]
    fn initial_e_scatters_through_masks() {
        let mut state = state_with_masks(&[true, false, true], &[true, false, true]);
        // Active subspace is 2 obs x 2 realizations.
        let e0 = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        state.store_initial_e(e0.view());
        let full = state.initial_perturbations().unwrap();
        assert_eq!(full[(0, 0)], 1.0);
        assert_eq!(full[(0, 2)], 2.0);
        assert_eq!(full[(2, 0)], 3.0);
        assert_eq!(full[(2, 2)], 4.0);
        assert_eq!(full[(1, 1)], E_SENTINEL);
        assert_eq!(full[(0, 1)], E_SENTINEL);
    }

    #[test]
    fn augment_fills_newly_active_rows_and_promotes_mask0() {
        let mut state = state_with_masks(&[true, true], &[true, false]);
        state.store_initial_e(arr2(&[[0.5, -0.5]]).view());

        // Second iteration: slot 1 becomes active for the first time.
        state.begin_update(&[true, true], &[true, true]);
        let e0 = arr2(&[[9.0, 9.0], [1.5, -1.5]]);
        state.augment_initial_e(e0.view());

        let full = state.initial_perturbations().unwrap();
        // Row 0 keeps the stored realization, row 1 is newly filled.
        assert_eq!(full[(0, 0)], 0.5);
        assert_eq!(full[(1, 0)], 1.5);
        assert_eq!(full[(1, 1)], -1.5);
        assert_eq!(state.obs_mask0().unwrap(), &[true, true]);

        // P2: every (mask0, ens) cell is real data.
        for (iobs, &obs_on) in state.obs_mask0().unwrap().iter().enumerate() {
            for (iens, &ens_on) in state.ens_mask().iter().enumerate() {
                if obs_on && ens_on {
                    assert_ne!(full[(iobs, iens)], E_SENTINEL);
                }
            }
        }
    }

    #[test]
    fn coefficient_rows_zeroed_for_reincluded_realizations() {
        let mut state = state_with_masks(&[true, true, true], &[true]);
        state.allocate_coefficients();
        let w = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        state.store_active_coefficients(&w);

        // Realization 1 drops out; store shrinks to the active 2x2 block.
        state.begin_update(&[true, false, true], &[true]);
        let w2 = state.active_coefficients();
        assert_eq!(w2, arr2(&[[1.0, 3.0], [7.0, 9.0]]));
        state.store_active_coefficients(&w2);

        // Realization 1 returns: its row and column must read back as zero.
        state.begin_update(&[true, true, true], &[true]);
        let w3 = state.active_coefficients();
        assert_eq!(w3.row(1).to_vec(), vec![0.0, 0.0, 0.0]);
        assert_eq!(w3.column(1).to_vec(), vec![0.0, 0.0, 0.0]);
        assert_eq!(w3[(0, 0)], 1.0);
        assert_eq!(w3[(2, 2)], 9.0);
    }

    #[test]
    fn prior_snapshot_is_immutable_after_first_store() {
        let mut state = state_with_masks(&[true, true], &[true]);
        state.store_initial_prior(arr2(&[[1.0, 2.0]]).view());
        state.store_initial_prior(arr2(&[[8.0, 9.0]]).view());
        assert_eq!(state.active_prior(), arr2(&[[1.0, 2.0]]));
    }

    #[test]
    #[should_panic(expected = "parameter vector length changed")]
    fn state_size_mismatch_is_fatal() {
        let mut state = state_with_masks(&[true, true], &[true]);
        state.check_state_size(10);
        state.check_state_size(11);
    }
}
