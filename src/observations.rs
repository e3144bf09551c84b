//! Observation and measurement containers plus the outlier screening that
//! runs before every update.
//!
//! Observations and their simulated counterparts travel as paired block
//! structures: `ObsData` holds the measured values and error bars, `MeasData`
//! the per-realization simulated responses. Deactivation always flips the
//! matching flag on *both* sides — the pair moving in lockstep is the
//! invariant everything downstream (mask export, summary report) relies on.

use ndarray::Array2;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("observation block '{key}' has {values} values but {stds} error bars")]
    RaggedBlock {
        key: String,
        values: usize,
        stds: usize,
    },
    #[error("measurement block '{key}' has {got} observation rows, expected {expected}")]
    BlockMismatch {
        key: String,
        got: usize,
        expected: usize,
    },
}

/// Why an observation slot was switched off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeactivationReason {
    /// The ensemble carries (almost) no variation for this slot.
    NoEnsembleVariation,
    /// The innovation is too many combined standard deviations wide.
    NoOverlap,
}

impl DeactivationReason {
    fn as_str(self) -> &'static str {
        match self {
            DeactivationReason::NoEnsembleVariation => "No ensemble variation",
            DeactivationReason::NoOverlap => "No overlap",
        }
    }
}

/// Activity of one observation slot as seen by the report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveMode {
    Active,
    Deactivated,
    Missing,
}

/// One block of measured values sharing an observation key.
#[derive(Debug)]
pub struct ObsBlock {
    key: String,
    values: Vec<f64>,
    stds: Vec<f64>,
    modes: Vec<ActiveMode>,
    reasons: Vec<Option<DeactivationReason>>,
}

impl ObsBlock {
    pub fn new(key: impl Into<String>, values: Vec<f64>, stds: Vec<f64>) -> Result<Self, ObservationError> {
        let key = key.into();
        if values.len() != stds.len() {
            return Err(ObservationError::RaggedBlock {
                key,
                values: values.len(),
                stds: stds.len(),
            });
        }
        let n = values.len();
        Ok(Self {
            key,
            values,
            stds,
            modes: vec![ActiveMode::Active; n],
            reasons: vec![None; n],
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, iobs: usize) -> f64 {
        self.values[iobs]
    }

    pub fn std(&self, iobs: usize) -> f64 {
        self.stds[iobs]
    }

    pub fn mode(&self, iobs: usize) -> ActiveMode {
        self.modes[iobs]
    }

    pub fn reason(&self, iobs: usize) -> Option<DeactivationReason> {
        self.reasons[iobs]
    }

    pub fn mark_missing(&mut self, iobs: usize) {
        self.modes[iobs] = ActiveMode::Missing;
    }

    fn deactivate(&mut self, iobs: usize, reason: DeactivationReason) {
        self.modes[iobs] = ActiveMode::Deactivated;
        self.reasons[iobs] = Some(reason);
    }
}

/// Simulated responses for one observation key: `ens_size` rows, one column
/// per observation slot in the block.
pub struct MeasBlock {
    key: String,
    data: Array2<f64>,
    active: Vec<bool>,
}

impl MeasBlock {
    pub fn new(key: impl Into<String>, data: Array2<f64>) -> Self {
        let active = vec![true; data.ncols()];
        Self {
            key: key.into(),
            data,
            active,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn total_obs_size(&self) -> usize {
        self.data.ncols()
    }

    pub fn ens_size(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_active(&self, iobs: usize) -> bool {
        self.active[iobs]
    }

    fn deactivate(&mut self, iobs: usize) {
        self.active[iobs] = false;
    }

    pub fn value(&self, iens: usize, iobs: usize) -> f64 {
        self.data[(iens, iobs)]
    }

    pub fn ens_mean(&self, iobs: usize) -> f64 {
        self.data.column(iobs).mean().unwrap_or(f64::NAN)
    }

    pub fn ens_std(&self, iobs: usize) -> f64 {
        let col = self.data.column(iobs);
        let n = col.len() as f64;
        if n < 1.0 {
            return f64::NAN;
        }
        let mean = col.mean().unwrap_or(0.0);
        (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
    }
}

/// All observation blocks taking part in one update step.
#[derive(Default)]
pub struct ObsData {
    blocks: Vec<ObsBlock>,
}

impl ObsData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: ObsBlock) {
        self.blocks.push(block);
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, i: usize) -> &ObsBlock {
        &self.blocks[i]
    }

    pub fn total_size(&self) -> usize {
        self.blocks.iter().map(ObsBlock::len).sum()
    }

    /// Flattened activity mask over all blocks, in block order — the
    /// `obs_mask` handed to the smoother state.
    pub fn active_mask(&self) -> Vec<bool> {
        self.blocks
            .iter()
            .flat_map(|b| b.modes.iter().map(|&m| m == ActiveMode::Active))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_mask().iter().filter(|&&a| a).count()
    }
}

#[derive(Default)]
pub struct MeasData {
    blocks: Vec<MeasBlock>,
}

impl MeasData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: MeasBlock) {
        self.blocks.push(block);
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, i: usize) -> &MeasBlock {
        &self.blocks[i]
    }

    /// Stack the active columns of all blocks into the `S` matrix
    /// (active observations x ensemble size).
    pub fn active_matrix(&self) -> Array2<f64> {
        let ens_size = self.blocks.first().map_or(0, MeasBlock::ens_size);
        let rows: Vec<(usize, usize)> = self
            .blocks
            .iter()
            .enumerate()
            .flat_map(|(bi, b)| {
                (0..b.total_obs_size())
                    .filter(move |&i| b.is_active(i))
                    .map(move |i| (bi, i))
            })
            .collect();
        Array2::from_shape_fn((rows.len(), ens_size), |(row, iens)| {
            let (bi, iobs) = rows[row];
            self.blocks[bi].value(iens, iobs)
        })
    }
}

/// Switch off every active observation whose ensemble response is degenerate
/// (`ens_std <= std_cutoff`) or whose innovation exceeds
/// `alpha * (ens_std + obs_std)`. Both sides of each pair are updated; the
/// recorded reason survives on the observation block.
pub fn deactivate_outliers(
    obs: &mut ObsData,
    meas: &mut MeasData,
    std_cutoff: f64,
    alpha: f64,
    verbose: bool,
) -> Result<usize, ObservationError> {
    check_pairing(obs, meas)?;
    let mut deactivated = 0;
    for (ob, mb) in obs.blocks.iter_mut().zip(meas.blocks.iter_mut()) {
        for iobs in 0..mb.total_obs_size() {
            if !mb.is_active(iobs) {
                continue;
            }
            let ens_std = mb.ens_std(iobs);
            if ens_std <= std_cutoff {
                ob.deactivate(iobs, DeactivationReason::NoEnsembleVariation);
                mb.deactivate(iobs);
                deactivated += 1;
                if verbose {
                    log::info!(
                        "deactivated {}[{}]: no ensemble variation (std {:.3e})",
                        ob.key,
                        iobs,
                        ens_std
                    );
                }
                continue;
            }
            let innov = ob.value(iobs) - mb.ens_mean(iobs);
            if innov.abs() > alpha * (ens_std + ob.std(iobs)) {
                ob.deactivate(iobs, DeactivationReason::NoOverlap);
                mb.deactivate(iobs);
                deactivated += 1;
                if verbose {
                    log::info!(
                        "deactivated {}[{}]: no overlap (innovation {:.3})",
                        ob.key,
                        iobs,
                        innov
                    );
                }
            }
        }
    }
    Ok(deactivated)
}

/// Degenerate screening: only removes slots with exactly zero ensemble
/// variation (`alpha` effectively infinite, cutoff zero).
pub fn deactivate_std_zero(
    obs: &mut ObsData,
    meas: &mut MeasData,
    verbose: bool,
) -> Result<usize, ObservationError> {
    deactivate_outliers(obs, meas, 0.0, f64::INFINITY, verbose)
}

fn check_pairing(obs: &ObsData, meas: &MeasData) -> Result<(), ObservationError> {
    if obs.blocks.len() != meas.blocks.len() {
        return Err(ObservationError::BlockMismatch {
            key: String::from("<block count>"),
            got: meas.blocks.len(),
            expected: obs.blocks.len(),
        });
    }
    for (ob, mb) in obs.blocks.iter().zip(meas.blocks.iter()) {
        if ob.len() != mb.total_obs_size() {
            return Err(ObservationError::BlockMismatch {
                key: ob.key.clone(),
                got: mb.total_obs_size(),
                expected: ob.len(),
            });
        }
    }
    Ok(())
}

const RULE: &str = "===================================================================\
===========================================================";
const THIN_RULE: &str = "-------------------------------------------------------------------\
-----------------------------------------------------------";

/// Fixed-width observation summary: measured history against simulated
/// ensemble statistics, one line per observation slot.
pub fn write_obs_summary<W: Write>(
    obs: &ObsData,
    meas: &MeasData,
    step_name: &str,
    out: &mut W,
) -> io::Result<()> {
    writeln!(out, "{RULE}")?;
    writeln!(out, "Update step...: {step_name}")?;
    writeln!(out, "{THIN_RULE}")?;
    writeln!(
        out,
        "                                                         Observed history               |             Simulated data"
    )?;
    writeln!(out, "{THIN_RULE}")?;

    let mut obs_count = 1;
    for (ob, mb) in obs.blocks.iter().zip(meas.blocks.iter()) {
        for iobs in 0..ob.len() {
            let print_key = if iobs == 0 { ob.key() } else { "  ..." };
            write!(
                out,
                "  {:<3} : {:<32} {:15.3} +/-  {:15.3}",
                obs_count,
                print_key,
                ob.value(iobs),
                ob.std(iobs)
            )?;
            let mode = ob.mode(iobs);
            match mode {
                ActiveMode::Active => write!(out, " Active    |")?,
                ActiveMode::Deactivated => write!(out, " Inactive  |")?,
                ActiveMode::Missing => write!(out, " Missing   |")?,
            }
            let (sim_value, sim_std) = if mode == ActiveMode::Missing {
                (f64::NAN, f64::NAN)
            } else {
                (mb.ens_mean(iobs), mb.ens_std(iobs))
            };
            writeln!(out, "   {sim_value:15.3} +/- {sim_std:15.3}")?;
            obs_count += 1;
        }
    }
    writeln!(out, "{RULE}")?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn paired_fixture() -> (ObsData, MeasData) {
        // Four observation slots under one key; slot 3 has a degenerate
        // ensemble, slot 1 sits far outside the ensemble spread.
        let mut obs = ObsData::new();
        obs.push(
            ObsBlock::new(
                "WOPR",
                vec![1.0, 50.0, 2.0, 3.0],
                vec![0.5, 0.5, 0.5, 0.5],
            )
            .unwrap(),
        );
        let mut meas = MeasData::new();
        meas.push(MeasBlock::new(
            "WOPR",
            arr2(&[
                [1.1, 1.0, 2.1, 3.0],
                [0.9, 1.2, 1.9, 3.0],
                [1.0, 0.8, 2.0, 3.0],
            ]),
        ));
        (obs, meas)
    }

    #[test]
    fn outlier_filter_prunes_degenerate_and_nonoverlapping_slots() {
        let (mut obs, mut meas) = paired_fixture();
        let n = deactivate_outliers(&mut obs, &mut meas, 1e-6, 3.0, false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(obs.active_mask(), vec![true, false, true, false]);
        assert_eq!(
            obs.block(0).reason(1),
            Some(DeactivationReason::NoOverlap)
        );
        assert_eq!(
            obs.block(0).reason(3),
            Some(DeactivationReason::NoEnsembleVariation)
        );
        // Lockstep: the measurement side dropped the same slots.
        assert!(!meas.block(0).is_active(1));
        assert!(!meas.block(0).is_active(3));
        assert!(meas.block(0).is_active(0));
    }

    #[test]
    fn std_zero_only_prunes_zero_variation() {
        let (mut obs, mut meas) = paired_fixture();
        let n = deactivate_std_zero(&mut obs, &mut meas, false).unwrap();
        assert_eq!(n, 1);
        assert_eq!(obs.active_mask(), vec![true, true, true, false]);
    }

    #[test]
    fn filter_runs_are_idempotent() {
        let (mut obs, mut meas) = paired_fixture();
        deactivate_outliers(&mut obs, &mut meas, 1e-6, 3.0, false).unwrap();
        let again = deactivate_outliers(&mut obs, &mut meas, 1e-6, 3.0, false).unwrap();
        assert_eq!(again, 0);
        assert_eq!(obs.active_mask(), vec![true, false, true, false]);
    }

    #[test]
    fn active_matrix_stacks_only_active_columns() {
        let (mut obs, mut meas) = paired_fixture();
        deactivate_outliers(&mut obs, &mut meas, 1e-6, 3.0, false).unwrap();
        let s = meas.active_matrix();
        assert_eq!(s.dim(), (2, 3));
        // Rows are slots 0 and 2, transposed to observation-major layout.
        assert_eq!(s[(0, 0)], 1.1);
        assert_eq!(s[(1, 0)], 2.1);
        assert_eq!(s[(1, 2)], 2.0);
    }

    #[test]
    fn ragged_blocks_are_rejected() {
        let err = ObsBlock::new("K", vec![1.0], vec![]).unwrap_err();
        assert!(matches!(err, ObservationError::RaggedBlock { .. }));
    }

    #[test]
    fn summary_report_layout() {
        let (mut obs, mut meas) = paired_fixture();
        obs.blocks[0].mark_missing(2);
        deactivate_outliers(&mut obs, &mut meas, 1e-6, 3.0, false).unwrap();
        let mut buf = Vec::new();
        write_obs_summary(&obs, &meas, "ministep-0", &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Update step...: ministep-0"));
        assert!(text.contains("WOPR"));
        assert!(text.contains(" Active    |"));
        assert!(text.contains(" Inactive  |"));
        assert!(text.contains(" Missing   |"));
        assert!(text.contains("NaN"));
        // Fixed 15.3 column width for the measured value.
        assert!(text.contains("          1.000 +/-  "));
    }
}
