//! Per-realization misfit accounting and ranking.
//!
//! A misfit is the squared standardized residual `((sim - obs) / std)^2`,
//! accumulated per observation key and report step. Rankings sum a selection
//! of keys and steps per realization; realizations without valid results
//! carry a sentinel so they sort last.

use ahash::AHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

use crate::observations::{MeasData, ObsData};

/// Total misfit assigned to realizations that produced no valid results.
pub const INVALID_MISFIT: f64 = 1e10;

/// Misfit per report step for one observation key of one realization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MisfitSeries {
    steps: Vec<f64>,
}

impl MisfitSeries {
    /// Add `value` at `report_step`, growing the series with zeros as needed.
    pub fn accumulate(&mut self, report_step: usize, value: f64) {
        if self.steps.len() <= report_step {
            self.steps.resize(report_step + 1, 0.0);
        }
        self.steps[report_step] += value;
    }

    /// Sum over the requested steps; steps beyond the series contribute zero.
    pub fn eval(&self, steps: &[usize]) -> f64 {
        steps
            .iter()
            .filter_map(|&s| self.steps.get(s))
            .sum()
    }
}

/// All misfit series of one realization, keyed by observation key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MisfitMember {
    series: AHashMap<String, MisfitSeries>,
}

impl MisfitMember {
    pub fn has_key(&self, key: &str) -> bool {
        self.series.contains_key(key)
    }

    pub fn series(&self, key: &str) -> Option<&MisfitSeries> {
        self.series.get(key)
    }

    pub fn accumulate(&mut self, key: &str, report_step: usize, value: f64) {
        self.series
            .entry(key.to_owned())
            .or_default()
            .accumulate(report_step, value);
    }
}

/// Misfits for the whole ensemble, the unit persisted per case.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MisfitEnsemble {
    members: Vec<Option<MisfitMember>>,
}

impl MisfitEnsemble {
    pub fn with_size(ens_size: usize) -> Self {
        Self {
            members: vec![None; ens_size],
        }
    }

    pub fn ens_size(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, iens: usize) -> Option<&MisfitMember> {
        self.members.get(iens).and_then(Option::as_ref)
    }

    pub fn member_mut(&mut self, iens: usize) -> &mut MisfitMember {
        self.members[iens].get_or_insert_with(MisfitMember::default)
    }

    pub fn mark_invalid(&mut self, iens: usize) {
        self.members[iens] = None;
    }

    /// Fold one report step of paired observation/measurement data into the
    /// ensemble, one squared standardized residual per active slot.
    pub fn accumulate_step(&mut self, obs: &ObsData, meas: &MeasData, report_step: usize) {
        for bi in 0..obs.num_blocks() {
            let ob = obs.block(bi);
            let mb = meas.block(bi);
            for iobs in 0..ob.len() {
                if !mb.is_active(iobs) {
                    continue;
                }
                let std = ob.std(iobs);
                if std <= 0.0 {
                    continue;
                }
                for iens in 0..mb.ens_size() {
                    let residual = (mb.value(iens, iobs) - ob.value(iobs)) / std;
                    self.member_mut(iens)
                        .accumulate(ob.key(), report_step, residual * residual);
                }
            }
        }
    }
}

/// A ranking of the ensemble under a selection of keys and steps.
pub struct MisfitRanking {
    totals: Vec<f64>,
    permutation: Vec<usize>,
}

impl MisfitRanking {
    /// Build the ranking: total misfit per realization over `sort_keys` and
    /// `steps`, and the stable ascending sort permutation.
    pub fn new(ensemble: &MisfitEnsemble, sort_keys: &[String], steps: &[usize]) -> Self {
        let totals: Vec<f64> = ensemble
            .members
            .par_iter()
            .map(|member| match member {
                Some(member) => sort_keys
                    .iter()
                    .filter_map(|key| member.series(key))
                    .map(|series| series.eval(steps))
                    .sum(),
                None => INVALID_MISFIT,
            })
            .collect();

        let mut permutation: Vec<usize> = (0..totals.len()).collect();
        permutation.sort_by(|&a, &b| totals[a].total_cmp(&totals[b]));

        Self {
            totals,
            permutation,
        }
    }

    pub fn total(&self, iens: usize) -> f64 {
        self.totals[iens]
    }

    /// Realization indices from best (smallest misfit) to worst.
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Human-readable ranking table.
    pub fn display<W: Write>(&self, num_obs: usize, out: &mut W) -> io::Result<()> {
        let ens_size = self.totals.len();
        let num_obs_total = (num_obs * ens_size).max(1) as f64;
        writeln!(out)?;
        writeln!(out, "  #    Realization    Normalized misfit    Total misfit")?;
        writeln!(out, "-------------------------------------------------------")?;
        let mut summed = 0.0;
        for (rank, &iens) in self.permutation.iter().enumerate() {
            let total = self.totals[iens];
            let normalized = (total / num_obs_total).sqrt();
            summed += total;
            writeln!(
                out,
                "{rank:3}    {iens:3}                   {normalized:10.3}      {total:10.3}"
            )?;
        }
        let normalized_sum = (summed / (num_obs_total * ens_size as f64)).sqrt();
        writeln!(
            out,
            "        All                  {normalized_sum:10.3}      {summed:10.3}"
        )?;
        writeln!(out, "-------------------------------------------------------")?;
        Ok(())
    }
}
