//! One queue node: the job description, its state-machine position and the
//! completion callbacks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::jobs::driver::{Driver, DriverError, DriverJob};
use crate::jobs::status::{JobStatus, StatusTable};

/// Completion callbacks return `true` to approve the transition they guard:
/// `done` promotes a finished job to `Success`, `retry` grants a fresh round
/// of submit attempts, `exit`'s return value is ignored.
pub type JobCallback = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub done: Option<JobCallback>,
    pub retry: Option<JobCallback>,
    pub exit: Option<JobCallback>,
}

/// Everything needed to add one job to the queue.
pub struct JobSpec {
    pub name: String,
    pub run_path: PathBuf,
    pub run_cmd: String,
    pub argv: Vec<String>,
    pub num_cpu: usize,
    pub callbacks: Callbacks,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        run_path: impl Into<PathBuf>,
        run_cmd: impl Into<String>,
        argv: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            run_path: run_path.into(),
            run_cmd: run_cmd.into(),
            argv,
            num_cpu: 1,
            callbacks: Callbacks::default(),
        }
    }
}

pub enum SubmitOutcome {
    Ok,
    DriverFail,
}

pub struct JobNode {
    name: String,
    run_path: PathBuf,
    run_cmd: String,
    argv: Vec<String>,
    num_cpu: usize,
    callbacks: Callbacks,

    status: JobStatus,
    submit_attempt: u32,
    sim_start: Option<SystemTime>,
    sim_end: Option<SystemTime>,
    driver_job: Option<DriverJob>,

    ok_file: Option<PathBuf>,
    exit_file: Option<PathBuf>,
    status_file: Option<PathBuf>,
}

impl JobNode {
    pub(crate) fn new(
        spec: JobSpec,
        ok_file: Option<&str>,
        status_file: Option<&str>,
        exit_file: Option<&str>,
    ) -> Self {
        let join = |name: Option<&str>| name.map(|n| spec.run_path.join(n));
        Self {
            ok_file: join(ok_file),
            exit_file: join(exit_file),
            status_file: join(status_file),
            name: spec.name,
            run_path: spec.run_path,
            run_cmd: spec.run_cmd,
            argv: spec.argv,
            num_cpu: spec.num_cpu,
            callbacks: spec.callbacks,
            status: JobStatus::NotActive,
            submit_attempt: 0,
            sim_start: None,
            sim_end: None,
            driver_job: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_path(&self) -> &Path {
        &self.run_path
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn submit_attempt(&self) -> u32 {
        self.submit_attempt
    }

    pub fn sim_start(&self) -> Option<SystemTime> {
        self.sim_start
    }

    pub fn sim_end(&self) -> Option<SystemTime> {
        self.sim_end
    }

    pub fn ok_file(&self) -> Option<&Path> {
        self.ok_file.as_deref()
    }

    pub fn exit_file(&self) -> Option<&Path> {
        self.exit_file.as_deref()
    }

    pub fn status_file(&self) -> Option<&Path> {
        self.status_file.as_deref()
    }

    /// The run-directory contract: an optional `STATUS` file flags that the
    /// forward model actually started.
    pub fn has_started(&self) -> bool {
        self.status_file.as_deref().is_some_and(Path::exists)
    }

    /// Validated state-machine move, atomic with the status table. Returns
    /// false (and changes nothing) for an illegal transition.
    pub(crate) fn change_status(&mut self, table: &StatusTable, new_status: JobStatus) -> bool {
        if self.status == new_status {
            return false;
        }
        if !self.status.can_transition(new_status) {
            log::debug!(
                "job {}: ignoring illegal transition {:?} -> {:?}",
                self.name,
                self.status,
                new_status
            );
            return false;
        }
        table.transition(self.status, new_status);
        if new_status == JobStatus::Running {
            self.sim_start = Some(SystemTime::now());
        }
        if matches!(new_status, JobStatus::Done | JobStatus::Exit)
            && self.status == JobStatus::Running
        {
            self.sim_end = Some(SystemTime::now());
        }
        self.status = new_status;
        true
    }

    /// Hand the job to the driver. On success the node is `Submitted` and
    /// the attempt counter has grown; on driver failure it stays `Waiting`.
    pub(crate) fn submit(
        &mut self,
        table: &StatusTable,
        driver: &Driver,
    ) -> Result<SubmitOutcome, DriverError> {
        debug_assert_eq!(self.status, JobStatus::Waiting);
        match driver.submit(
            &self.run_cmd,
            &self.run_path,
            &self.name,
            &self.argv,
            self.num_cpu,
        ) {
            Ok(job) => {
                self.driver_job = Some(job);
                self.submit_attempt += 1;
                self.change_status(table, JobStatus::Submitted);
                log::debug!(
                    "job {}: submitted (attempt {})",
                    self.name,
                    self.submit_attempt
                );
                Ok(SubmitOutcome::Ok)
            }
            Err(err) => {
                log::warn!("job {}: driver refused submit: {err}", self.name);
                Ok(SubmitOutcome::DriverFail)
            }
        }
    }

    /// Poll the driver for driver-owned states; true if the status moved.
    pub(crate) fn update_status(&mut self, table: &StatusTable, driver: &Driver) -> bool {
        if !self.status.driver_polled() {
            return false;
        }
        let Some(job) = &self.driver_job else {
            return false;
        };
        let reported = driver.status(job);
        if reported == self.status {
            false
        } else {
            self.change_status(table, reported)
        }
    }

    /// External kill. Jobs that never reached the driver (`Waiting`) go
    /// straight to `IsKilled` without a driver call; the move is idempotent
    /// — killing an already killed job changes nothing and reports false.
    pub(crate) fn kill(&mut self, table: &StatusTable, driver: &Driver) -> bool {
        if !self.status.can_kill() {
            return false;
        }
        if let Some(job) = self.driver_job.take() {
            driver.kill(&job);
        }
        self.change_status(table, JobStatus::IsKilled)
    }

    pub(crate) fn driver_job_ref(&self) -> Option<&DriverJob> {
        self.driver_job.as_ref()
    }

    pub(crate) fn release_driver_job(&mut self) {
        self.driver_job = None;
    }

    pub(crate) fn reset_submit_attempt(&mut self) {
        self.submit_attempt = 0;
    }

    pub(crate) fn decrement_submit_attempt(&mut self) {
        self.submit_attempt = self.submit_attempt.saturating_sub(1);
    }

    // Callbacks are cloned out and invoked without holding the node lock so
    // a slow callback cannot stall status readers.
    pub(crate) fn done_callback(&self) -> Option<JobCallback> {
        self.callbacks.done.clone()
    }

    pub(crate) fn retry_callback(&self) -> Option<JobCallback> {
        self.callbacks.retry.clone()
    }

    pub(crate) fn exit_callback(&self) -> Option<JobCallback> {
        self.callbacks.exit.clone()
    }
}
