//! Execution drivers. Driver kinds are a closed variant with a uniform
//! submit/status/kill surface; the queue never sees past this enum.

use parking_lot::Mutex;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

use crate::jobs::status::JobStatus;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn run thread for job '{0}'")]
    SpawnThread(String),
}

/// Handle the driver hands back at submit time; owned by the job node until
/// the node reaches a handled state.
#[derive(Clone)]
pub enum DriverJob {
    Local(LocalJob),
}

/// All supported execution backends.
pub enum Driver {
    Local(LocalDriver),
}

impl Driver {
    pub fn submit(
        &self,
        run_cmd: &str,
        run_path: &Path,
        job_name: &str,
        argv: &[String],
        num_cpu: usize,
    ) -> Result<DriverJob, DriverError> {
        match self {
            Driver::Local(driver) => driver
                .submit(run_cmd, run_path, job_name, argv, num_cpu)
                .map(DriverJob::Local),
        }
    }

    /// Cached status as last reported by the backend.
    pub fn status(&self, job: &DriverJob) -> JobStatus {
        match (self, job) {
            (Driver::Local(driver), DriverJob::Local(job)) => driver.status(job),
        }
    }

    pub fn kill(&self, job: &DriverJob) {
        match (self, job) {
            (Driver::Local(driver), DriverJob::Local(job)) => driver.kill(job),
        }
    }

    /// Mark the execution slot behind `job` as unusable. Local processes
    /// have no slot to blacklist, so this only leaves a trace in the log.
    pub fn blacklist(&self, job: &DriverJob) {
        match (self, job) {
            (Driver::Local(_), DriverJob::Local(job)) => {
                log::warn!("blacklist requested for local job (pid {})", job.pid());
            }
        }
    }
}

struct LocalJobShared {
    status: Mutex<JobStatus>,
    pid: AtomicI32,
}

/// Driver-side record of one spawned process.
#[derive(Clone)]
pub struct LocalJob {
    shared: Arc<LocalJobShared>,
}

impl LocalJob {
    fn pid(&self) -> i32 {
        self.shared.pid.load(Ordering::Acquire)
    }
}

/// Runs forward models as subprocesses on this host. Each submit starts a
/// detached waiter thread: spawn the child in its run directory, record the
/// PID, block on exit and map status 0 to `Done`, anything else to `Exit`.
#[derive(Default)]
pub struct LocalDriver {
    submit_lock: Mutex<()>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn submit(
        &self,
        run_cmd: &str,
        run_path: &Path,
        job_name: &str,
        argv: &[String],
        _num_cpu: usize,
    ) -> Result<LocalJob, DriverError> {
        let shared = Arc::new(LocalJobShared {
            status: Mutex::new(JobStatus::Running),
            pid: AtomicI32::new(0),
        });

        let _guard = self.submit_lock.lock();
        let waiter_shared = Arc::clone(&shared);
        let cmd = run_cmd.to_owned();
        let path = run_path.to_owned();
        let args = argv.to_vec();
        let name = job_name.to_owned();
        thread::Builder::new()
            .name(format!("local-driver-{name}"))
            .spawn(move || {
                let spawned = Command::new(&cmd)
                    .args(&args)
                    .current_dir(&path)
                    .stdin(Stdio::null())
                    .spawn();
                match spawned {
                    Ok(mut child) => {
                        waiter_shared
                            .pid
                            .store(child.id() as i32, Ordering::Release);
                        let status = match child.wait() {
                            Ok(exit) if exit.success() => JobStatus::Done,
                            Ok(_) | Err(_) => JobStatus::Exit,
                        };
                        *waiter_shared.status.lock() = status;
                    }
                    Err(err) => {
                        log::error!("failed to spawn '{cmd}' for job {name}: {err}");
                        *waiter_shared.status.lock() = JobStatus::Exit;
                    }
                }
            })
            .map_err(|_| DriverError::SpawnThread(job_name.to_owned()))?;

        Ok(LocalJob { shared })
    }

    fn status(&self, job: &LocalJob) -> JobStatus {
        *job.shared.status.lock()
    }

    fn kill(&self, job: &LocalJob) {
        let pid = job.pid();
        if pid > 0 {
            // SIGTERM, not SIGKILL: give the forward model a chance to
            // clean up its run directory.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}
