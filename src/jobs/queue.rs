//! The job queue: one manager thread drives every node to a terminal state.
//!
//! Scheduling loop, per turn: honour a pending user exit, kill expired jobs,
//! poll the driver for status moves, check the completion predicate, submit
//! a bounded batch of waiting jobs and dispatch handlers for nodes that need
//! post-processing. Completion handlers (OK/EXIT-file checks plus user
//! callbacks) run on worker threads, at most one in flight, whose handles the
//! manager reaps opportunistically.

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

use crate::jobs::driver::Driver;
use crate::jobs::node::{JobNode, JobSpec, SubmitOutcome};
use crate::jobs::status::{JobStatus, StatusSnapshot, StatusTable};

/// Upper bound on submissions per loop turn, so a large waiting backlog
/// cannot starve status updates.
const MAX_SUBMIT_PER_TURN: usize = 5;
/// Granularity of the post-DONE OK/EXIT file polling.
const OK_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long `start_user_exit` waits for the manager to come up.
const USER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is not accepting jobs")]
    Closed,
    #[error("no job with index {0}")]
    UnknownJob(usize),
}

#[derive(Clone)]
pub struct QueueConfig {
    /// Submit attempts per job before the retry callback is consulted.
    pub max_submit: u32,
    /// Concurrent pending+running bound; `None` means unbounded.
    pub max_running: Option<usize>,
    /// File names the forward model writes into its run directory.
    pub ok_file: Option<String>,
    pub exit_file: Option<String>,
    pub status_file: Option<String>,
    /// How long to wait for delayed OK/EXIT file visibility after DONE.
    pub max_ok_wait: Duration,
    /// Base sleep of the manager loop; backs off to eight times this.
    pub usleep: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_submit: 2,
            max_running: None,
            ok_file: Some("OK".to_owned()),
            exit_file: Some("EXIT".to_owned()),
            status_file: Some("STATUS".to_owned()),
            max_ok_wait: Duration::from_secs(60),
            usleep: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Expiry {
    max_duration: Option<Duration>,
    stop_time: Option<SystemTime>,
}

struct Shared {
    jobs: RwLock<Vec<Arc<Mutex<JobNode>>>>,
    table: StatusTable,
    driver: Driver,
    config: QueueConfig,
    expiry: Mutex<Expiry>,

    open: AtomicBool,
    running: AtomicBool,
    user_exit: AtomicBool,
    pause: AtomicBool,
    submit_complete: AtomicBool,

    /// Exactly one thread may run the manager loop.
    run_lock: Mutex<()>,
}

pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(driver: Driver, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: RwLock::new(Vec::new()),
                table: StatusTable::new(),
                driver,
                config,
                expiry: Mutex::new(Expiry::default()),
                open: AtomicBool::new(true),
                running: AtomicBool::new(false),
                user_exit: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                submit_complete: AtomicBool::new(false),
                run_lock: Mutex::new(()),
            }),
        }
    }

    fn accepting(&self) -> bool {
        self.shared.open.load(Ordering::Acquire) && !self.shared.user_exit.load(Ordering::Acquire)
    }

    /// Queue a job; the returned index is the external handle. Safe while
    /// the manager is running — the node is picked up on its next turn.
    pub fn add_job(&self, spec: JobSpec) -> Result<usize, QueueError> {
        if !self.accepting() {
            return Err(QueueError::Closed);
        }
        let shared = &self.shared;
        let node = JobNode::new(
            spec,
            shared.config.ok_file.as_deref(),
            shared.config.status_file.as_deref(),
            shared.config.exit_file.as_deref(),
        );
        let mut jobs = shared.jobs.write();
        shared.table.register(JobStatus::NotActive);
        let node = Arc::new(Mutex::new(node));
        node.lock().change_status(&shared.table, JobStatus::Waiting);
        jobs.push(node);
        Ok(jobs.len() - 1)
    }

    /// Declare that no further jobs will arrive; with an unknown total this
    /// is what lets the manager loop finish.
    pub fn submit_complete(&self) {
        self.shared.submit_complete.store(true, Ordering::Release);
    }

    pub fn num_jobs(&self) -> usize {
        self.shared.jobs.read().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// One consistent snapshot of the status counts. The job list lock is
    /// held across the read so the sum always matches [`Self::num_jobs`].
    pub fn status_snapshot(&self) -> (StatusSnapshot, usize) {
        let jobs = self.shared.jobs.read();
        (self.shared.table.snapshot(), jobs.len())
    }

    fn with_node<T>(&self, index: usize, f: impl FnOnce(&mut JobNode) -> T) -> Result<T, QueueError> {
        let jobs = self.shared.jobs.read();
        let node = jobs.get(index).ok_or(QueueError::UnknownJob(index))?;
        let mut node = node.lock();
        Ok(f(&mut node))
    }

    pub fn job_status(&self, index: usize) -> Result<JobStatus, QueueError> {
        self.with_node(index, |n| n.status())
    }

    pub fn submit_attempt(&self, index: usize) -> Result<u32, QueueError> {
        self.with_node(index, |n| n.submit_attempt())
    }

    pub fn sim_start(&self, index: usize) -> Result<Option<SystemTime>, QueueError> {
        self.with_node(index, |n| n.sim_start())
    }

    pub fn sim_end(&self, index: usize) -> Result<Option<SystemTime>, QueueError> {
        self.with_node(index, |n| n.sim_end())
    }

    pub fn job_started(&self, index: usize) -> Result<bool, QueueError> {
        self.with_node(index, |n| n.has_started())
    }

    /// Kill one job. Repeated requests are idempotent: the first meaningful
    /// one decides the final status, later ones return false.
    pub fn kill_job(&self, index: usize) -> Result<bool, QueueError> {
        let shared = Arc::clone(&self.shared);
        self.with_node(index, move |n| n.kill(&shared.table, &shared.driver))
    }

    /// Flag a job whose execution host went unreachable. The manager
    /// blacklists the slot and fails the attempt without a driver kill; the
    /// attempt counter is handed back so the requeue is free.
    pub fn kill_job_node_failure(&self, index: usize) -> Result<bool, QueueError> {
        let shared = Arc::clone(&self.shared);
        self.with_node(index, move |n| {
            n.change_status(&shared.table, JobStatus::DoKillNodeFailure)
        })
    }

    pub fn set_max_duration(&self, max_duration: Option<Duration>) {
        self.shared.expiry.lock().max_duration = max_duration;
    }

    pub fn set_stop_time(&self, stop_time: Option<SystemTime>) {
        self.shared.expiry.lock().stop_time = stop_time;
    }

    /// Derive a stop time from the mean runtime of jobs that already
    /// succeeded: now plus a quarter of that mean.
    pub fn set_auto_stop_time(&self) {
        let jobs = self.shared.jobs.read();
        let mut total = Duration::ZERO;
        let mut succeeded = 0u32;
        for node in jobs.iter() {
            let node = node.lock();
            if node.status() == JobStatus::Success {
                if let (Some(start), Some(end)) = (node.sim_start(), node.sim_end()) {
                    if let Ok(elapsed) = end.duration_since(start) {
                        total += elapsed;
                        succeeded += 1;
                    }
                }
            }
        }
        if succeeded > 0 {
            let margin = total / (succeeded * 4);
            self.shared.expiry.lock().stop_time = Some(SystemTime::now() + margin);
        }
    }

    pub fn pause(&self, on: bool) {
        self.shared.pause.store(on, Ordering::Release);
    }

    /// Ask the manager to wind everything down. Blocks until the queue is
    /// actually running (bounded by a 10 s timeout); returns whether the
    /// exit flag was set.
    pub fn start_user_exit(&self) -> bool {
        let shared = &self.shared;
        if !shared.user_exit.load(Ordering::Acquire) {
            let deadline = Instant::now() + USER_EXIT_TIMEOUT;
            loop {
                if shared.running.load(Ordering::Acquire) {
                    shared.user_exit.store(true, Ordering::Release);
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
        shared.user_exit.load(Ordering::Acquire)
    }

    /// Run the manager loop on the calling thread until every job is
    /// terminal. `num_total_run` declares the expected number of completed
    /// jobs; with `None` the queue finishes once [`Self::submit_complete`]
    /// has been called and the list has drained.
    ///
    /// A second concurrent caller is a programmer error and panics.
    pub fn run_jobs(&self, num_total_run: Option<usize>, verbose: bool) {
        let shared = Arc::clone(&self.shared);
        let Some(_guard) = shared.run_lock.try_lock() else {
            panic!("another thread is already running the queue manager");
        };
        assert!(
            shared.open.load(Ordering::Acquire),
            "queue already consumed by a previous run_jobs call"
        );

        shared.running.store(true, Ordering::Release);
        let mut callbacks: Vec<JoinHandle<()>> = Vec::new();
        let mut exited = shared.user_exit.load(Ordering::Acquire);
        if exited {
            log::info!("queue received user exit before the manager started");
        }

        // indicatif suppresses drawing on its own when stderr is not a
        // terminal, so verbose mode needs no tty handling here.
        let progress = verbose.then(|| {
            let pb = ProgressBar::new(self.num_jobs() as u64);
            if let Ok(style) = ProgressStyle::with_template("{prefix}: {wide_bar} {pos}/{len} {msg}")
            {
                pb.set_style(style);
            }
            pb.set_prefix("forward models");
            pb
        });
        let mut sleep = shared.config.usleep;

        while !exited {
            let mut changed;
            let complete;
            {
                let jobs = shared.jobs.read();

                if shared.user_exit.load(Ordering::Acquire) {
                    log::info!("user exit requested; scheduling kill for every killable job");
                    for node in jobs.iter() {
                        let mut node = node.lock();
                        if node.status().can_kill() {
                            node.change_status(&shared.table, JobStatus::DoKill);
                        }
                    }
                    exited = true;
                }

                check_expired(&shared, &jobs);
                changed = update_status(&shared, &jobs);

                let snapshot = shared.table.snapshot();
                complete = match num_total_run {
                    Some(total) => snapshot.num_complete() >= total,
                    None => {
                        shared.submit_complete.load(Ordering::Acquire)
                            && snapshot.num_complete() == jobs.len()
                    }
                };

                if !complete {
                    changed |= submit_new_jobs(&shared, &jobs);
                    run_handlers(&shared, &jobs, &mut callbacks);
                }

                if let Some(pb) = &progress {
                    update_progress(pb, &snapshot, jobs.len());
                }
            }

            if complete {
                break;
            }
            if !exited {
                thread::yield_now();
                thread::sleep(sleep);
                sleep = if changed {
                    shared.config.usleep
                } else {
                    (sleep * 2).min(shared.config.usleep * 8)
                };
            }
        }

        for handle in callbacks.drain(..) {
            let _ = handle.join();
        }
        finalize(&shared);

        if let Some(pb) = &progress {
            let (snapshot, len) = self.status_snapshot();
            update_progress(pb, &snapshot, len);
            pb.finish();
        }

        shared.running.store(false, Ordering::Release);
        shared.open.store(false, Ordering::Release);
    }

    /// Detached-manager variant: the loop runs on its own thread and the
    /// caller keeps adding jobs from this one.
    pub fn run_jobs_threaded(&self, num_total_run: Option<usize>, verbose: bool) -> JoinHandle<()> {
        let queue = JobQueue {
            shared: Arc::clone(&self.shared),
        };
        thread::Builder::new()
            .name("job-queue-manager".to_owned())
            .spawn(move || queue.run_jobs(num_total_run, verbose))
            .expect("spawn queue manager thread")
    }
}

fn check_expired(shared: &Arc<Shared>, jobs: &[Arc<Mutex<JobNode>>]) {
    let expiry = *shared.expiry.lock();
    if expiry.max_duration.is_none() && expiry.stop_time.is_none() {
        return;
    }
    let now = SystemTime::now();
    for node in jobs {
        let mut node = node.lock();
        if node.status() != JobStatus::Running {
            continue;
        }
        if let (Some(max), Some(start)) = (expiry.max_duration, node.sim_start()) {
            if now.duration_since(start).unwrap_or(Duration::ZERO) > max {
                log::info!("job {}: time limit exceeded, scheduled for kill", node.name());
                node.change_status(&shared.table, JobStatus::DoKill);
                continue;
            }
        }
        if let Some(stop) = expiry.stop_time {
            if now >= stop {
                node.change_status(&shared.table, JobStatus::DoKill);
            }
        }
    }
}

fn update_status(shared: &Arc<Shared>, jobs: &[Arc<Mutex<JobNode>>]) -> bool {
    let mut changed = false;
    for node in jobs {
        changed |= node.lock().update_status(&shared.table, &shared.driver);
    }
    changed
}

fn submit_new_jobs(shared: &Arc<Shared>, jobs: &[Arc<Mutex<JobNode>>]) -> bool {
    if shared.user_exit.load(Ordering::Acquire) || shared.pause.load(Ordering::Acquire) {
        return false;
    }
    let snapshot = shared.table.snapshot();
    if snapshot.count(JobStatus::Waiting) == 0 {
        return false;
    }
    let slots = match shared.config.max_running {
        Some(max) => max.saturating_sub(snapshot.num_active()),
        None => snapshot.count(JobStatus::Waiting),
    };
    let mut budget = slots.min(MAX_SUBMIT_PER_TURN);
    let mut submitted = false;
    for node in jobs {
        if budget == 0 {
            break;
        }
        let mut node = node.lock();
        if node.status() != JobStatus::Waiting {
            continue;
        }
        match node.submit(&shared.table, &shared.driver) {
            Ok(SubmitOutcome::Ok) => {
                budget -= 1;
                submitted = true;
            }
            Ok(SubmitOutcome::DriverFail) | Err(_) => break,
        }
    }
    submitted
}

/// Reap finished callback workers; at most one may be in flight, bounding
/// the memory a callback-heavy run can pin.
fn can_run_handler(callbacks: &mut Vec<JoinHandle<()>>) -> bool {
    callbacks.retain(|handle| !handle.is_finished());
    callbacks.is_empty()
}

fn run_handlers(
    shared: &Arc<Shared>,
    jobs: &[Arc<Mutex<JobNode>>],
    callbacks: &mut Vec<JoinHandle<()>>,
) {
    for node in jobs {
        let status = node.lock().status();
        match status {
            JobStatus::Done => {
                if !can_run_handler(callbacks) {
                    continue;
                }
                let shared = Arc::clone(shared);
                let node = Arc::clone(node);
                callbacks.push(spawn_handler("job-done-handler", move || {
                    handle_done(&shared, &node);
                }));
            }
            JobStatus::Exit => {
                if !can_run_handler(callbacks) {
                    continue;
                }
                let shared = Arc::clone(shared);
                let node = Arc::clone(node);
                callbacks.push(spawn_handler("job-exit-handler", move || {
                    handle_exit(&shared, &node);
                }));
            }
            JobStatus::DoKillNodeFailure => {
                // No contact with the execution host: flag the slot and fail
                // the attempt without a driver kill.
                let mut node = node.lock();
                if let Some(job) = node.driver_job_ref() {
                    shared.driver.blacklist(job);
                }
                node.change_status(&shared.table, JobStatus::Exit);
                node.decrement_submit_attempt();
            }
            JobStatus::DoKill => {
                node.lock().kill(&shared.table, &shared.driver);
            }
            _ => {}
        }
    }
}

fn spawn_handler(name: &str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)
        .expect("spawn job handler thread")
}

/// DONE post-processing: wait out file-system visibility for the OK/EXIT
/// files, then let the done callback confirm the result.
fn handle_done(shared: &Arc<Shared>, node: &Arc<Mutex<JobNode>>) {
    let (ok_file, exit_file, callback) = {
        let node = node.lock();
        if node.status() != JobStatus::Done {
            log::debug!("job {}: done handler raced a status change", node.name());
            return;
        }
        (
            node.ok_file().map(Path::to_owned),
            node.exit_file().map(Path::to_owned),
            node.done_callback(),
        )
    };

    let mut ok = poll_status_files(
        ok_file.as_deref(),
        exit_file.as_deref(),
        shared.config.max_ok_wait,
    );
    if ok {
        if let Some(callback) = callback {
            ok = callback();
        }
    }

    let mut node = node.lock();
    if node.status() != JobStatus::Done {
        return;
    }
    let target = if ok { JobStatus::Success } else { JobStatus::Exit };
    node.change_status(&shared.table, target);
    if ok {
        node.release_driver_job();
    }
}

/// EXIT post-processing: requeue while submit attempts remain, otherwise let
/// the retry callback grant a fresh round or fail the node for good.
fn handle_exit(shared: &Arc<Shared>, node: &Arc<Mutex<JobNode>>) {
    enum Decision {
        Requeue,
        Exhausted,
    }
    let (decision, retry_cb, exit_cb, name) = {
        let node = node.lock();
        if node.status() != JobStatus::Exit {
            log::debug!("job {}: exit handler raced a status change", node.name());
            return;
        }
        let decision = if node.submit_attempt() < shared.config.max_submit {
            Decision::Requeue
        } else {
            Decision::Exhausted
        };
        (
            decision,
            node.retry_callback(),
            node.exit_callback(),
            node.name().to_owned(),
        )
    };

    match decision {
        Decision::Requeue => {
            let mut node = node.lock();
            node.release_driver_job();
            node.change_status(&shared.table, JobStatus::Waiting);
        }
        Decision::Exhausted => {
            let retry = retry_cb.map(|cb| cb()).unwrap_or(false);
            if retry {
                log::info!("job {name}: retry callback granted a fresh round of attempts");
                let mut node = node.lock();
                node.reset_submit_attempt();
                node.release_driver_job();
                node.change_status(&shared.table, JobStatus::Waiting);
            } else {
                if let Some(cb) = exit_cb {
                    cb();
                }
                log::warn!("job {name}: submit attempts exhausted, marking failed");
                let mut node = node.lock();
                node.release_driver_job();
                node.change_status(&shared.table, JobStatus::Failed);
            }
        }
    }
}

/// Post-DONE success test. An EXIT file is an immediate failure; an OK file
/// (or no configured OK file) is success; otherwise poll with one-second
/// granularity until `max_wait` runs out, tolerating slow NFS visibility.
fn poll_status_files(
    ok_file: Option<&Path>,
    exit_file: Option<&Path>,
    max_wait: Duration,
) -> bool {
    let deadline = Instant::now() + max_wait;
    loop {
        if exit_file.is_some_and(Path::exists) {
            return false;
        }
        match ok_file {
            None => return true,
            Some(ok) if ok.exists() => return true,
            Some(_) => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(OK_POLL_INTERVAL.min(deadline - now));
    }
}

/// Force every remaining node terminal. On the normal path this is a no-op;
/// after a user exit it resolves killed/abandoned nodes so the queue's
/// terminality guarantee holds unconditionally.
fn finalize(shared: &Arc<Shared>) {
    let jobs = shared.jobs.read();
    for node in jobs.iter() {
        let mut node = node.lock();
        loop {
            match node.status() {
                JobStatus::Success | JobStatus::Failed | JobStatus::IsKilled => break,
                JobStatus::NotActive => {
                    node.change_status(&shared.table, JobStatus::Waiting);
                }
                JobStatus::Waiting
                | JobStatus::Submitted
                | JobStatus::Pending
                | JobStatus::Running
                | JobStatus::DoKill => {
                    node.kill(&shared.table, &shared.driver);
                }
                JobStatus::DoKillNodeFailure => {
                    node.change_status(&shared.table, JobStatus::Exit);
                }
                JobStatus::Done => {
                    node.change_status(&shared.table, JobStatus::Exit);
                }
                JobStatus::Exit => {
                    node.release_driver_job();
                    node.change_status(&shared.table, JobStatus::Failed);
                }
            }
        }
    }
}

fn update_progress(pb: &ProgressBar, snapshot: &StatusSnapshot, total: usize) {
    pb.set_length(total as u64);
    pb.set_position(snapshot.num_complete() as u64);
    pb.set_message(format!(
        "waiting {}  pending {}  running {}  failed {}  complete {}",
        snapshot.count(JobStatus::Waiting),
        snapshot.count(JobStatus::Pending),
        snapshot.count(JobStatus::Running)
            + snapshot.count(JobStatus::Done)
            + snapshot.count(JobStatus::Exit),
        snapshot.count(JobStatus::Failed) + snapshot.count(JobStatus::IsKilled),
        snapshot.count(JobStatus::Success),
    ));
}
