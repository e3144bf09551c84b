//! Queue behaviour against real subprocesses: terminality, retry and kill
//! semantics, callback wiring and status-count consistency.

use draugen::jobs::{
    Callbacks, Driver, JobQueue, JobSpec, JobStatus, LocalDriver, QueueConfig,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_queue(max_submit: u32, max_running: Option<usize>) -> JobQueue {
    JobQueue::new(
        Driver::Local(LocalDriver::new()),
        QueueConfig {
            max_submit,
            max_running,
            max_ok_wait: Duration::from_secs(2),
            usleep: Duration::from_millis(10),
            ..QueueConfig::default()
        },
    )
}

fn shell_job(name: &str, dir: &Path, script: &str) -> JobSpec {
    JobSpec::new(
        name,
        dir,
        "/bin/sh",
        vec!["-c".to_owned(), script.to_owned()],
    )
}

fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    probe()
}

#[test]
fn all_jobs_reach_terminal_states() {
    let queue = test_queue(2, None);
    let dirs: Vec<TempDir> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
    for (i, dir) in dirs.iter().enumerate() {
        queue
            .add_job(shell_job(
                &format!("job-{i}"),
                dir.path(),
                "touch STATUS; touch OK",
            ))
            .unwrap();
    }
    queue.run_jobs(Some(4), false);

    for i in 0..4 {
        assert_eq!(queue.job_status(i).unwrap(), JobStatus::Success);
        assert!(queue.job_started(i).unwrap(), "job {i} never wrote STATUS");
        assert!(queue.sim_start(i).unwrap().is_some());
        assert!(queue.sim_end(i).unwrap().is_some());
    }
    let (snapshot, len) = queue.status_snapshot();
    assert_eq!(len, 4);
    assert_eq!(snapshot.total(), 4);
    assert_eq!(snapshot.num_complete(), 4);
}

#[test]
fn missing_ok_file_exhausts_attempts_and_fails() {
    let exit_called = Arc::new(AtomicBool::new(false));
    let queue = test_queue(2, None);
    let dir = tempfile::tempdir().unwrap();
    let mut spec = shell_job("always-exit", dir.path(), "touch EXIT; exit 1");
    let flag = Arc::clone(&exit_called);
    spec.callbacks = Callbacks {
        exit: Some(Arc::new(move || {
            flag.store(true, Ordering::Release);
            true
        })),
        ..Callbacks::default()
    };
    queue.add_job(spec).unwrap();
    queue.run_jobs(Some(1), false);

    assert_eq!(queue.job_status(0).unwrap(), JobStatus::Failed);
    assert!(exit_called.load(Ordering::Acquire), "exit callback never ran");
    // Both submit attempts were burned.
    assert_eq!(queue.submit_attempt(0).unwrap(), 2);
}

#[test]
fn retry_callback_grants_a_second_round() {
    // First run writes EXIT and fails; the retry callback asks for another
    // round; the second run finds the marker and succeeds.
    let retry_granted = Arc::new(AtomicUsize::new(0));
    let queue = test_queue(1, None);
    let dir = tempfile::tempdir().unwrap();
    let script = "if [ -f marker ]; then rm -f EXIT; touch OK; exit 0; \
                  else touch marker; touch EXIT; exit 1; fi";
    let mut spec = shell_job("flaky", dir.path(), script);
    let counter = Arc::clone(&retry_granted);
    spec.callbacks = Callbacks {
        retry: Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::AcqRel) == 0
        })),
        ..Callbacks::default()
    };
    queue.add_job(spec).unwrap();
    queue.run_jobs(Some(1), false);

    assert_eq!(queue.job_status(0).unwrap(), JobStatus::Success);
    assert_eq!(retry_granted.load(Ordering::Acquire), 1);
    // The retry reset the attempt counter; the successful round used one.
    assert_eq!(queue.submit_attempt(0).unwrap(), 1);
}

#[test]
fn done_callback_can_demote_to_failure() {
    let queue = test_queue(1, None);
    let dir = tempfile::tempdir().unwrap();
    let mut spec = shell_job("load-fails", dir.path(), "touch OK");
    spec.callbacks = Callbacks {
        done: Some(Arc::new(|| false)),
        ..Callbacks::default()
    };
    queue.add_job(spec).unwrap();
    queue.run_jobs(Some(1), false);
    assert_eq!(queue.job_status(0).unwrap(), JobStatus::Failed);
}

#[test]
fn kill_while_waiting_is_immediate_and_idempotent() {
    let queue = test_queue(1, Some(1));
    let running_dir = tempfile::tempdir().unwrap();
    let waiting_dir = tempfile::tempdir().unwrap();
    queue
        .add_job(shell_job("holder", running_dir.path(), "sleep 2; touch OK"))
        .unwrap();
    queue
        .add_job(shell_job("victim", waiting_dir.path(), "touch OK"))
        .unwrap();

    let manager = queue.run_jobs_threaded(Some(2), false);
    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_status(0).unwrap() == JobStatus::Running
    }));
    // The concurrency bound of one keeps the victim waiting.
    assert_eq!(queue.job_status(1).unwrap(), JobStatus::Waiting);

    assert!(queue.kill_job(1).unwrap());
    assert_eq!(queue.job_status(1).unwrap(), JobStatus::IsKilled);
    // A repeated kill changes nothing.
    assert!(!queue.kill_job(1).unwrap());
    assert_eq!(queue.job_status(1).unwrap(), JobStatus::IsKilled);

    manager.join().unwrap();
    assert_eq!(queue.job_status(0).unwrap(), JobStatus::Success);
}

#[test]
fn user_exit_kills_everything() {
    let queue = test_queue(1, None);
    let dirs: Vec<TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    for (i, dir) in dirs.iter().enumerate() {
        queue
            .add_job(shell_job(&format!("sleeper-{i}"), dir.path(), "sleep 30"))
            .unwrap();
    }
    let manager = queue.run_jobs_threaded(Some(3), false);
    assert!(wait_until(Duration::from_secs(5), || queue.is_running()));
    assert!(queue.start_user_exit());
    manager.join().unwrap();

    for i in 0..3 {
        let status = queue.job_status(i).unwrap();
        assert!(
            status.is_terminal(),
            "job {i} left in non-terminal state {status:?}"
        );
    }
    let (snapshot, len) = queue.status_snapshot();
    assert_eq!(snapshot.total(), len);
    assert_eq!(snapshot.num_complete(), 3);
}

#[test]
fn status_counts_always_sum_to_job_count() {
    let queue = test_queue(2, Some(2));
    let dirs: Vec<TempDir> = (0..6).map(|_| tempfile::tempdir().unwrap()).collect();
    for (i, dir) in dirs.iter().enumerate() {
        queue
            .add_job(shell_job(
                &format!("busy-{i}"),
                dir.path(),
                "sleep 0.05; touch OK",
            ))
            .unwrap();
    }
    let manager = queue.run_jobs_threaded(Some(6), false);
    let deadline = Instant::now() + Duration::from_secs(30);
    while !manager.is_finished() && Instant::now() < deadline {
        let (snapshot, len) = queue.status_snapshot();
        assert_eq!(
            snapshot.total(),
            len,
            "status counts drifted from the job-list size"
        );
        thread::sleep(Duration::from_millis(5));
    }
    manager.join().unwrap();
    let (snapshot, len) = queue.status_snapshot();
    assert_eq!(snapshot.total(), len);
    assert_eq!(snapshot.num_complete(), 6);
}

#[test]
fn jobs_can_arrive_while_the_queue_runs() {
    let queue = test_queue(2, None);
    let first = tempfile::tempdir().unwrap();
    queue
        .add_job(shell_job("early", first.path(), "touch OK"))
        .unwrap();
    let manager = queue.run_jobs_threaded(None, false);

    assert!(wait_until(Duration::from_secs(5), || queue.is_running()));
    let late = tempfile::tempdir().unwrap();
    queue
        .add_job(shell_job("late", late.path(), "touch OK"))
        .unwrap();
    queue.submit_complete();
    manager.join().unwrap();

    assert_eq!(queue.job_status(0).unwrap(), JobStatus::Success);
    assert_eq!(queue.job_status(1).unwrap(), JobStatus::Success);
}

#[test]
fn node_failure_requeues_without_burning_the_attempt() {
    let queue = test_queue(1, None);
    let dir = tempfile::tempdir().unwrap();
    queue
        .add_job(shell_job(
            "lost-host",
            dir.path(),
            "sleep 0.5; rm -f EXIT; touch OK",
        ))
        .unwrap();
    let manager = queue.run_jobs_threaded(Some(1), false);
    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_status(0).unwrap() == JobStatus::Running
    }));
    assert!(queue.kill_job_node_failure(0).unwrap());
    manager.join().unwrap();

    // The attempt was refunded, so the single-attempt budget still allowed
    // the resubmission that eventually succeeded.
    assert_eq!(queue.job_status(0).unwrap(), JobStatus::Success);
    assert_eq!(queue.submit_attempt(0).unwrap(), 1);
}

#[test]
#[should_panic(expected = "another thread is already running the queue manager")]
fn second_concurrent_manager_is_a_programmer_error() {
    let queue = test_queue(1, None);
    let dir = tempfile::tempdir().unwrap();
    queue
        .add_job(shell_job("slow", dir.path(), "sleep 1; touch OK"))
        .unwrap();
    let _manager = queue.run_jobs_threaded(Some(1), false);
    assert!(wait_until(Duration::from_secs(5), || queue.is_running()));
    queue.run_jobs(Some(1), false);
}
