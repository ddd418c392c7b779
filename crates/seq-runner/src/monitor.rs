//! Job status polling.
//!
//! The monitor is the only place the run blocks. Each interval goes through a
//! [`Waiter`], so the wait can be cut short by a [`CancelToken`] or by an
//! operator stop file dropped into the workspace.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, RunError};
use crate::scheduler::{JobHandle, JobStatus, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

pub trait Waiter {
    fn wait(&self, duration: Duration) -> WaitOutcome;
}

/// Shared cancellation flag; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block for up to `timeout`; returns true if cancelled meanwhile.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Production waiter: sleeps in short slices, checking the token and the
/// optional stop file between slices.
#[derive(Debug, Clone)]
pub struct CancellableSleep {
    token: CancelToken,
    stop_file: Option<PathBuf>,
    slice: Duration,
}

impl CancellableSleep {
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            stop_file: None,
            slice: Duration::from_secs(1),
        }
    }

    pub fn with_stop_file(mut self, path: PathBuf) -> Self {
        self.stop_file = Some(path);
        self
    }

    fn stop_requested(&self) -> bool {
        self.token.is_cancelled() || self.stop_file.as_ref().is_some_and(|p| p.exists())
    }
}

impl Waiter for CancellableSleep {
    fn wait(&self, duration: Duration) -> WaitOutcome {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop_requested() {
                return WaitOutcome::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Elapsed;
            }
            if self.token.wait_timeout(self.slice.min(deadline - now)) {
                return WaitOutcome::Cancelled;
            }
        }
    }
}

const PROGRESS_EVERY: Duration = Duration::from_secs(600);

pub struct JobMonitor<'a, S: Scheduler + ?Sized, W: Waiter + ?Sized> {
    scheduler: &'a S,
    waiter: &'a W,
    interval: Duration,
    max_query_failures: u32,
}

impl<'a, S: Scheduler + ?Sized, W: Waiter + ?Sized> JobMonitor<'a, S, W> {
    pub fn new(scheduler: &'a S, waiter: &'a W, interval: Duration, max_query_failures: u32) -> Self {
        Self {
            scheduler,
            waiter,
            interval,
            max_query_failures: max_query_failures.max(1),
        }
    }

    /// Poll until the job reaches a terminal state and return it. A failed
    /// query is retried on the next interval; `max_query_failures` failures in
    /// a row end the wait with [`RunError::Monitoring`].
    pub fn wait_for(&self, handle: &mut JobHandle) -> Result<JobStatus> {
        info!(job_id = %handle.id, interval_secs = self.interval.as_secs(), "waiting for job");
        let started = Instant::now();
        let mut failures = 0u32;
        let mut reported = 0u64;
        loop {
            match self.scheduler.status(&handle.id) {
                Ok(status) => {
                    failures = 0;
                    if status != handle.status {
                        info!(job_id = %handle.id, from = %handle.status, to = %status, "job status changed");
                    }
                    handle.status = status;
                    if status.is_terminal() {
                        info!(
                            job_id = %handle.id,
                            status = %status,
                            minutes = %format!("{:.1}", started.elapsed().as_secs_f64() / 60.0),
                            "job finished"
                        );
                        return Ok(status);
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        job_id = %handle.id,
                        failures,
                        max = self.max_query_failures,
                        error = %err,
                        "status query failed, retrying next interval"
                    );
                    if failures >= self.max_query_failures {
                        return Err(RunError::Monitoring {
                            job_id: handle.id.clone(),
                            failures,
                            last_error: err.to_string(),
                        });
                    }
                }
            }

            if self.waiter.wait(self.interval) == WaitOutcome::Cancelled {
                warn!(job_id = %handle.id, "stop requested, leaving job to the scheduler");
                return Err(RunError::Cancelled);
            }

            let periods = started.elapsed().as_secs() / PROGRESS_EVERY.as_secs();
            if periods > reported {
                reported = periods;
                info!(
                    job_id = %handle.id,
                    minutes = started.elapsed().as_secs() / 60,
                    status = %handle.status,
                    "job still running"
                );
            } else {
                debug!(job_id = %handle.id, status = %handle.status, "poll");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::scheduler::JobId;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::Path;

    struct Scripted {
        replies: RefCell<VecDeque<std::result::Result<JobStatus, ()>>>,
        queries: Cell<usize>,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<JobStatus, ()>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                queries: Cell::new(0),
            }
        }
    }

    impl Scheduler for Scripted {
        fn submit(&self, _workdir: &Path, _script: &str) -> Result<JobId, SchedulerError> {
            Ok(JobId("1".to_string()))
        }

        fn status(&self, _job: &JobId) -> Result<JobStatus, SchedulerError> {
            self.queries.set(self.queries.get() + 1);
            match self.replies.borrow_mut().pop_front() {
                Some(Ok(status)) => Ok(status),
                _ => Err(SchedulerError::Unparseable {
                    command: "squeue".to_string(),
                    output: "slurm_load_jobs error".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct Recording {
        waits: RefCell<Vec<Duration>>,
        cancel_after: Option<usize>,
    }

    impl Waiter for Recording {
        fn wait(&self, duration: Duration) -> WaitOutcome {
            self.waits.borrow_mut().push(duration);
            match self.cancel_after {
                Some(n) if self.waits.borrow().len() >= n => WaitOutcome::Cancelled,
                _ => WaitOutcome::Elapsed,
            }
        }
    }

    fn handle() -> JobHandle {
        JobHandle {
            id: JobId("1".to_string()),
            status: JobStatus::Queued,
        }
    }

    #[test]
    fn three_running_polls_then_completed_means_three_waits() {
        let sched = Scripted::new(vec![
            Ok(JobStatus::Running),
            Ok(JobStatus::Running),
            Ok(JobStatus::Running),
            Ok(JobStatus::Completed),
        ]);
        let waiter = Recording::default();
        let interval = Duration::from_secs(60);
        let mut h = handle();
        let status = JobMonitor::new(&sched, &waiter, interval, 5)
            .wait_for(&mut h)
            .expect("terminal");
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(*waiter.waits.borrow(), vec![interval; 3]);
        assert_eq!(sched.queries.get(), 4);
        assert_eq!(h.status, JobStatus::Completed);
    }

    #[test]
    fn failed_status_is_returned_to_caller() {
        let sched = Scripted::new(vec![Ok(JobStatus::Queued), Ok(JobStatus::Failed)]);
        let waiter = Recording::default();
        let status = JobMonitor::new(&sched, &waiter, Duration::from_secs(1), 5)
            .wait_for(&mut handle())
            .expect("terminal");
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn transient_query_failures_are_retried() {
        let sched = Scripted::new(vec![
            Err(()),
            Err(()),
            Ok(JobStatus::Running),
            Err(()),
            Ok(JobStatus::Completed),
        ]);
        let waiter = Recording::default();
        let status = JobMonitor::new(&sched, &waiter, Duration::from_secs(1), 3)
            .wait_for(&mut handle())
            .expect("retries succeed");
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(waiter.waits.borrow().len(), 4);
    }

    #[test]
    fn escalates_after_consecutive_query_failures() {
        let sched = Scripted::new(vec![]);
        let waiter = Recording::default();
        let err = JobMonitor::new(&sched, &waiter, Duration::from_secs(1), 3)
            .wait_for(&mut handle())
            .expect_err("escalates");
        match err {
            RunError::Monitoring { failures, .. } => assert_eq!(failures, 3),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(waiter.waits.borrow().len(), 2);
    }

    #[test]
    fn cancelled_wait_stops_monitoring() {
        let sched = Scripted::new(vec![Ok(JobStatus::Running); 10]);
        let waiter = Recording {
            cancel_after: Some(2),
            ..Recording::default()
        };
        let err = JobMonitor::new(&sched, &waiter, Duration::from_secs(1), 3)
            .wait_for(&mut handle())
            .expect_err("cancelled");
        assert!(matches!(err, RunError::Cancelled));
        assert_eq!(sched.queries.get(), 2);
    }

    #[test]
    fn cancellable_sleep_honors_token_and_stop_file() {
        let token = CancelToken::new();
        let sleep = CancellableSleep::new(token.clone());
        assert_eq!(sleep.wait(Duration::from_millis(20)), WaitOutcome::Elapsed);

        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let started = Instant::now();
        assert_eq!(sleep.wait(Duration::from_secs(30)), WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();

        let root = crate::fsutil::temp_root("stopfile");
        let stop = root.join("stop");
        std::fs::write(&stop, "now").unwrap();
        let sleep = CancellableSleep::new(CancelToken::new()).with_stop_file(stop);
        assert_eq!(sleep.wait(Duration::from_secs(30)), WaitOutcome::Cancelled);
        let _ = std::fs::remove_dir_all(root);
    }
}
