//! In-memory handle to one executing job.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use taskmill_core::{Job, JobId, DEFAULT_JOB_TIMEOUT};

/// Ledger-persisted snapshot of one run. Round-trips every field losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub job_id: JobId,
    pub is_running: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub execution_error: Option<String>,
    pub was_recovered: bool,
}

struct RunState {
    job_id: JobId,
    timeout: Duration,
    was_recovered: bool,
    started: AtomicBool,
    finished: AtomicBool,
    is_running: AtomicBool,
    start_date: Mutex<Option<DateTime<Utc>>>,
    finish_date: Mutex<Option<DateTime<Utc>>>,
    error: Mutex<Option<String>>,
}

impl RunState {
    /// Move to the terminal state. Exactly one caller wins; the rest see
    /// `false` and must not touch the finish fields.
    fn finish(&self, error: Option<String>) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.is_running.store(false, Ordering::SeqCst);
        let mut finish_date = self.finish_date.lock().unwrap();
        if finish_date.is_none() {
            *finish_date = Some(Utc::now());
        }
        drop(finish_date);
        if let Some(message) = error {
            *self.error.lock().unwrap() = Some(message);
        }
        true
    }
}

/// The execution handle for one job instance, distinct from its durable
/// record.
///
/// The job body runs on its own task; [`JobRun::abort`] cancels it at the
/// next await point (a body blocking a thread via `spawn_blocking` is only
/// finalized here — the thread winds down on its own). The terminal
/// transition happens exactly once, whichever of natural completion or abort
/// reaches it first.
///
/// Clones share state; the ledger owns the canonical set.
#[derive(Clone)]
pub struct JobRun {
    state: Arc<RunState>,
    job: Option<Arc<dyn Job>>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl core::fmt::Debug for JobRun {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRun")
            .field("job_id", &self.state.job_id)
            .field("is_running", &self.state.is_running.load(Ordering::SeqCst))
            .field("finished", &self.state.finished.load(Ordering::SeqCst))
            .field("was_recovered", &self.state.was_recovered)
            .finish()
    }
}

impl JobRun {
    /// Wrap a freshly materialized job, ready to start.
    pub fn new(job_id: JobId, job: Arc<dyn Job>) -> Self {
        let timeout = job.timeout();
        Self {
            state: Arc::new(RunState {
                job_id,
                timeout,
                was_recovered: false,
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                is_running: AtomicBool::new(false),
                start_date: Mutex::new(None),
                finish_date: Mutex::new(None),
                error: Mutex::new(None),
            }),
            job: Some(job),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Reconstruct a run from a ledger snapshot.
    ///
    /// The file surviving to be loaded means the prior process did not exit
    /// cleanly: the entry is marked recovered, cannot run again, and gets a
    /// finish date now if it lacked one.
    pub fn from_snapshot(snapshot: RunSnapshot) -> Self {
        Self {
            state: Arc::new(RunState {
                job_id: snapshot.job_id,
                timeout: DEFAULT_JOB_TIMEOUT,
                was_recovered: true,
                started: AtomicBool::new(true),
                finished: AtomicBool::new(true),
                is_running: AtomicBool::new(false),
                start_date: Mutex::new(snapshot.start_date),
                finish_date: Mutex::new(snapshot.finish_date.or_else(|| Some(Utc::now()))),
                error: Mutex::new(snapshot.execution_error),
            }),
            job: None,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the execution task. No-op if already started or finished.
    ///
    /// Any error or panic from `execute()` is captured on the run; nothing
    /// propagates to the caller's task.
    pub fn start(&self) {
        let Some(job) = self.job.clone() else {
            return;
        };
        if self
            .state
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.state.start_date.lock().unwrap() = Some(Utc::now());
        self.state.is_running.store(true, Ordering::SeqCst);

        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(job.execute()).catch_unwind().await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(panic) => Some(panic_message(panic)),
            };
            if state.finish(error) {
                debug!(job_id = %state.job_id, "job run completed");
            }
        });
        *self.handle.lock().unwrap() = Some(task);
    }

    /// Forcibly terminate the execution task and move to finished.
    ///
    /// Returns whether the abort actually took effect — `false` when the run
    /// had already reached the terminal state on its own.
    pub fn abort(&self) -> bool {
        if let Some(task) = self.handle.lock().unwrap().take() {
            task.abort();
        }
        let aborted = self.state.finish(None);
        if aborted {
            debug!(job_id = %self.state.job_id, "job run aborted");
        }
        aborted
    }

    pub fn job_id(&self) -> JobId {
        self.state.job_id
    }

    pub fn timeout(&self) -> Duration {
        self.state.timeout
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    pub fn was_recovered(&self) -> bool {
        self.state.was_recovered
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        *self.state.start_date.lock().unwrap()
    }

    pub fn finish_date(&self) -> Option<DateTime<Utc>> {
        *self.state.finish_date.lock().unwrap()
    }

    pub fn execution_error(&self) -> Option<String> {
        self.state.error.lock().unwrap().clone()
    }

    /// Wall-clock time the run has been executing as of `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.start_date()?;
        now.signed_duration_since(start).to_std().ok()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            job_id: self.job_id(),
            is_running: self.is_running(),
            start_date: self.start_date(),
            finish_date: self.finish_date(),
            execution_error: self.execution_error(),
            was_recovered: self.was_recovered(),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("job panicked: {message}")
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SleepJob {
        millis: u64,
        fail: bool,
    }

    #[async_trait]
    impl Job for SleepJob {
        fn name(&self) -> &str {
            "sleep"
        }

        fn serialize(&self) -> anyhow::Result<String> {
            Ok(self.millis.to_string())
        }

        async fn execute(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            Ok(())
        }
    }

    async fn wait_until_finished(run: &JobRun) {
        for _ in 0..200 {
            if run.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never finished");
    }

    #[tokio::test]
    async fn natural_completion_records_finish() {
        let run = JobRun::new(
            JobId(1),
            Arc::new(SleepJob {
                millis: 1,
                fail: false,
            }),
        );
        run.start();
        assert!(run.is_running());
        wait_until_finished(&run).await;

        assert!(!run.is_running());
        assert!(run.execution_error().is_none());
        assert!(run.finish_date().unwrap() >= run.start_date().unwrap());
    }

    #[tokio::test]
    async fn execution_failure_is_captured() {
        let run = JobRun::new(
            JobId(2),
            Arc::new(SleepJob {
                millis: 1,
                fail: true,
            }),
        );
        run.start();
        wait_until_finished(&run).await;

        let error = run.execution_error().unwrap();
        assert!(error.contains("scripted failure"));
    }

    #[tokio::test]
    async fn abort_wins_against_a_sleeping_job() {
        let run = JobRun::new(
            JobId(3),
            Arc::new(SleepJob {
                millis: 60_000,
                fail: false,
            }),
        );
        run.start();
        assert!(run.abort());
        assert!(run.is_finished());
        assert!(!run.is_running());
        assert!(run.finish_date().is_some());
    }

    #[tokio::test]
    async fn abort_after_finish_reports_false() {
        let run = JobRun::new(
            JobId(4),
            Arc::new(SleepJob {
                millis: 1,
                fail: false,
            }),
        );
        run.start();
        wait_until_finished(&run).await;
        assert!(!run.abort());
    }

    #[tokio::test]
    async fn double_start_is_a_noop() {
        let run = JobRun::new(
            JobId(5),
            Arc::new(SleepJob {
                millis: 1,
                fail: false,
            }),
        );
        run.start();
        let first_start = run.start_date();
        run.start();
        assert_eq!(run.start_date(), first_start);
        wait_until_finished(&run).await;
    }

    #[tokio::test]
    async fn recovered_snapshot_backfills_finish_date() {
        let snapshot = RunSnapshot {
            job_id: JobId(6),
            is_running: true,
            start_date: Some(Utc::now()),
            finish_date: None,
            execution_error: None,
            was_recovered: false,
        };
        let run = JobRun::from_snapshot(snapshot);

        assert!(run.was_recovered());
        assert!(!run.is_running());
        assert!(run.finish_date().is_some());
        assert!(!run.abort(), "recovered runs are already terminal");
    }
}
