//! The scheduler control loop.
//!
//! One runner per store configuration. The loop wakes every heartbeat and
//! works through four passes in a fixed order — dequeue, cancel, timeout,
//! finish — so a record can never be dequeued and finalized in
//! contradictory ways within one pass. Each mutating pass groups its record
//! writes in one store transaction, committed only after the ledger has been
//! flushed to disk: the on-disk ledger and the durable store are never more
//! than one heartbeat apart, and a crash between flush and commit is
//! reconciled on a later pass.
//!
//! A failure inside a pass is reported through the event surface and the
//! loop simply tries again next heartbeat; losing the loop would be a total
//! scheduler outage, so nothing is allowed to take it down.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskmill_core::{JobRecord, JobStatus, JobTypeRegistry};
use taskmill_store::{JobStore, JobStoreError};

use crate::config::{ConfigError, RunnerConfig};
use crate::events::{self, RunnerEvent, RunnerEventReceiver, RunnerEventSender};
use crate::ledger::{LedgerError, RunningJobs};
use crate::run::JobRun;

/// Runner failure surfaced through construction or the loop guard.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Control-loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunnerState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
    ShuttingDown = 3,
}

impl From<u8> for RunnerState {
    fn from(value: u8) -> Self {
        match value {
            1 => RunnerState::Running,
            2 => RunnerState::Paused,
            3 => RunnerState::ShuttingDown,
            _ => RunnerState::Stopped,
        }
    }
}

struct RunnerInner {
    store: Arc<dyn JobStore>,
    types: Arc<JobTypeRegistry>,
    config: RunnerConfig,
    ledger: RunningJobs,
    state: AtomicU8,
    events: RunnerEventSender,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RunnerInner {
    fn state(&self) -> RunnerState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: RunnerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: RunnerState, to: RunnerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn emit(&self, event: RunnerEvent) {
        let _ = self.events.send(event);
    }
}

/// The scheduler: dequeues queued records up to the concurrency cap, starts
/// runs, polls for cancellation and timeouts, finalizes completed runs, and
/// emits lifecycle events.
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    /// Build a runner over a store. Validates configuration synchronously
    /// and loads the ledger, recovering any runs a previous process left in
    /// flight (they are finalized as `Interrupted` by the finish pass).
    pub fn new(
        store: Arc<dyn JobStore>,
        types: Arc<JobTypeRegistry>,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        let ledger = RunningJobs::open(&config.ledger_dir, &store.type_key());
        let (events, _) = events::channel();
        Ok(Self {
            inner: Arc::new(RunnerInner {
                store,
                types,
                config,
                ledger,
                state: AtomicU8::new(RunnerState::Stopped as u8),
                events,
                loop_handle: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> RunnerState {
        self.inner.state()
    }

    /// Number of currently executing runs.
    pub fn executing_count(&self) -> usize {
        self.inner.ledger.running_count()
    }

    pub fn ledger(&self) -> &RunningJobs {
        &self.inner.ledger
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> RunnerEventReceiver {
        self.inner.events.subscribe()
    }

    /// Spawn the control loop if it is not already alive. Idempotent while
    /// not shutting down; a no-op during shutdown. Must be called within a
    /// tokio runtime.
    pub fn start(&self) {
        if !self
            .inner
            .transition(RunnerState::Stopped, RunnerState::Running)
        {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(run_loop(inner));
        *self.inner.loop_handle.lock().unwrap() = Some(handle);
    }

    /// Stop dequeuing new records without touching in-flight runs.
    pub fn pause(&self) {
        if self
            .inner
            .transition(RunnerState::Running, RunnerState::Paused)
        {
            info!("job runner paused");
        }
    }

    pub fn resume(&self) {
        if self
            .inner
            .transition(RunnerState::Paused, RunnerState::Running)
        {
            info!("job runner resumed");
        }
    }

    /// Stop the runner.
    ///
    /// With `safely = true`, flags shutdown and waits for the loop to
    /// observe zero executing runs, emit `AllFinished`, and exit. With
    /// `safely = false`, aborts the loop task immediately (best effort;
    /// in-flight runs are left to complete on their own).
    pub async fn stop(&self, safely: bool) {
        if safely {
            let flagged = self
                .inner
                .transition(RunnerState::Running, RunnerState::ShuttingDown)
                || self
                    .inner
                    .transition(RunnerState::Paused, RunnerState::ShuttingDown);
            if !flagged {
                return;
            }
            let handle = self.inner.loop_handle.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        } else {
            self.inner.set_state(RunnerState::Stopped);
            let handle = self.inner.loop_handle.lock().unwrap().take();
            if let Some(handle) = handle {
                handle.abort();
            }
            info!("job runner stopped");
        }
    }
}

async fn run_loop(inner: Arc<RunnerInner>) {
    info!(
        heartbeat_ms = inner.config.heartbeat_ms,
        max_concurrency = inner.config.max_concurrency,
        "job runner started"
    );
    loop {
        let state = inner.state();
        if state == RunnerState::Stopped {
            break;
        }
        if let Err(e) = beat(&inner, state).await {
            warn!(error = %e, "heartbeat pass failed");
            inner.emit(RunnerEvent::Error {
                record: None,
                message: e.to_string(),
            });
        }
        if inner.state() == RunnerState::ShuttingDown && inner.ledger.running_count() == 0 {
            inner.emit(RunnerEvent::AllFinished);
            inner.set_state(RunnerState::Stopped);
            break;
        }
        tokio::time::sleep(inner.config.heartbeat()).await;
    }
    info!("job runner stopped");
}

/// One heartbeat: dequeue → cancel → timeout → finish, in that order.
async fn beat(inner: &RunnerInner, state: RunnerState) -> Result<(), RunnerError> {
    if state == RunnerState::Running {
        dequeue_pass(inner).await?;
    }
    cancel_pass(inner).await?;
    timeout_pass(inner).await?;
    finish_pass(inner).await?;
    Ok(())
}

/// Pick up queued records up to the free concurrency, start their runs, and
/// commit every touched record in one transaction after the ledger flush.
async fn dequeue_pass(inner: &RunnerInner) -> Result<(), RunnerError> {
    let executing = inner.ledger.running_count();
    let available = inner.config.max_concurrency.saturating_sub(executing);
    if available == 0 {
        return Ok(());
    }

    let queued = inner
        .store
        .get_jobs_by_status(JobStatus::Queued, available as i64)
        .await?;
    if queued.is_empty() {
        return Ok(());
    }

    let mut tx = inner.store.begin().await?;
    let now = Utc::now();
    let mut started: Vec<JobRecord> = Vec::new();
    let mut load_failures: Vec<JobRecord> = Vec::new();

    for mut record in queued {
        record.start_date = Some(now);
        match inner.types.materialize(&record.job_type, &record.data) {
            Ok(job) => {
                record.status = JobStatus::Started;
                tx.save(&mut record).await?;
                let job_id = record.id.expect("stored record carries an id");
                let run = JobRun::new(job_id, job);
                inner.ledger.add(run.clone());
                run.start();
                debug!(job_id = %job_id, name = %record.name, "job dequeued");
                started.push(record);
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(job_type = %record.job_type, error = %message, "failed to load job type");
                record.status = JobStatus::FailedToLoadType;
                record.exception = Some(message);
                record.finish_date = Some(now);
                tx.save(&mut record).await?;
                load_failures.push(record);
            }
        }
    }

    inner.ledger.flush()?;
    tx.commit().await?;

    for record in started {
        inner.emit(RunnerEvent::DequeueJob(record));
    }
    for record in load_failures {
        let message = record.exception.clone().unwrap_or_default();
        inner.emit(RunnerEvent::DequeueJob(record.clone()));
        inner.emit(RunnerEvent::Error {
            record: Some(record),
            message,
        });
    }
    Ok(())
}

/// Honor externally requested cancellations: abort the run and finalize the
/// record as `Canceled`.
async fn cancel_pass(inner: &RunnerInner) -> Result<(), RunnerError> {
    let running = inner.ledger.get_running();
    if running.is_empty() {
        return Ok(());
    }
    let ids: Vec<_> = running.iter().map(JobRun::job_id).collect();
    let records = inner.store.get_jobs(&ids).await?;
    let canceling: Vec<JobRecord> = records
        .into_iter()
        .filter(|record| record.status == JobStatus::Canceling)
        .collect();
    if canceling.is_empty() {
        return Ok(());
    }

    let mut tx = inner.store.begin().await?;
    let mut canceled = Vec::new();
    for mut record in canceling {
        let job_id = record.id.expect("stored record carries an id");
        let Some(run) = inner.ledger.get(job_id) else {
            continue;
        };
        run.abort();
        record.status = JobStatus::Canceled;
        record.finish_date = run.finish_date().or_else(|| Some(Utc::now()));
        tx.save(&mut record).await?;
        inner.ledger.remove(job_id);
        info!(job_id = %job_id, name = %record.name, "job canceled");
        canceled.push(record);
    }
    inner.ledger.flush()?;
    tx.commit().await?;

    for record in canceled {
        inner.emit(RunnerEvent::CancelJob(record));
    }
    Ok(())
}

/// Abort runs that have exceeded their job's timeout. A run that finished
/// naturally just before the abort is left for the finish pass.
async fn timeout_pass(inner: &RunnerInner) -> Result<(), RunnerError> {
    let now = Utc::now();
    let expired: Vec<JobRun> = inner
        .ledger
        .get_running()
        .into_iter()
        .filter(|run| match run.elapsed(now) {
            Some(elapsed) => elapsed > run.timeout(),
            None => false,
        })
        .collect();
    if expired.is_empty() {
        return Ok(());
    }

    let mut tx = inner.store.begin().await?;
    let mut timed_out = Vec::new();
    for run in expired {
        if !run.abort() {
            continue;
        }
        let job_id = run.job_id();
        if let Some(mut record) = inner.store.get_job(job_id).await? {
            record.status = JobStatus::TimedOut;
            record.finish_date = run.finish_date();
            tx.save(&mut record).await?;
            warn!(job_id = %job_id, name = %record.name, "job timed out");
            timed_out.push(record);
        }
        inner.ledger.remove(job_id);
    }
    inner.ledger.flush()?;
    tx.commit().await?;

    for record in timed_out {
        inner.emit(RunnerEvent::TimeoutJob(record));
    }
    Ok(())
}

/// Finalize naturally completed runs, and drop ledger entries whose record
/// is no longer `Started` (recovered-stale reconciliation).
async fn finish_pass(inner: &RunnerInner) -> Result<(), RunnerError> {
    let completed = inner.ledger.get_not_running();
    if completed.is_empty() {
        return Ok(());
    }

    let mut tx = inner.store.begin().await?;
    let mut finished = Vec::new();
    let mut touched = false;
    for run in completed {
        let job_id = run.job_id();
        match inner.store.get_job(job_id).await? {
            Some(mut record) if record.status == JobStatus::Started => {
                let error = run.execution_error();
                record.status = if error.is_some() {
                    JobStatus::Failed
                } else if run.was_recovered() {
                    JobStatus::Interrupted
                } else {
                    JobStatus::Succeeded
                };
                record.exception = error;
                record.finish_date = run.finish_date().or_else(|| Some(Utc::now()));
                tx.save(&mut record).await?;
                inner.ledger.remove(job_id);
                touched = true;
                debug!(job_id = %job_id, status = %record.status, "job finished");
                finished.push(record);
            }
            _ => {
                // Record missing, re-queued, or already terminal: the entry
                // is stale and the store owns the truth.
                inner.ledger.remove(job_id);
                touched = true;
            }
        }
    }
    if touched {
        inner.ledger.flush()?;
    }
    tx.commit().await?;

    for record in finished {
        if record.status == JobStatus::Failed {
            let message = record.exception.clone().unwrap_or_default();
            inner.emit(RunnerEvent::Error {
                record: Some(record.clone()),
                message,
            });
        }
        inner.emit(RunnerEvent::FinishJob(record));
    }
    Ok(())
}
