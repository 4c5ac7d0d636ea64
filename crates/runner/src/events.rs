//! Runner lifecycle events.
//!
//! The only observable signal surface of the runner: external listeners
//! subscribe to a broadcast channel and receive the affected record with
//! each event. Emission never blocks the control loop; with no subscribers
//! events are simply dropped.

use tokio::sync::broadcast;

use taskmill_core::JobRecord;

pub type RunnerEventSender = broadcast::Sender<RunnerEvent>;
pub type RunnerEventReceiver = broadcast::Receiver<RunnerEvent>;

/// Lifecycle notification carrying the affected record.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// A queued record was picked up (including records that failed to
    /// materialize into a runnable job).
    DequeueJob(JobRecord),
    /// An externally requested cancellation was honored.
    CancelJob(JobRecord),
    /// A run exceeded its job's timeout and was aborted.
    TimeoutJob(JobRecord),
    /// A run completed and its record reached a terminal status.
    FinishJob(JobRecord),
    /// A failure surfaced: a job failure or load failure (with its record),
    /// or a store/ledger failure inside the loop (without one).
    Error {
        record: Option<JobRecord>,
        message: String,
    },
    /// Safe shutdown observed zero executing runs.
    AllFinished,
}

pub fn channel() -> (RunnerEventSender, RunnerEventReceiver) {
    broadcast::channel(256)
}
