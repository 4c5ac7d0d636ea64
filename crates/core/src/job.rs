//! The executable job contract.

use std::time::Duration;

use async_trait::async_trait;

/// Wall-clock budget applied when a job does not override [`Job::timeout`].
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_millis(60_000);

/// A unit of schedulable work.
///
/// Implementations are reconstructed from storage through the
/// [`JobTypeRegistry`](crate::registry::JobTypeRegistry): `job_type()` is the
/// stable key written into the record, and the registered factory rebuilds an
/// instance from the string produced by `serialize()`.
///
/// `execute()` may fail with any error; the runner captures it (panics
/// included) and finalizes the record as failed — nothing escapes onto the
/// scheduling loop. Cancellation and timeout abort the task at its next await
/// point, so long-running bodies should contain awaits (or run blocking
/// sections under `spawn_blocking`, accepting that an abort then only
/// finalizes the record while the thread winds down on its own).
#[async_trait]
pub trait Job: Send + Sync {
    /// Display name, constant per job type.
    fn name(&self) -> &str;

    /// Stable type identifier used to reconstruct the job from storage.
    fn job_type(&self) -> &str {
        self.name()
    }

    /// Maximum allowed wall-clock run time.
    fn timeout(&self) -> Duration {
        DEFAULT_JOB_TIMEOUT
    }

    /// Durable representation of job-specific state, stored in the record.
    fn serialize(&self) -> anyhow::Result<String>;

    /// Perform the unit of work.
    async fn execute(&self) -> anyhow::Result<()>;
}
