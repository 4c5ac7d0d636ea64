//! The job store boundary.
//!
//! This module defines the storage abstraction every backend implements,
//! without making assumptions about the underlying engine.
//!
//! ## Transaction Semantics
//!
//! `begin()` opens a scoped unit of work. Operations applied through the
//! transaction must not be visible to readers outside it until `commit()`;
//! `rollback()` discards them with no visible effect. `commit`/`rollback`
//! consume the transaction (`self: Box<Self>`), so a finished transaction
//! cannot be reused. Dropping an uncommitted SQL transaction rolls it back.
//!
//! Id assignment happens at save time even under a pending transaction, so a
//! caller can reference the new id before commit.
//!
//! ## Implementation Requirements
//!
//! Backends must:
//! - assign a fresh id when saving a record whose `id` is `None`, writing it
//!   back into the record before returning
//! - order multi-record reads by queue date ascending
//! - treat an empty id list as an empty result, never "all records"
//! - treat `count <= 0` in [`JobStore::get_jobs_by_status`] as unbounded
//! - store statuses by their string names, never ordinals
//! - surface connection/configuration errors instead of retrying internally

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use taskmill_core::{Job, JobId, JobRecord, JobStatus, ParseJobStatusError};

/// Job store operation error.
///
/// These are infrastructure errors (storage, configuration, decoding) as
/// opposed to job execution failures, which live on the records themselves.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid stored job status: {0}")]
    InvalidStatus(#[from] ParseJobStatusError),

    #[error("job serialization failed: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Scoped unit of work over one store.
///
/// The in-memory backend buffers operations client-side and replays them on
/// commit; SQL backends wrap a live database transaction and execute
/// immediately, relying on the database's isolation.
#[async_trait]
pub trait JobStoreTransaction: Send {
    /// Stage a save. Inserts assign the new id into the record immediately.
    async fn save(&mut self, record: &mut JobRecord) -> Result<(), JobStoreError>;

    /// Stage a delete by id.
    async fn delete(&mut self, id: JobId) -> Result<(), JobStoreError>;

    /// Make every staged operation visible atomically.
    async fn commit(self: Box<Self>) -> Result<(), JobStoreError>;

    /// Discard every staged operation with no visible effect.
    async fn rollback(self: Box<Self>) -> Result<(), JobStoreError>;
}

/// Durable CRUD over job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert when `record.id` is `None` (assigning the id into the record),
    /// update by id otherwise.
    async fn save_job(&self, record: &mut JobRecord) -> Result<(), JobStoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Fetch the given ids, queue-date ascending. Empty input yields empty
    /// output.
    async fn get_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Fetch up to `count` records in the given status, queue-date ascending.
    /// `count <= 0` means unbounded.
    async fn get_jobs_by_status(
        &self,
        status: JobStatus,
        count: i64,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    async fn delete_job(&self, id: JobId) -> Result<(), JobStoreError>;

    /// For each distinct (job type, schedule name) pair whose schedule name
    /// is in the given set, return only the most recently queued record.
    async fn get_latest_scheduled_jobs(
        &self,
        schedule_names: &[String],
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Open a scoped unit of work.
    async fn begin(&self) -> Result<Box<dyn JobStoreTransaction>, JobStoreError>;

    /// Stable identifier distinguishing backend + configuration, used to
    /// namespace per-store state (the running-jobs ledger file). Hashed
    /// before it touches disk or logs; may contain connection details.
    fn type_key(&self) -> String;
}

#[async_trait]
impl<S> JobStore for std::sync::Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn save_job(&self, record: &mut JobRecord) -> Result<(), JobStoreError> {
        (**self).save_job(record).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get_job(id).await
    }

    async fn get_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).get_jobs(ids).await
    }

    async fn get_jobs_by_status(
        &self,
        status: JobStatus,
        count: i64,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).get_jobs_by_status(status, count).await
    }

    async fn delete_job(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).delete_job(id).await
    }

    async fn get_latest_scheduled_jobs(
        &self,
        schedule_names: &[String],
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).get_latest_scheduled_jobs(schedule_names).await
    }

    async fn begin(&self) -> Result<Box<dyn JobStoreTransaction>, JobStoreError> {
        (**self).begin().await
    }

    fn type_key(&self) -> String {
        (**self).type_key()
    }
}

/// Persist a job as a new queued record, returning the saved (id-assigned)
/// record.
///
/// `queue_date` defaults to now (UTC); `schedule_name` tags records produced
/// by a recurring schedule lineage.
pub async fn enqueue<S>(
    store: &S,
    job: &dyn Job,
    queue_date: Option<DateTime<Utc>>,
    schedule_name: Option<String>,
) -> Result<JobRecord, JobStoreError>
where
    S: JobStore + ?Sized,
{
    let data = job
        .serialize()
        .map_err(|e| JobStoreError::Serialization(format!("{e:#}")))?;
    let mut record = JobRecord::queued(
        job.name(),
        job.job_type(),
        data,
        queue_date.unwrap_or_else(Utc::now),
        schedule_name,
    );
    store.save_job(&mut record).await?;
    Ok(record)
}
