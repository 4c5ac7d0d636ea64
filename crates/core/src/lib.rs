//! `taskmill-core` — domain foundation of the job subsystem.
//!
//! This crate contains **pure domain** types (no storage or scheduling
//! concerns): the durable job record, the executable `Job` contract, and the
//! registry that turns a stored type key back into a runnable instance.

pub mod job;
pub mod record;
pub mod registry;

pub use job::{Job, DEFAULT_JOB_TIMEOUT};
pub use record::{JobId, JobRecord, JobStatus, ParseJobStatusError};
pub use registry::JobTypeRegistry;
