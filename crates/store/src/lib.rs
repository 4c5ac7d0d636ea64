//! Durable job storage behind one boundary.
//!
//! ## Design
//!
//! - One `JobStore` trait, multiple backends (in-memory, SQLite, Postgres)
//! - Batch mutations group under a `JobStoreTransaction` for atomic commit
//! - Ids are assigned by the backend on first save, synchronously, even under
//!   a pending transaction
//! - Backend errors surface to the caller; retry policy belongs to the
//!   runner's heartbeat, not the store
//!
//! ## Components
//!
//! - `JobStore`: CRUD + windowed schedule query over job records
//! - `JobStoreTransaction`: scoped unit of work with commit/rollback
//! - `InMemoryJobStore`: tests/dev backend
//! - `SqliteJobStore` / `PostgresJobStore`: sqlx-backed durable backends
//! - `enqueue`: persists a `Job` as a new queued record

pub mod in_memory;
pub mod postgres;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use sqlite::SqliteJobStore;
pub use r#trait::{enqueue, JobStore, JobStoreError, JobStoreTransaction};
