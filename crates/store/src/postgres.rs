//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! sqlx errors surface as `JobStoreError::Storage` with the failing operation
//! named; connection/configuration failures at construction surface as
//! `JobStoreError::Configuration`. The store never retries internally —
//! retry policy belongs to the runner's heartbeat.
//!
//! ## Thread Safety
//!
//! `PostgresJobStore` is `Send + Sync`; all operations go through the sqlx
//! connection pool. Transactions hold one pooled connection for their
//! lifetime and roll back when dropped uncommitted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use taskmill_core::{JobId, JobRecord, JobStatus};

use crate::r#trait::{JobStore, JobStoreError, JobStoreTransaction};

const COLUMNS: &str =
    "id, name, job_type, data, status, exception, queue_date, start_date, finish_date, schedule_name";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        job_type TEXT NOT NULL,
        data TEXT NOT NULL,
        status TEXT NOT NULL,
        exception TEXT,
        queue_date TIMESTAMPTZ NOT NULL,
        start_date TIMESTAMPTZ,
        finish_date TIMESTAMPTZ,
        schedule_name TEXT
    )",
    "CREATE INDEX IF NOT EXISTS ix_jobs_status_queue_date ON jobs (status, queue_date)",
];

/// Postgres job store over a sqlx pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    type_key: String,
}

impl PostgresJobStore {
    /// Connect to the given database URL and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| JobStoreError::Configuration(format!("postgres connect failed: {e}")))?;
        let store = Self {
            pool,
            type_key: format!("postgres:{url}"),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not touched.
    pub fn from_pool(pool: PgPool, type_key: impl Into<String>) -> Self {
        Self {
            pool,
            type_key: type_key.into(),
        }
    }

    /// Create the jobs table and its index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!("postgres job schema ensured");
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("postgres {operation}: {err}"))
}

struct JobRow {
    id: i64,
    name: String,
    job_type: String,
    data: String,
    status: String,
    exception: Option<String>,
    queue_date: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    finish_date: Option<DateTime<Utc>>,
    schedule_name: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            job_type: row.try_get("job_type")?,
            data: row.try_get("data")?,
            status: row.try_get("status")?,
            exception: row.try_get("exception")?,
            queue_date: row.try_get("queue_date")?,
            start_date: row.try_get("start_date")?,
            finish_date: row.try_get("finish_date")?,
            schedule_name: row.try_get("schedule_name")?,
        })
    }
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord, JobStoreError> {
        Ok(JobRecord {
            id: Some(JobId(self.id)),
            name: self.name,
            job_type: self.job_type,
            data: self.data,
            status: self.status.parse()?,
            exception: self.exception,
            queue_date: self.queue_date,
            start_date: self.start_date,
            finish_date: self.finish_date,
            schedule_name: self.schedule_name,
        })
    }
}

fn rows_into_records(rows: Vec<PgRow>) -> Result<Vec<JobRecord>, JobStoreError> {
    rows.into_iter()
        .map(|row| {
            use sqlx::FromRow;
            JobRow::from_row(&row)
                .map_err(|e| JobStoreError::Storage(format!("postgres row decode: {e}")))?
                .into_record()
        })
        .collect()
}

async fn save_with<'e, E>(executor: E, record: &mut JobRecord) -> Result<(), JobStoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    match record.id {
        None => {
            let row = sqlx::query(
                "INSERT INTO jobs \
                 (name, job_type, data, status, exception, queue_date, start_date, finish_date, schedule_name) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 RETURNING id",
            )
            .bind(&record.name)
            .bind(&record.job_type)
            .bind(&record.data)
            .bind(record.status.as_str())
            .bind(&record.exception)
            .bind(record.queue_date)
            .bind(record.start_date)
            .bind(record.finish_date)
            .bind(&record.schedule_name)
            .fetch_one(executor)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
            let id: i64 = row
                .try_get("id")
                .map_err(|e| JobStoreError::Storage(format!("postgres insert id decode: {e}")))?;
            record.id = Some(JobId(id));
            Ok(())
        }
        Some(id) => {
            let result = sqlx::query(
                "UPDATE jobs SET name = $2, job_type = $3, data = $4, status = $5, exception = $6, \
                 queue_date = $7, start_date = $8, finish_date = $9, schedule_name = $10 \
                 WHERE id = $1",
            )
            .bind(id.as_i64())
            .bind(&record.name)
            .bind(&record.job_type)
            .bind(&record.data)
            .bind(record.status.as_str())
            .bind(&record.exception)
            .bind(record.queue_date)
            .bind(record.start_date)
            .bind(record.finish_date)
            .bind(&record.schedule_name)
            .execute(executor)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;
            if result.rows_affected() == 0 {
                return Err(JobStoreError::NotFound(id));
            }
            Ok(())
        }
    }
}

async fn delete_with<'e, E>(executor: E, id: JobId) -> Result<(), JobStoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id.as_i64())
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error("delete_job", e))?;
    Ok(())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn save_job(&self, record: &mut JobRecord) -> Result<(), JobStoreError> {
        save_with(&self.pool, record).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        match row {
            Some(row) => {
                use sqlx::FromRow;
                let record = JobRow::from_row(&row)
                    .map_err(|e| JobStoreError::Storage(format!("postgres row decode: {e}")))?
                    .into_record()?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn get_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, JobStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw_ids: Vec<i64> = ids.iter().map(|id| id.as_i64()).collect();
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs WHERE id = ANY($1) ORDER BY queue_date ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(&raw_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_jobs", e))?;
        rows_into_records(rows)
    }

    async fn get_jobs_by_status(
        &self,
        status: JobStatus,
        count: i64,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = if count > 0 {
            let sql = format!(
                "SELECT {COLUMNS} FROM jobs WHERE status = $1 ORDER BY queue_date ASC, id ASC LIMIT $2"
            );
            sqlx::query(&sql)
                .bind(status.as_str())
                .bind(count)
                .fetch_all(&self.pool)
                .await
        } else {
            let sql = format!(
                "SELECT {COLUMNS} FROM jobs WHERE status = $1 ORDER BY queue_date ASC, id ASC"
            );
            sqlx::query(&sql)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| map_sqlx_error("get_jobs_by_status", e))?;
        rows_into_records(rows)
    }

    async fn delete_job(&self, id: JobId) -> Result<(), JobStoreError> {
        delete_with(&self.pool, id).await
    }

    async fn get_latest_scheduled_jobs(
        &self,
        schedule_names: &[String],
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if schedule_names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM ( \
                SELECT {COLUMNS}, ROW_NUMBER() OVER ( \
                    PARTITION BY job_type, schedule_name \
                    ORDER BY queue_date DESC, id DESC \
                ) AS rn \
                FROM jobs WHERE schedule_name = ANY($1) \
             ) ranked WHERE rn = 1 ORDER BY queue_date ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(schedule_names)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_latest_scheduled_jobs", e))?;
        rows_into_records(rows)
    }

    async fn begin(&self) -> Result<Box<dyn JobStoreTransaction>, JobStoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    fn type_key(&self) -> String {
        self.type_key.clone()
    }
}

/// Live database transaction; statements execute immediately and become
/// visible on commit. Dropping it uncommitted rolls back.
struct PostgresTransaction {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl JobStoreTransaction for PostgresTransaction {
    async fn save(&mut self, record: &mut JobRecord) -> Result<(), JobStoreError> {
        save_with(&mut *self.tx, record).await
    }

    async fn delete(&mut self, id: JobId) -> Result<(), JobStoreError> {
        delete_with(&mut *self.tx, id).await
    }

    async fn commit(self: Box<Self>) -> Result<(), JobStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), JobStoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}
