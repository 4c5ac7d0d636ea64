//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use taskmill_core::{JobId, JobRecord, JobStatus};

use crate::r#trait::{JobStore, JobStoreError, JobStoreTransaction};

#[derive(Debug, Default)]
struct Inner {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    next_id: AtomicI64,
}

impl Inner {
    fn allocate_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// HashMap-backed store. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.inner.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted_by_queue_date(mut records: Vec<JobRecord>) -> Vec<JobRecord> {
    records.sort_by_key(|r| (r.queue_date, r.id));
    records
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save_job(&self, record: &mut JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.inner.jobs.write().unwrap();
        match record.id {
            None => {
                let id = self.inner.allocate_id();
                record.id = Some(id);
                jobs.insert(id, record.clone());
            }
            Some(id) => {
                if !jobs.contains_key(&id) {
                    return Err(JobStoreError::NotFound(id));
                }
                jobs.insert(id, record.clone());
            }
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.inner.jobs.read().unwrap().get(&id).cloned())
    }

    async fn get_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, JobStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let jobs = self.inner.jobs.read().unwrap();
        let records = ids.iter().filter_map(|id| jobs.get(id).cloned()).collect();
        Ok(sorted_by_queue_date(records))
    }

    async fn get_jobs_by_status(
        &self,
        status: JobStatus,
        count: i64,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.inner.jobs.read().unwrap();
        let records = jobs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        let mut records = sorted_by_queue_date(records);
        if count > 0 {
            records.truncate(count as usize);
        }
        Ok(records)
    }

    async fn delete_job(&self, id: JobId) -> Result<(), JobStoreError> {
        self.inner.jobs.write().unwrap().remove(&id);
        Ok(())
    }

    async fn get_latest_scheduled_jobs(
        &self,
        schedule_names: &[String],
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if schedule_names.is_empty() {
            return Ok(Vec::new());
        }
        let jobs = self.inner.jobs.read().unwrap();
        let mut latest: HashMap<(String, String), JobRecord> = HashMap::new();
        for record in jobs.values() {
            let Some(schedule) = record.schedule_name.as_ref() else {
                continue;
            };
            if !schedule_names.contains(schedule) {
                continue;
            }
            let key = (record.job_type.clone(), schedule.clone());
            let newer = match latest.get(&key) {
                Some(existing) => (record.queue_date, record.id) > (existing.queue_date, existing.id),
                None => true,
            };
            if newer {
                latest.insert(key, record.clone());
            }
        }
        Ok(sorted_by_queue_date(latest.into_values().collect()))
    }

    async fn begin(&self) -> Result<Box<dyn JobStoreTransaction>, JobStoreError> {
        Ok(Box::new(InMemoryTransaction {
            inner: self.inner.clone(),
            ops: Vec::new(),
        }))
    }

    fn type_key(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Debug)]
enum TxOp {
    Save(JobRecord),
    Delete(JobId),
}

/// Client-side buffered transaction, replayed against the map on commit.
///
/// Ids are still allocated from the shared counter at save time, so callers
/// can reference them before commit; a rolled-back insert leaves an id gap,
/// matching identity-column behavior.
struct InMemoryTransaction {
    inner: Arc<Inner>,
    ops: Vec<TxOp>,
}

#[async_trait]
impl JobStoreTransaction for InMemoryTransaction {
    async fn save(&mut self, record: &mut JobRecord) -> Result<(), JobStoreError> {
        if record.id.is_none() {
            record.id = Some(self.inner.allocate_id());
        }
        self.ops.push(TxOp::Save(record.clone()));
        Ok(())
    }

    async fn delete(&mut self, id: JobId) -> Result<(), JobStoreError> {
        self.ops.push(TxOp::Delete(id));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), JobStoreError> {
        let mut jobs = self.inner.jobs.write().unwrap();
        for op in self.ops {
            match op {
                TxOp::Save(record) => {
                    let id = record.id.expect("buffered save always carries an id");
                    jobs.insert(id, record);
                }
                TxOp::Delete(id) => {
                    jobs.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), JobStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::r#trait::JobStore;

    fn record(name: &str, schedule: Option<&str>, offset_secs: i64) -> JobRecord {
        JobRecord::queued(
            name,
            name,
            "{}",
            Utc::now() + Duration::seconds(offset_secs),
            schedule.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn save_assigns_id_and_readback_is_field_equal() {
        let store = InMemoryJobStore::new();
        let mut rec = record("report", None, 0);
        store.save_job(&mut rec).await.unwrap();

        let id = rec.id.expect("id assigned on first save");
        let loaded = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn update_of_missing_id_is_not_found() {
        let store = InMemoryJobStore::new();
        let mut rec = record("report", None, 0);
        rec.id = Some(JobId(42));
        let err = store.save_job(&mut rec).await.unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(JobId(42))));
    }

    #[tokio::test]
    async fn empty_id_list_yields_empty_output() {
        let store = InMemoryJobStore::new();
        let mut rec = record("report", None, 0);
        store.save_job(&mut rec).await.unwrap();

        assert!(store.get_jobs(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_jobs_orders_by_queue_date() {
        let store = InMemoryJobStore::new();
        let mut late = record("late", None, 60);
        let mut early = record("early", None, -60);
        store.save_job(&mut late).await.unwrap();
        store.save_job(&mut early).await.unwrap();

        let records = store
            .get_jobs(&[late.id.unwrap(), early.id.unwrap()])
            .await
            .unwrap();
        assert_eq!(records[0].name, "early");
        assert_eq!(records[1].name, "late");
    }

    #[tokio::test]
    async fn status_query_honors_count_and_unbounded() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            let mut rec = record(&format!("job-{i}"), None, i);
            store.save_job(&mut rec).await.unwrap();
        }

        let limited = store
            .get_jobs_by_status(JobStatus::Queued, 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].name, "job-0");

        let unbounded = store
            .get_jobs_by_status(JobStatus::Queued, 0)
            .await
            .unwrap();
        assert_eq!(unbounded.len(), 5);
    }

    #[tokio::test]
    async fn latest_scheduled_returns_top_record_per_pair() {
        let store = InMemoryJobStore::new();
        for offset in [0, 60, 120] {
            let mut rec = record("sync", Some("hourly"), offset);
            store.save_job(&mut rec).await.unwrap();
        }
        for offset in [0, 30] {
            let mut rec = record("purge", Some("hourly"), offset);
            store.save_job(&mut rec).await.unwrap();
        }
        let mut other = record("sync", Some("daily"), 240);
        store.save_job(&mut other).await.unwrap();

        let latest = store
            .get_latest_scheduled_jobs(&["hourly".to_string(), "daily".to_string()])
            .await
            .unwrap();
        assert_eq!(latest.len(), 3);

        let hourly_sync = latest
            .iter()
            .find(|r| r.job_type == "sync" && r.schedule_name.as_deref() == Some("hourly"))
            .unwrap();
        let newest = store
            .get_jobs_by_status(JobStatus::Queued, 0)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.job_type == "sync" && r.schedule_name.as_deref() == Some("hourly"))
            .map(|r| r.queue_date)
            .max()
            .unwrap();
        assert_eq!(hourly_sync.queue_date, newest);
    }

    #[tokio::test]
    async fn unlisted_schedules_are_ignored() {
        let store = InMemoryJobStore::new();
        let mut rec = record("sync", Some("hourly"), 0);
        store.save_job(&mut rec).await.unwrap();

        let latest = store
            .get_latest_scheduled_jobs(&["weekly".to_string()])
            .await
            .unwrap();
        assert!(latest.is_empty());
    }

    #[tokio::test]
    async fn rollback_leaves_store_untouched() {
        let store = InMemoryJobStore::new();
        let mut existing = record("keep", None, 0);
        store.save_job(&mut existing).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut fresh = record("discard", None, 0);
        tx.save(&mut fresh).await.unwrap();
        let fresh_id = fresh.id.unwrap();
        tx.delete(existing.id.unwrap()).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_job(fresh_id).await.unwrap().is_none());
        assert_eq!(
            store.get_job(existing.id.unwrap()).await.unwrap().unwrap(),
            existing
        );
    }

    #[tokio::test]
    async fn staged_operations_invisible_until_commit() {
        let store = InMemoryJobStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut rec = record("pending", None, 0);
        tx.save(&mut rec).await.unwrap();
        let id = rec.id.unwrap();

        assert!(store.get_job(id).await.unwrap().is_none());
        tx.commit().await.unwrap();
        assert_eq!(store.get_job(id).await.unwrap().unwrap().name, "pending");
    }

    #[tokio::test]
    async fn commit_applies_saves_and_deletes_in_order() {
        let store = InMemoryJobStore::new();
        let mut doomed = record("doomed", None, 0);
        store.save_job(&mut doomed).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut kept = record("kept", None, 0);
        tx.save(&mut kept).await.unwrap();
        tx.delete(doomed.id.unwrap()).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.get_job(doomed.id.unwrap()).await.unwrap().is_none());
        assert!(store.get_job(kept.id.unwrap()).await.unwrap().is_some());
    }
}
