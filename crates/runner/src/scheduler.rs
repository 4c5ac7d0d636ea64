//! Recurring-schedule expansion.
//!
//! A thin collaborator on top of the store: given the configured schedule
//! definitions, each tick enqueues a fresh record for every lineage that is
//! due, tagged with the schedule name. Delivery guarantees are the core's;
//! the expander itself only ever looks at the latest record per lineage.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use taskmill_core::JobRecord;
use taskmill_store::{JobStore, JobStoreError};

/// One named recurring job definition from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Schedule name; every record this definition produces shares it.
    pub name: String,
    /// Stable job type key of the job to enqueue.
    pub job_type: String,
    /// Display name for enqueued records; defaults to the job type.
    #[serde(default)]
    pub job_name: Option<String>,
    /// Serialized job state for enqueued records.
    #[serde(default)]
    pub data: String,
    /// Do not fire before this time.
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    /// Repeat interval in seconds, measured from the latest queue date.
    pub interval_secs: u64,
}

impl ScheduleDefinition {
    fn is_due(&self, now: DateTime<Utc>, latest_queue_date: Option<DateTime<Utc>>) -> bool {
        if let Some(start) = self.start_date {
            if now < start {
                return false;
            }
        }
        match latest_queue_date {
            None => true,
            Some(latest) => now >= latest + ChronoDuration::seconds(self.interval_secs as i64),
        }
    }
}

/// Expands schedule definitions into queued records.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    definitions: Vec<ScheduleDefinition>,
}

impl Scheduler {
    pub fn new(definitions: Vec<ScheduleDefinition>) -> Self {
        Self { definitions }
    }

    pub fn definitions(&self) -> &[ScheduleDefinition] {
        &self.definitions
    }

    /// Enqueue a record for every definition that is due, returning the
    /// created records. Call this on the host's own cadence.
    pub async fn tick<S>(&self, store: &S) -> Result<Vec<JobRecord>, JobStoreError>
    where
        S: JobStore + ?Sized,
    {
        if self.definitions.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = self.definitions.iter().map(|d| d.name.clone()).collect();
        let latest = store.get_latest_scheduled_jobs(&names).await?;

        let now = Utc::now();
        let mut created = Vec::new();
        for definition in &self.definitions {
            let latest_queue_date = latest
                .iter()
                .find(|record| {
                    record.job_type == definition.job_type
                        && record.schedule_name.as_deref() == Some(definition.name.as_str())
                })
                .map(|record| record.queue_date);
            if !definition.is_due(now, latest_queue_date) {
                debug!(schedule = %definition.name, "schedule not due");
                continue;
            }

            let mut record = JobRecord::queued(
                definition
                    .job_name
                    .clone()
                    .unwrap_or_else(|| definition.job_type.clone()),
                definition.job_type.clone(),
                definition.data.clone(),
                now,
                Some(definition.name.clone()),
            );
            store.save_job(&mut record).await?;
            info!(
                schedule = %definition.name,
                job_type = %definition.job_type,
                job_id = ?record.id,
                "scheduled job enqueued"
            );
            created.push(record);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    use taskmill_core::JobStatus;
    use taskmill_store::{InMemoryJobStore, JobStore};

    fn definition(name: &str, interval_secs: u64) -> ScheduleDefinition {
        ScheduleDefinition {
            name: name.to_string(),
            job_type: "sync".to_string(),
            job_name: None,
            data: String::new(),
            start_date: None,
            interval_secs,
        }
    }

    #[tokio::test]
    async fn first_tick_enqueues_and_second_does_not() {
        let store = InMemoryJobStore::new();
        let scheduler = Scheduler::new(vec![definition("hourly", 3_600)]);

        let created = scheduler.tick(&store).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].schedule_name.as_deref(), Some("hourly"));
        assert_eq!(created[0].status, JobStatus::Queued);

        let created = scheduler.tick(&store).await.unwrap();
        assert!(created.is_empty(), "interval has not elapsed");
    }

    #[tokio::test]
    async fn elapsed_interval_fires_again() {
        let store = InMemoryJobStore::new();
        let scheduler = Scheduler::new(vec![definition("hourly", 3_600)]);

        let mut first = scheduler.tick(&store).await.unwrap().pop().unwrap();
        first.queue_date = Utc::now() - ChronoDuration::hours(2);
        store.save_job(&mut first).await.unwrap();

        let created = scheduler.tick(&store).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_ne!(created[0].id, first.id);
        assert_eq!(created[0].schedule_name, first.schedule_name);
    }

    #[tokio::test]
    async fn future_start_date_suppresses_firing() {
        let store = InMemoryJobStore::new();
        let mut def = definition("later", 60);
        def.start_date = Some(Utc::now() + ChronoDuration::hours(1));
        let scheduler = Scheduler::new(vec![def]);

        let created = scheduler.tick(&store).await.unwrap();
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn lineages_are_tracked_per_type_and_schedule() {
        let store = InMemoryJobStore::new();
        let mut purge = definition("hourly", 3_600);
        purge.job_type = "purge".to_string();
        let scheduler = Scheduler::new(vec![definition("hourly", 3_600), purge]);

        let created = scheduler.tick(&store).await.unwrap();
        assert_eq!(created.len(), 2, "one record per (type, schedule) lineage");

        let created = scheduler.tick(&store).await.unwrap();
        assert!(created.is_empty());
    }
}
