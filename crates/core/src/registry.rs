//! Job type registry: stable string key → factory.
//!
//! Replaces runtime type reflection: the host registers a factory per job
//! type at startup, and the runner materializes stored records through it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::job::Job;

type JobFactory = Box<dyn Fn(&str) -> anyhow::Result<Arc<dyn Job>> + Send + Sync>;

/// Maps the `job_type` string stored in a record to a factory that rebuilds
/// the runnable instance from the record's serialized data.
#[derive(Default)]
pub struct JobTypeRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a job type key. A later registration for the
    /// same key replaces the earlier one.
    pub fn register<F>(&mut self, job_type: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        self.factories.insert(job_type.into(), Box::new(factory));
    }

    /// Rebuild a runnable job from its stored type key and serialized data.
    pub fn materialize(&self, job_type: &str, data: &str) -> anyhow::Result<Arc<dyn Job>> {
        let factory = self
            .factories
            .get(job_type)
            .ok_or_else(|| anyhow::anyhow!("no job factory registered for type '{job_type}'"))?;
        factory(data)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl core::fmt::Debug for JobTypeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobTypeRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
