//! Explicit registry of runners, one per store configuration.
//!
//! Constructed once at application startup and passed to whoever needs a
//! runner; keyed by the store's type key so isolated test/prod runners can
//! coexist in one process without a global singleton.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use taskmill_core::JobTypeRegistry;
use taskmill_store::JobStore;

use crate::config::RunnerConfig;
use crate::runner::{JobRunner, RunnerError};

#[derive(Default)]
pub struct RunnerRegistry {
    runners: Mutex<HashMap<String, Arc<JobRunner>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the runner for a store configuration, creating it on first use.
    pub fn runner_for(
        &self,
        store: Arc<dyn JobStore>,
        types: Arc<JobTypeRegistry>,
        config: RunnerConfig,
    ) -> Result<Arc<JobRunner>, RunnerError> {
        let key = store.type_key();
        let mut runners = self.runners.lock().unwrap();
        if let Some(runner) = runners.get(&key) {
            return Ok(runner.clone());
        }
        let runner = Arc::new(JobRunner::new(store, types, config)?);
        runners.insert(key, runner.clone());
        Ok(runner)
    }

    pub fn get(&self, type_key: &str) -> Option<Arc<JobRunner>> {
        self.runners.lock().unwrap().get(type_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.runners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.lock().unwrap().is_empty()
    }

    /// Stop every registered runner.
    pub async fn stop_all(&self, safely: bool) {
        let runners: Vec<Arc<JobRunner>> =
            self.runners.lock().unwrap().values().cloned().collect();
        for runner in runners {
            runner.stop(safely).await;
        }
    }
}
