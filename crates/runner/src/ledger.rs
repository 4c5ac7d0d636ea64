//! Disk-backed registry of active job runs.
//!
//! The ledger is the crash-recovery mechanism: every flush writes the full
//! current run set to one file per store configuration, so a restarted
//! process can tell which jobs were in flight when the previous one died.
//! Entries found on load are marked recovered — a process that shut down
//! cleanly leaves an empty run set behind — and the runner reconciles them
//! against the store on its next passes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use taskmill_core::JobId;

use crate::run::{JobRun, RunSnapshot};

/// Ledger persistence error. Read-side problems never surface here —
/// loading tolerates an absent or corrupt file — only flush can fail.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Process-local registry of active runs, mirrored to a single file.
///
/// All mutation goes through one coarse lock; this path is not hot.
pub struct RunningJobs {
    path: PathBuf,
    runs: Mutex<HashMap<JobId, JobRun>>,
}

/// File name for a store's ledger: a stable hash of the store type key plus
/// a fixed extension, so distinct store configurations in the same directory
/// never cross-contaminate running-job state.
pub fn ledger_file_name(type_key: &str) -> String {
    let digest = Sha256::digest(type_key.as_bytes());
    let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{hash}.runledger.json")
}

impl RunningJobs {
    /// Open the ledger for a store configuration, loading any pre-existing
    /// file. Entries loaded from disk are marked recovered and get a finish
    /// date if they lacked one; a corrupt file is reported and treated as
    /// empty. Never fails startup.
    pub fn open(dir: impl AsRef<Path>, type_key: &str) -> Self {
        let path = dir.as_ref().join(ledger_file_name(type_key));
        let runs = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<RunSnapshot>>(&contents) {
                Ok(snapshots) => {
                    let count = snapshots.len();
                    if count > 0 {
                        warn!(path = %path.display(), count, "recovered in-flight runs from ledger");
                    }
                    snapshots
                        .into_iter()
                        .map(|snapshot| (snapshot.job_id, JobRun::from_snapshot(snapshot)))
                        .collect()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt ledger file, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable ledger file, starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            runs: Mutex::new(runs),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a run. An existing entry with the same job id is replaced —
    /// that is how a stale recovered entry is superseded when its record is
    /// re-dequeued.
    pub fn add(&self, run: JobRun) {
        self.runs.lock().unwrap().insert(run.job_id(), run);
    }

    /// Deregister by job id.
    pub fn remove(&self, job_id: JobId) {
        self.runs.lock().unwrap().remove(&job_id);
    }

    pub fn get(&self, job_id: JobId) -> Option<JobRun> {
        self.runs.lock().unwrap().get(&job_id).cloned()
    }

    /// Snapshot of runs currently executing.
    pub fn get_running(&self) -> Vec<JobRun> {
        self.runs
            .lock()
            .unwrap()
            .values()
            .filter(|run| run.is_running())
            .cloned()
            .collect()
    }

    /// Snapshot of runs that are registered but no longer executing.
    pub fn get_not_running(&self) -> Vec<JobRun> {
        self.runs
            .lock()
            .unwrap()
            .values()
            .filter(|run| !run.is_running())
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.runs
            .lock()
            .unwrap()
            .values()
            .filter(|run| run.is_running())
            .count()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().unwrap().is_empty()
    }

    /// Persist the full current run set, replacing the file atomically:
    /// the snapshot is written to a sibling temp file first and renamed over
    /// the target, so a crash mid-flush never leaves a half-written ledger.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let snapshots: Vec<RunSnapshot> = self
            .runs
            .lock()
            .unwrap()
            .values()
            .map(JobRun::snapshot)
            .collect();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&snapshots)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), count = snapshots.len(), "ledger flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use taskmill_core::Job;
    use tempfile::TempDir;

    struct Idle;

    #[async_trait]
    impl Job for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn serialize(&self) -> anyhow::Result<String> {
            Ok(String::new())
        }

        async fn execute(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test]
    fn distinct_type_keys_map_to_distinct_files() {
        let memory = ledger_file_name("memory");
        let sqlite = ledger_file_name("sqlite:/var/lib/jobs.db");
        assert_ne!(memory, sqlite);
        assert!(memory.ends_with(".runledger.json"));
        assert_eq!(memory, ledger_file_name("memory"));
    }

    #[tokio::test]
    async fn round_trip_marks_entries_recovered() {
        let dir = TempDir::new().unwrap();

        let ledger = RunningJobs::open(dir.path(), "memory");
        let first = JobRun::new(JobId(1), Arc::new(Idle));
        first.start();
        let second = JobRun::new(JobId(2), Arc::new(Idle));
        second.start();
        ledger.add(first.clone());
        ledger.add(second.clone());
        ledger.flush().unwrap();
        first.abort();
        second.abort();

        let reloaded = RunningJobs::open(dir.path(), "memory");
        assert_eq!(reloaded.len(), 2);
        for run in reloaded.get_not_running() {
            assert!(run.was_recovered());
            assert!(run.finish_date().is_some(), "finish date is back-filled");
        }
        assert_eq!(reloaded.running_count(), 0);
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = RunningJobs::open(dir.path(), "memory");
        assert!(ledger.is_empty());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ledger_file_name("memory"));
        fs::write(&path, "{ not json").unwrap();

        let ledger = RunningJobs::open(dir.path(), "memory");
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn flush_overwrites_previous_contents() {
        let dir = TempDir::new().unwrap();
        let ledger = RunningJobs::open(dir.path(), "memory");

        let run = JobRun::new(JobId(7), Arc::new(Idle));
        ledger.add(run.clone());
        ledger.flush().unwrap();

        ledger.remove(JobId(7));
        ledger.flush().unwrap();

        let reloaded = RunningJobs::open(dir.path(), "memory");
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn add_replaces_entry_with_same_job_id() {
        let dir = TempDir::new().unwrap();
        let ledger = RunningJobs::open(dir.path(), "memory");

        let stale = JobRun::from_snapshot(RunSnapshot {
            job_id: JobId(9),
            is_running: false,
            start_date: None,
            finish_date: None,
            execution_error: None,
            was_recovered: true,
        });
        ledger.add(stale);

        let fresh = JobRun::new(JobId(9), Arc::new(Idle));
        fresh.start();
        ledger.add(fresh);

        assert_eq!(ledger.len(), 1);
        assert!(ledger.get(JobId(9)).unwrap().is_running());
        ledger.get(JobId(9)).unwrap().abort();
    }
}
