//! Job registry: the only shared mutable state between jobs.
//!
//! All mutation goes through one mutex-guarded map. A job's terminal result
//! lives in its entry; reading a terminal result removes the entry under the
//! same lock, so exactly one poller ever observes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use ctbackup_core::CorrelationId;

use super::types::{BackupJob, JobOutcome, JobStatus};
use crate::clock::Clock;

/// Default retention window before forced eviction.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(120 * 60);

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job already exists: {0}")]
    AlreadyExists(CorrelationId),
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub processing: usize,
    pub finished: usize,
}

#[derive(Debug)]
struct Entry {
    job: Arc<BackupJob>,
    result: Option<JobOutcome>,
}

/// In-memory registry of live jobs.
pub struct JobRegistry {
    jobs: Mutex<HashMap<CorrelationId, Entry>>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("retention", &self.retention)
            .field("len", &self.len())
            .finish()
    }
}

impl JobRegistry {
    pub fn new(clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            clock,
            retention,
        }
    }

    pub fn arc(clock: Arc<dyn Clock>, retention: Duration) -> Arc<Self> {
        Arc::new(Self::new(clock, retention))
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Register an accepted job. Does not start it.
    pub fn add(&self, job: BackupJob) -> Result<Arc<BackupJob>, RegistryError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::AlreadyExists(job.id));
        }

        let job = Arc::new(job);
        jobs.insert(
            job.id.clone(),
            Entry {
                job: job.clone(),
                result: None,
            },
        );
        debug!(job_id = %job.id, container = %job.source, "job registered");
        Ok(job)
    }

    /// Observe a job. A terminal result is handed out once and the entry is
    /// removed in the same critical section.
    pub fn get(&self, id: &CorrelationId) -> JobStatus {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(id).map(|e| e.result.is_some()) {
            None => JobStatus::NotFound,
            Some(false) => JobStatus::Processing,
            Some(true) => match jobs.remove(id).and_then(|e| e.result) {
                Some(outcome) => {
                    debug!(job_id = %id, ?outcome, "terminal result consumed");
                    JobStatus::Finished(outcome)
                }
                None => JobStatus::NotFound,
            },
        }
    }

    /// Record a job's terminal result.
    ///
    /// Returns `false` if the job is no longer tracked (evicted) or already
    /// has a result; the first write wins.
    pub fn complete(&self, id: &CorrelationId, outcome: JobOutcome) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(id) {
            Some(entry) if entry.result.is_none() => {
                entry.result = Some(outcome);
                true
            }
            Some(_) => {
                warn!(job_id = %id, "terminal result already recorded; ignoring");
                false
            }
            None => {
                warn!(job_id = %id, ?outcome, "job no longer tracked; result dropped");
                false
            }
        }
    }

    /// Remove a job; no-op if absent.
    pub fn delete(&self, id: &CorrelationId) {
        if self.jobs.lock().unwrap().remove(id).is_some() {
            debug!(job_id = %id, "job deleted");
        }
    }

    /// Point-in-time snapshot of tracked ids, sorted.
    pub fn keys(&self) -> Vec<CorrelationId> {
        let mut keys: Vec<_> = self.jobs.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Force-delete every job older than the retention window, finished or not.
    /// Returns the evicted ids.
    pub fn prune(&self) -> Vec<CorrelationId> {
        let now = self.clock.now();
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);

        let mut jobs = self.jobs.lock().unwrap();
        let expired: Vec<CorrelationId> = jobs
            .iter()
            .filter(|(_, e)| now - e.job.created_at > retention)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = jobs.remove(id) {
                debug!(
                    job_id = %id,
                    clone = %entry.job.clone_name,
                    finished = entry.result.is_some(),
                    "evicting expired job"
                );
            }
        }

        expired
    }

    pub fn stats(&self) -> RegistryStats {
        let jobs = self.jobs.lock().unwrap();
        let finished = jobs.values().filter(|e| e.result.is_some()).count();
        RegistryStats {
            processing: jobs.len() - finished,
            finished,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
