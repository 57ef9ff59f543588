//! Core job types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ctbackup_core::{
    CorrelationId, DomainError, DomainResult, clone_name, validate_instance_name,
};

/// Validated description of a backup request.
///
/// Built by the request façade from the wire body; pipeline-only fields
/// (clone name, timestamps, results) are never part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Source container to clone.
    pub source: String,
    /// Ephemeral flag forced onto the clone.
    pub ephemeral: bool,
    /// Tri-state profile edits (`-`, `-name`, `name`).
    pub profile_edits: Vec<String>,
    /// Producer command argument vector.
    pub command: Vec<String>,
    /// Environment overrides for the producer command.
    pub environment: BTreeMap<String, String>,
    /// Local directory receiving the retrieved files.
    pub destination: PathBuf,
}

impl JobSpec {
    pub fn validate(&self) -> DomainResult<()> {
        validate_instance_name(&self.source)?;
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(DomainError::validation("command must not be empty"));
        }
        if !self.destination.is_absolute() {
            return Err(DomainError::validation(format!(
                "destination must be an absolute path, got {}",
                self.destination.display()
            )));
        }
        if self.environment.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(DomainError::validation(
                "environment keys must be non-empty and must not contain '='",
            ));
        }
        Ok(())
    }
}

/// One accepted backup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub id: CorrelationId,
    pub source: String,
    /// Derived from source + id; unique among live jobs.
    pub clone_name: String,
    pub ephemeral: bool,
    pub profile_edits: Vec<String>,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub destination: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl BackupJob {
    pub fn new(id: CorrelationId, spec: JobSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            clone_name: clone_name(&spec.source, &id),
            id,
            source: spec.source,
            ephemeral: spec.ephemeral,
            profile_edits: spec.profile_edits,
            command: spec.command,
            environment: spec.environment,
            destination: spec.destination,
            created_at,
        }
    }
}

/// Terminal result of a job, written once by its pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

/// What a poll observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Never registered, already consumed, or evicted.
    NotFound,
    /// Still in flight.
    Processing,
    /// Terminal; returned to exactly one observer.
    Finished(JobOutcome),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished(_))
    }
}

/// Pipeline stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Created,
    Cloning,
    Starting,
    Executing,
    Collecting,
    Retrieving,
    Stopping,
    Done,
    Failed,
}

impl BackupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupState::Done | BackupState::Failed)
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupState::Created => "created",
            BackupState::Cloning => "cloning",
            BackupState::Starting => "starting",
            BackupState::Executing => "executing",
            BackupState::Collecting => "collecting",
            BackupState::Retrieving => "retrieving",
            BackupState::Stopping => "stopping",
            BackupState::Done => "done",
            BackupState::Failed => "failed",
        };
        f.write_str(s)
    }
}
