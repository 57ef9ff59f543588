//! Service wiring: registry, container runtime and pipeline settings shared by
//! every handler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use ctbackup_core::{CorrelationId, DomainError};
use ctbackup_infra::config::ServiceConfig;
use ctbackup_infra::jobs::{
    BackupJob, JobOutcome, JobRegistry, JobSpec, JobStatus, PipelineConfig, RegistryError,
    spawn_pipeline,
};
use ctbackup_infra::runtime::{ContainerRuntime, RuntimeError};

/// Why a backup request was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("container not found: {0}")]
    SourceNotFound(String),

    #[error("job id already in use: {0}")]
    Duplicate(CorrelationId),

    #[error("container lookup failed: {0}")]
    Runtime(RuntimeError),
}

impl From<RegistryError> for AcceptError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyExists(id) => AcceptError::Duplicate(id),
        }
    }
}

/// Result of a successful accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Running; poll with the id.
    Pending(CorrelationId),
    /// Finished inside the grace window; the result was consumed here.
    Finished(CorrelationId, JobOutcome),
}

pub struct AppServices {
    registry: Arc<JobRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    pipeline: PipelineConfig,
    default_destination: PathBuf,
    accept_grace: Duration,
}

impl AppServices {
    pub fn new(
        registry: Arc<JobRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            pipeline: config.pipeline,
            default_destination: config.default_destination.clone(),
            accept_grace: config.accept_grace,
        }
    }

    pub fn default_destination(&self) -> &std::path::Path {
        &self.default_destination
    }

    /// Validate, register and launch a job.
    pub async fn accept(&self, id: CorrelationId, spec: JobSpec) -> Result<Accepted, AcceptError> {
        spec.validate()?;

        let source = match self.runtime.get_instance(&spec.source).await {
            Ok(Some(instance)) => instance,
            Ok(None) | Err(RuntimeError::NotFound(_)) => {
                return Err(AcceptError::SourceNotFound(spec.source));
            }
            Err(e) => return Err(AcceptError::Runtime(e)),
        };

        let job = BackupJob::new(id, spec, self.registry.clock().now());
        let job = self.registry.add(job)?;
        info!(
            job_id = %job.id,
            container = %job.source,
            clone = %job.clone_name,
            "backup accepted"
        );

        let handle = spawn_pipeline(
            self.registry.clone(),
            self.runtime.clone(),
            job.clone(),
            source,
            self.pipeline,
        );

        if self.accept_grace.is_zero() {
            return Ok(Accepted::Pending(job.id.clone()));
        }

        match tokio::time::timeout(self.accept_grace, handle).await {
            Ok(_) => match self.registry.get(&job.id) {
                JobStatus::Finished(outcome) => {
                    debug!(job_id = %job.id, "finished inside grace window");
                    Ok(Accepted::Finished(job.id.clone(), outcome))
                }
                JobStatus::Processing | JobStatus::NotFound => {
                    Ok(Accepted::Pending(job.id.clone()))
                }
            },
            Err(_) => Ok(Accepted::Pending(job.id.clone())),
        }
    }

    /// Registry lookup; consumes a terminal result.
    pub fn poll(&self, id: &CorrelationId) -> JobStatus {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<CorrelationId> {
        self.registry.keys()
    }
}
