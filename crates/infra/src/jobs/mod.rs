//! Backup jobs: types, the in-memory registry and the per-job pipeline.
//!
//! ## Components
//!
//! - `BackupJob`: an accepted request plus its derived clone name
//! - `JobRegistry`: mutex-guarded map of live jobs with a write-once result cell
//! - `BackupPipeline`: clone, start, exec, collect, retrieve, stop
//! - `spawn_pipeline`: runs one pipeline on its own task and records the result

pub mod pipeline;
pub mod store;
pub mod types;

pub use pipeline::{
    BackupPipeline, PipelineConfig, PipelineError, RetrievalReport, SkippedPath, spawn_pipeline,
};
pub use store::{DEFAULT_RETENTION, JobRegistry, RegistryError, RegistryStats};
pub use types::{BackupJob, BackupState, JobOutcome, JobSpec, JobStatus};
