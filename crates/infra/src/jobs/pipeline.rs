//! Backup pipeline: one sequential state machine per job.
//!
//! `Created -> Cloning -> Starting -> Executing -> Collecting -> Retrieving ->
//! Stopping -> {Done, Failed}`. Every exit path after a successful clone goes
//! through the stop finalizer, and the job's result is recorded exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use ctbackup_core::{Manifest, exec_environment, merge_profiles, strip_volatile_keys};

use super::store::JobRegistry;
use super::types::{BackupJob, BackupState, JobOutcome};
use crate::runtime::{
    CaptureBuffer, CloneOptions, ContainerRuntime, ExecRequest, FileKind, Instance, LogSink,
    RemoteFile, RuntimeError, StateChange,
};

/// Extra time granted on top of a state change's own timeout before giving up
/// on the operation.
const STATE_CHANGE_SLACK: Duration = Duration::from_secs(5);

/// Pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("clone of {container} failed: {error}")]
    Clone {
        container: String,
        error: RuntimeError,
    },

    #[error("start of {clone} failed: {error}")]
    Start { clone: String, error: RuntimeError },

    #[error("command in {clone} failed: {error}")]
    Exec { clone: String, error: RuntimeError },

    #[error("destination {path} is unusable: {error}")]
    Destination { path: PathBuf, error: String },

    #[error("could not open {failed} of {total} remote path(s); first: {first}")]
    Retrieve {
        failed: usize,
        total: usize,
        first: String,
    },
}

/// A path that was not retrieved, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPath {
    pub path: String,
    pub reason: String,
}

/// Outcome of the retrieval step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalReport {
    /// Local files written.
    pub copied: Vec<PathBuf>,
    /// Per-file local failures; logged, never fatal.
    pub skipped: Vec<SkippedPath>,
    /// Remote open failures; any entry fails the job.
    pub open_failures: Vec<SkippedPath>,
}

impl RetrievalReport {
    fn into_result(self) -> Result<Self, PipelineError> {
        match self.open_failures.first() {
            None => Ok(self),
            Some(first) => Err(PipelineError::Retrieve {
                failed: self.open_failures.len(),
                total: self.copied.len() + self.skipped.len() + self.open_failures.len(),
                first: format!("{}: {}", first.path, first.reason),
            }),
        }
    }
}

/// Drives one job against the container runtime.
pub struct BackupPipeline {
    runtime: Arc<dyn ContainerRuntime>,
    job: Arc<BackupJob>,
    source: Instance,
    config: PipelineConfig,
    state: BackupState,
}

impl BackupPipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        job: Arc<BackupJob>,
        source: Instance,
        config: PipelineConfig,
    ) -> Self {
        Self {
            runtime,
            job,
            source,
            config,
            state: BackupState::Created,
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn transition(&mut self, next: BackupState) {
        debug!(job_id = %self.job.id, from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }

    /// Run the pipeline to a terminal state.
    pub async fn run(&mut self) -> Result<RetrievalReport, PipelineError> {
        self.transition(BackupState::Cloning);
        if let Err(e) = self.clone_source().await {
            error!(job_id = %self.job.id, error = %e, "clone failed");
            self.transition(BackupState::Failed);
            return Err(e);
        }

        let result = self.run_in_clone().await;

        self.transition(BackupState::Stopping);
        self.stop_clone().await;

        match &result {
            Ok(_) => self.transition(BackupState::Done),
            Err(_) => self.transition(BackupState::Failed),
        }
        result
    }

    /// Source settings shaped for the clone.
    fn clone_spec(&self) -> Instance {
        let mut spec = self.source.clone();
        spec.profiles = merge_profiles(&self.source.profiles, &self.job.profile_edits);
        spec.ephemeral = self.job.ephemeral;
        let removed = strip_volatile_keys(&mut spec.config);
        if !removed.is_empty() {
            debug!(job_id = %self.job.id, keys = ?removed, "volatile keys dropped from clone");
        }
        spec
    }

    async fn clone_source(&self) -> Result<(), PipelineError> {
        let spec = self.clone_spec();
        let options = CloneOptions::cold_single_instance();

        let wrap = |error| PipelineError::Clone {
            container: self.job.source.clone(),
            error,
        };
        let mut op = self
            .runtime
            .clone_instance(&spec, &self.job.clone_name, &options)
            .await
            .map_err(wrap)?;
        op.wait().await.map_err(wrap)
    }

    async fn run_in_clone(&mut self) -> Result<RetrievalReport, PipelineError> {
        self.transition(BackupState::Starting);
        let start = StateChange::start(self.config.start_timeout);
        self.change_state(&start)
            .await
            .map_err(|error| PipelineError::Start {
                clone: self.job.clone_name.clone(),
                error,
            })?;

        self.transition(BackupState::Executing);
        let output = self.execute().await.map_err(|error| PipelineError::Exec {
            clone: self.job.clone_name.clone(),
            error,
        })?;

        self.transition(BackupState::Collecting);
        let manifest = Manifest::from_output(&output);
        for rejected in &manifest.rejected {
            warn!(
                job_id = %self.job.id,
                line = rejected.line_no,
                content = %rejected.content,
                "skipping output line that is not an absolute path"
            );
        }
        if manifest.is_empty() {
            info!(job_id = %self.job.id, "command reported no files");
        }

        self.transition(BackupState::Retrieving);
        self.retrieve(&manifest.paths).await?.into_result()
    }

    async fn change_state(&self, change: &StateChange) -> Result<(), RuntimeError> {
        let limit = change.timeout + STATE_CHANGE_SLACK;
        let call = async {
            let mut op = self
                .runtime
                .set_state(&self.job.clone_name, change)
                .await?;
            op.wait().await
        };

        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| RuntimeError::Timeout(limit))?
    }

    /// Run the producer command; returns its captured stdout.
    async fn execute(&self) -> Result<Vec<u8>, RuntimeError> {
        let stdout = Arc::new(CaptureBuffer::new());
        let request = ExecRequest {
            command: self.job.command.clone(),
            environment: exec_environment(&self.job.environment),
            stdin: Vec::new(),
            stdout: stdout.clone(),
            stderr: Arc::new(LogSink::stderr(self.job.clone_name.clone())),
        };

        let mut op = self.runtime.exec(&self.job.clone_name, request).await?;
        op.wait().await?;

        debug!(job_id = %self.job.id, bytes = stdout.len(), "command finished");
        Ok(stdout.contents())
    }

    async fn retrieve(&self, paths: &[String]) -> Result<RetrievalReport, PipelineError> {
        let mut report = RetrievalReport::default();
        let dest = self.job.destination.as_path();
        if paths.is_empty() {
            return Ok(report);
        }

        if let Err(e) = tokio::fs::create_dir_all(dest).await {
            error!(
                job_id = %self.job.id,
                destination = %dest.display(),
                error = %e,
                "cannot create destination"
            );
            return Err(PipelineError::Destination {
                path: dest.to_path_buf(),
                error: e.to_string(),
            });
        }

        for path in paths {
            let Some(name) = Path::new(path).file_name() else {
                warn!(job_id = %self.job.id, %path, "path has no file name; skipping");
                report.skipped.push(SkippedPath {
                    path: path.clone(),
                    reason: "no file name".to_string(),
                });
                continue;
            };

            let remote = match self.open_remote(path).await {
                Ok(remote) => remote,
                Err(reason) => {
                    error!(
                        job_id = %self.job.id,
                        %path,
                        error = %reason,
                        "cannot open remote file"
                    );
                    report.open_failures.push(SkippedPath {
                        path: path.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let local = dest.join(name);
            match copy_to_local(remote, &local).await {
                Ok(bytes) => {
                    debug!(
                        job_id = %self.job.id,
                        %path,
                        local = %local.display(),
                        bytes,
                        "file retrieved"
                    );
                    report.copied.push(local);
                }
                Err(reason) => {
                    warn!(
                        job_id = %self.job.id,
                        %path,
                        local = %local.display(),
                        error = %reason,
                        "skipping file"
                    );
                    report.skipped.push(SkippedPath {
                        path: path.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            job_id = %self.job.id,
            copied = report.copied.len(),
            skipped = report.skipped.len(),
            failed = report.open_failures.len(),
            "retrieval finished"
        );
        Ok(report)
    }

    async fn open_remote(&self, path: &str) -> Result<RemoteFile, String> {
        let remote = self
            .runtime
            .open_file(&self.job.clone_name, path)
            .await
            .map_err(|e| e.to_string())?;

        match remote.kind {
            FileKind::File => Ok(remote),
            FileKind::Directory => Err("is a directory".to_string()),
            FileKind::Symlink => Err("is a symbolic link".to_string()),
        }
    }

    /// Best-effort forced stop; failures are logged only.
    async fn stop_clone(&self) {
        let stop = StateChange::force_stop(self.config.stop_timeout);
        if let Err(e) = self.change_state(&stop).await {
            error!(job_id = %self.job.id, clone = %self.job.clone_name, error = %e, "stop failed");
        }
    }
}

/// Write `remote` to a new local file; refuses to overwrite. A partially
/// written file is removed again.
async fn copy_to_local(mut remote: RemoteFile, local: &Path) -> Result<u64, String> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        let mode = remote.mode & 0o777;
        options.mode(if mode == 0 { 0o600 } else { mode });
    }

    let mut file = options
        .open(local)
        .await
        .map_err(|e| format!("create {}: {e}", local.display()))?;

    let copied = async {
        let mut written = 0u64;
        while let Some(chunk) = remote.body.next_chunk().await.map_err(|e| e.to_string())? {
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        Ok::<_, String>(written)
    }
    .await;

    if copied.is_err() {
        drop(file);
        let _ = tokio::fs::remove_file(local).await;
    }
    copied
}

/// Launch a job's pipeline on the tokio runtime.
///
/// The task records exactly one terminal result in the registry. If the job
/// was evicted meanwhile, the result is dropped.
pub fn spawn_pipeline(
    registry: Arc<JobRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    job: Arc<BackupJob>,
    source: Instance,
    config: PipelineConfig,
) -> JoinHandle<()> {
    let span = info_span!(
        "backup",
        job_id = %job.id,
        container = %job.source,
        clone = %job.clone_name,
    );

    tokio::spawn(
        async move {
            let mut pipeline = BackupPipeline::new(runtime, job.clone(), source, config);
            let outcome = match pipeline.run().await {
                Ok(report) => {
                    info!(files = report.copied.len(), "backup finished");
                    JobOutcome::Succeeded
                }
                Err(e) => {
                    warn!(error = %e, "backup failed");
                    JobOutcome::Failed(e.to_string())
                }
            };
            registry.complete(&job.id, outcome);
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::store::DEFAULT_RETENTION;
    use crate::jobs::types::{JobSpec, JobStatus};
    use crate::runtime::{InMemoryRuntime, RuntimeStep};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        runtime: Arc<InMemoryRuntime>,
        dest: TempDir,
    }

    fn source_instance() -> Instance {
        let config = [
            ("volatile.base_image", "img"),
            ("volatile.eth0.hwaddr", "00:16:3e:00:00:01"),
            ("limits.memory", "1GB"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Instance {
            name: "db".to_string(),
            architecture: Some("x86_64".to_string()),
            profiles: vec!["default".to_string(), "net".to_string()],
            config,
            devices: BTreeMap::new(),
            ephemeral: false,
        }
    }

    fn fixture() -> Fixture {
        let runtime = InMemoryRuntime::arc();
        runtime.add_instance(source_instance());
        runtime.add_file("db", "/backup/dump.sql", b"CREATE TABLE t;".to_vec());
        runtime.add_file("db", "/backup/meta.json", b"{}".to_vec());
        runtime.set_exec_output("/backup/dump.sql\n/backup/meta.json\n");
        Fixture {
            runtime,
            dest: TempDir::new().unwrap(),
        }
    }

    fn job(fx: &Fixture) -> Arc<BackupJob> {
        job_with(fx, |_| {})
    }

    fn job_with(fx: &Fixture, edit: impl FnOnce(&mut JobSpec)) -> Arc<BackupJob> {
        let mut spec = JobSpec {
            source: "db".to_string(),
            ephemeral: true,
            profile_edits: vec!["-net".to_string(), "backup".to_string()],
            command: vec!["/usr/local/bin/dump".to_string()],
            environment: [("USER".to_string(), "postgres".to_string())].into(),
            destination: fx.dest.path().to_path_buf(),
        };
        edit(&mut spec);
        Arc::new(BackupJob::new(
            "job1".parse().unwrap(),
            spec,
            chrono::Utc::now(),
        ))
    }

    async fn run(fx: &Fixture) -> (BackupPipeline, Result<RetrievalReport, PipelineError>) {
        run_job(fx, job(fx)).await
    }

    async fn run_job(
        fx: &Fixture,
        job: Arc<BackupJob>,
    ) -> (BackupPipeline, Result<RetrievalReport, PipelineError>) {
        let mut pipeline = BackupPipeline::new(
            fx.runtime.clone(),
            job,
            source_instance(),
            PipelineConfig::default(),
        );
        let result = pipeline.run().await;
        (pipeline, result)
    }

    #[tokio::test]
    async fn successful_backup_copies_files_and_stops_clone_once() {
        let fx = fixture();
        let (pipeline, result) = run(&fx).await;

        let report = result.unwrap();
        assert_eq!(pipeline.state(), BackupState::Done);
        assert_eq!(report.copied.len(), 2);
        assert_eq!(
            std::fs::read(fx.dest.path().join("dump.sql")).unwrap(),
            b"CREATE TABLE t;"
        );

        assert_eq!(fx.runtime.stopped(), vec!["db-backup-job1".to_string()]);
        // Ephemeral clones vanish when stopped.
        assert!(!fx.runtime.instance_exists("db-backup-job1"));
    }

    #[tokio::test]
    async fn clone_is_shaped_from_source_and_job() {
        let fx = fixture();
        run(&fx).await.1.unwrap();

        let clones = fx.runtime.clones();
        assert_eq!(clones.len(), 1);
        let clone = &clones[0];
        assert_eq!(clone.dest_name, "db-backup-job1");
        assert_eq!(clone.options, CloneOptions::cold_single_instance());
        assert_eq!(clone.spec.profiles, vec!["default", "backup"]);
        assert!(clone.spec.ephemeral);
        assert_eq!(
            clone.spec.config.keys().collect::<Vec<_>>(),
            vec!["limits.memory", "volatile.base_image"]
        );

        let execs = fx.runtime.execs();
        assert_eq!(execs[0].command, vec!["/usr/local/bin/dump"]);
        assert_eq!(execs[0].environment["USER"], "postgres");
        assert_eq!(execs[0].environment["HOME"], "/root");
        assert!(execs[0].stdin.is_empty());
    }

    #[tokio::test]
    async fn clone_failure_fails_without_stop() {
        let fx = fixture();
        fx.runtime.fail_on(RuntimeStep::Clone);

        let (pipeline, result) = run(&fx).await;

        assert!(matches!(result, Err(PipelineError::Clone { .. })));
        assert_eq!(pipeline.state(), BackupState::Failed);
        assert_eq!(fx.runtime.calls().start, 0);
        assert_eq!(fx.runtime.calls().stop, 0);
    }

    #[tokio::test]
    async fn start_failure_still_stops_clone() {
        let fx = fixture();
        fx.runtime.fail_on(RuntimeStep::Start);

        let (_, result) = run(&fx).await;

        assert!(matches!(result, Err(PipelineError::Start { .. })));
        assert_eq!(fx.runtime.calls().exec, 0);
        assert_eq!(fx.runtime.calls().stop, 1);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_job_and_stops_clone() {
        let fx = fixture();
        fx.runtime.set_exec_exit_code(3);

        let (_, result) = run(&fx).await;

        assert_eq!(
            result,
            Err(PipelineError::Exec {
                clone: "db-backup-job1".to_string(),
                error: RuntimeError::NonZeroExit(3),
            })
        );
        assert_eq!(fx.runtime.calls().open_file, 0);
        assert_eq!(fx.runtime.calls().stop, 1);
    }

    #[tokio::test]
    async fn invalid_output_lines_are_not_fatal() {
        let fx = fixture();
        fx.runtime
            .set_exec_output("\n/backup/dump.sql\n   \nrelative/path\n");

        let (_, result) = run(&fx).await;

        assert_eq!(result.unwrap().copied.len(), 1);
        assert_eq!(fx.runtime.calls().open_file, 1);
    }

    #[tokio::test]
    async fn empty_manifest_is_not_an_error() {
        let fx = fixture();
        fx.runtime.set_exec_output("");

        let (pipeline, result) = run(&fx).await;

        assert_eq!(result.unwrap(), RetrievalReport::default());
        assert_eq!(pipeline.state(), BackupState::Done);
        assert_eq!(fx.runtime.calls().stop, 1);
    }

    #[tokio::test]
    async fn local_create_failure_is_skipped() {
        let fx = fixture();
        std::fs::write(fx.dest.path().join("dump.sql"), b"existing").unwrap();

        let (pipeline, result) = run(&fx).await;

        let report = result.unwrap();
        assert_eq!(pipeline.state(), BackupState::Done);
        assert_eq!(report.copied, vec![fx.dest.path().join("meta.json")]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, "/backup/dump.sql");
        // Never overwritten.
        assert_eq!(
            std::fs::read(fx.dest.path().join("dump.sql")).unwrap(),
            b"existing"
        );
    }

    #[tokio::test]
    async fn transfer_failure_removes_partial_file() {
        let fx = fixture();
        fx.runtime.fail_read("/backup/dump.sql");

        let (_, result) = run(&fx).await;

        let report = result.unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert!(!fx.dest.path().join("dump.sql").exists());
        assert!(fx.dest.path().join("meta.json").exists());
    }

    #[tokio::test]
    async fn remote_open_failure_fails_job_after_trying_every_path() {
        let fx = fixture();
        fx.runtime.fail_open("/backup/dump.sql");

        let (pipeline, result) = run(&fx).await;

        match result {
            Err(PipelineError::Retrieve { failed, total, .. }) => {
                assert_eq!((failed, total), (1, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(pipeline.state(), BackupState::Failed);
        assert!(fx.dest.path().join("meta.json").exists());
        assert_eq!(fx.runtime.calls().stop, 1);
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let fx = fixture();
        fx.runtime.add_directory("db", "/backup");
        fx.runtime.set_exec_output("/backup\n");

        let (_, result) = run(&fx).await;

        assert!(matches!(result, Err(PipelineError::Retrieve { failed: 1, .. })));
        assert_eq!(fx.runtime.calls().stop, 1);
    }

    #[tokio::test]
    async fn stderr_output_does_not_fail_the_job() {
        let fx = fixture();
        fx.runtime
            .set_exec_stderr("pg_dump: warning: table t has no primary key\npg_dump: done\n");

        let (pipeline, result) = run(&fx).await;

        assert_eq!(result.unwrap().copied.len(), 2);
        assert_eq!(pipeline.state(), BackupState::Done);
        assert_eq!(fx.runtime.execs().len(), 1);
    }

    #[tokio::test]
    async fn persistent_clone_is_stopped_but_kept() {
        let fx = fixture();
        let job = job_with(&fx, |spec| spec.ephemeral = false);

        let (pipeline, result) = run_job(&fx, job).await;

        assert!(result.is_ok());
        assert_eq!(pipeline.state(), BackupState::Done);
        assert!(fx.runtime.instance_exists("db-backup-job1"));
        assert!(!fx.runtime.is_running("db-backup-job1"));
        assert!(!fx.runtime.clones()[0].spec.ephemeral);
    }

    #[tokio::test]
    async fn unusable_destination_fails_job_and_stops_clone() {
        let fx = fixture();
        let blocker = fx.dest.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let job = job_with(&fx, |spec| spec.destination = blocker.join("out"));

        let (pipeline, result) = run_job(&fx, job).await;

        match result {
            Err(PipelineError::Destination { path, .. }) => {
                assert_eq!(path, blocker.join("out"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(pipeline.state(), BackupState::Failed);
        assert_eq!(fx.runtime.calls().open_file, 0);
        assert_eq!(fx.runtime.calls().stop, 1);
    }

    #[tokio::test]
    async fn stop_failure_does_not_overturn_success() {
        let fx = fixture();
        fx.runtime.fail_on(RuntimeStep::Stop);

        let (pipeline, result) = run(&fx).await;

        assert!(result.is_ok());
        assert_eq!(pipeline.state(), BackupState::Done);
        assert_eq!(fx.runtime.calls().stop, 1);
    }

    #[tokio::test]
    async fn spawned_pipeline_records_one_result() {
        let fx = fixture();
        let registry = JobRegistry::arc(Arc::new(ManualClock::default()), DEFAULT_RETENTION);
        let job = registry.add((*job(&fx)).clone()).unwrap();

        spawn_pipeline(
            registry.clone(),
            fx.runtime.clone(),
            job.clone(),
            source_instance(),
            PipelineConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            registry.get(&job.id),
            JobStatus::Finished(JobOutcome::Succeeded)
        );
        assert_eq!(registry.get(&job.id), JobStatus::NotFound);
    }

    #[tokio::test]
    async fn spawned_pipeline_reports_failure_detail() {
        let fx = fixture();
        fx.runtime.fail_on(RuntimeStep::Exec);
        let registry = JobRegistry::arc(Arc::new(ManualClock::default()), DEFAULT_RETENTION);
        let job = registry.add((*job(&fx)).clone()).unwrap();

        spawn_pipeline(
            registry.clone(),
            fx.runtime.clone(),
            job.clone(),
            source_instance(),
            PipelineConfig::default(),
        )
        .await
        .unwrap();

        match registry.get(&job.id) {
            JobStatus::Finished(JobOutcome::Failed(detail)) => {
                assert!(detail.contains("db-backup-job1"), "{detail}");
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(fx.runtime.calls().stop, 1);
    }
}
