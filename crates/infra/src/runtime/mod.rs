//! Container-runtime collaborator.
//!
//! The pipeline only talks to the runtime through [`ContainerRuntime`]. Every
//! mutating call returns an [`Operation`] handle that must be waited on; the
//! call itself only means the runtime accepted the request.
//!
//! ## Implementations
//!
//! - [`LxdRuntime`]: LXD REST API over the local unix socket or HTTPS
//! - [`InMemoryRuntime`]: recording test double for tests/dev

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod in_memory;
pub mod lxd;

pub use in_memory::{InMemoryRuntime, RuntimeCalls, RuntimeStep};
pub use lxd::{LxdConfig, LxdEndpoint, LxdRuntime};

/// Runtime call error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("runtime returned {code}: {message}")]
    Api { code: u16, message: String },

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("command exited with status {0}")]
    NonZeroExit(i64),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Settings of an existing instance, as needed to create a copy of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub ephemeral: bool,
}

/// How a copy is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneOptions {
    /// Copy while running (memory state migration).
    pub live: bool,
    /// Skip snapshots.
    pub instance_only: bool,
}

impl CloneOptions {
    /// Cold (stateless), snapshot-free copy.
    pub fn cold_single_instance() -> Self {
        Self {
            live: false,
            instance_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateAction {
    Start,
    Stop,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateAction::Start => "start",
            StateAction::Stop => "stop",
        }
    }
}

/// Requested power-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub action: StateAction,
    pub timeout: Duration,
    pub force: bool,
    pub stateful: bool,
}

impl StateChange {
    pub fn start(timeout: Duration) -> Self {
        Self {
            action: StateAction::Start,
            timeout,
            force: false,
            stateful: false,
        }
    }

    pub fn force_stop(timeout: Duration) -> Self {
        Self {
            action: StateAction::Stop,
            timeout,
            force: true,
            stateful: false,
        }
    }
}

/// Receiver for a command's output stream.
pub trait OutputSink: Send + Sync {
    fn write(&self, chunk: &[u8]);
}

/// In-memory capture of an output stream.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for CaptureBuffer {
    fn write(&self, chunk: &[u8]) {
        self.inner.lock().unwrap().extend_from_slice(chunk);
    }
}

/// Forwards output to the log, one event per line.
///
/// A line split across chunks is held back until its newline arrives; a
/// trailing unterminated line is logged when the sink is dropped.
#[derive(Debug)]
pub struct LogSink {
    stream: &'static str,
    instance: String,
    partial: Mutex<Vec<u8>>,
}

impl LogSink {
    pub fn stderr(instance: impl Into<String>) -> Self {
        Self {
            stream: "stderr",
            instance: instance.into(),
            partial: Mutex::new(Vec::new()),
        }
    }

    /// Complete, non-blank lines ending in `chunk`, including any held-back prefix.
    fn complete_lines(&self, chunk: &[u8]) -> Vec<String> {
        let mut partial = self.partial.lock().unwrap();
        partial.extend_from_slice(chunk);

        let Some(end) = partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = partial.drain(..=end).collect();
        non_blank_lines(&complete)
    }

    fn log(&self, line: &str) {
        warn!(instance = %self.instance, stream = self.stream, "{line}");
    }
}

fn non_blank_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

impl OutputSink for LogSink {
    fn write(&self, chunk: &[u8]) {
        for line in self.complete_lines(chunk) {
            self.log(&line);
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let rest = std::mem::take(self.partial.get_mut().unwrap_or_else(|e| e.into_inner()));
        for line in non_blank_lines(&rest) {
            self.log(&line);
        }
    }
}

/// Non-interactive command execution request.
#[derive(Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub stdin: Vec<u8>,
    pub stdout: Arc<dyn OutputSink>,
    pub stderr: Arc<dyn OutputSink>,
}

impl std::fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecRequest")
            .field("command", &self.command)
            .field("environment", &self.environment)
            .field("stdin_len", &self.stdin.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "file" => Some(FileKind::File),
            "directory" => Some(FileKind::Directory),
            "symlink" => Some(FileKind::Symlink),
            _ => None,
        }
    }
}

/// Chunked byte source.
#[async_trait::async_trait]
pub trait ByteStream: Send {
    /// Next chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RuntimeError>;
}

/// A file opened for reading inside an instance.
pub struct RemoteFile {
    pub kind: FileKind,
    pub mode: u32,
    pub body: Box<dyn ByteStream>,
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("kind", &self.kind)
            .field("mode", &format_args!("{:o}", self.mode))
            .finish_non_exhaustive()
    }
}

/// Handle to an accepted, possibly still running, runtime operation.
#[async_trait::async_trait]
pub trait Operation: Send {
    /// Block until the operation finished; `Err` if it failed.
    async fn wait(&mut self) -> Result<(), RuntimeError>;
}

/// Container-runtime API used by the backup pipeline.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look up an instance; `Ok(None)` if it does not exist.
    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, RuntimeError>;

    /// Create `dest_name` as a copy of `source`, using `source`'s settings
    /// (profiles, config, ephemeral flag) for the new instance.
    async fn clone_instance(
        &self,
        source: &Instance,
        dest_name: &str,
        options: &CloneOptions,
    ) -> Result<Box<dyn Operation>, RuntimeError>;

    async fn set_state(
        &self,
        name: &str,
        change: &StateChange,
    ) -> Result<Box<dyn Operation>, RuntimeError>;

    /// Run a command. The returned operation completes once the command exited
    /// and its output was delivered to the sinks; a non-zero exit status fails
    /// it with [`RuntimeError::NonZeroExit`].
    async fn exec(&self, name: &str, request: ExecRequest)
    -> Result<Box<dyn Operation>, RuntimeError>;

    async fn open_file(&self, name: &str, path: &str) -> Result<RemoteFile, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_buffer_accumulates_chunks() {
        let buf = CaptureBuffer::new();
        let sink: Arc<dyn OutputSink> = Arc::new(buf.clone());
        sink.write(b"/tmp/a\n");
        sink.write(b"/tmp/b\n");
        assert_eq!(buf.contents(), b"/tmp/a\n/tmp/b\n".to_vec());
        assert_eq!(buf.len(), 14);
    }

    #[test]
    fn log_sink_splits_on_newlines_across_chunks() {
        let sink = LogSink::stderr("db-backup-1");

        assert_eq!(sink.complete_lines(b"warning: first\n\nwarn"), vec!["warning: first"]);
        assert!(sink.complete_lines(b"ing: sec").is_empty());
        assert_eq!(
            sink.complete_lines(b"ond\r\n  \nthird\n"),
            vec!["warning: second", "third"]
        );
        assert!(sink.partial.lock().unwrap().is_empty());
    }

    #[test]
    fn log_sink_keeps_unterminated_tail_until_dropped() {
        let sink = LogSink::stderr("db-backup-1");
        sink.write(b"done\nno newline");
        assert_eq!(*sink.partial.lock().unwrap(), b"no newline".to_vec());
    }

    #[test]
    fn file_kind_parses_runtime_names() {
        assert_eq!(FileKind::parse("directory"), Some(FileKind::Directory));
        assert_eq!(FileKind::parse("file"), Some(FileKind::File));
        assert_eq!(FileKind::parse("socket"), None);
    }
}
