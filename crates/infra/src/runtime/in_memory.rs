//! In-memory container runtime for tests/dev.
//!
//! Keeps instances, their files and power state in a map, records every call
//! and can be told to fail any step. Ephemeral instances disappear on stop,
//! as they do on a real runtime.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::{
    ByteStream, CloneOptions, ContainerRuntime, ExecRequest, FileKind, Instance, Operation,
    RemoteFile, RuntimeError, StateAction, StateChange,
};

const CHUNK_SIZE: usize = 8 * 1024;

/// Runtime steps that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeStep {
    Clone,
    Start,
    Exec,
    Stop,
    OpenFile,
}

/// Number of calls received per runtime primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCalls {
    pub clone: usize,
    pub start: usize,
    pub exec: usize,
    pub stop: usize,
    pub open_file: usize,
}

/// A clone request as received by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedClone {
    pub spec: Instance,
    pub dest_name: String,
    pub options: CloneOptions,
}

/// An exec request as received by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExec {
    pub instance: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub stdin: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Entry {
    File { mode: u32, data: Vec<u8> },
    Directory,
}

#[derive(Debug, Default)]
struct State {
    instances: BTreeMap<String, Instance>,
    running: BTreeSet<String>,
    files: BTreeMap<String, BTreeMap<String, Entry>>,
    exec_stdout: Vec<u8>,
    exec_stderr: Vec<u8>,
    exec_exit: i64,
    failing: HashSet<RuntimeStep>,
    failing_paths: BTreeSet<String>,
    failing_reads: BTreeSet<String>,
    calls: RuntimeCalls,
    clones: Vec<RecordedClone>,
    execs: Vec<RecordedExec>,
    stopped: Vec<String>,
}

/// In-memory [`ContainerRuntime`].
#[derive(Debug)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
    exec_gate: watch::Sender<bool>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        let (exec_gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::default()),
            exec_gate,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register an existing (running) instance.
    pub fn add_instance(&self, instance: Instance) {
        let mut state = self.state.lock().unwrap();
        state.running.insert(instance.name.clone());
        state.files.entry(instance.name.clone()).or_default();
        state.instances.insert(instance.name.clone(), instance);
    }

    /// Place a regular file inside an instance; clones inherit it.
    pub fn add_file(&self, instance: &str, path: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.files.entry(instance.to_string()).or_default().insert(
            path.to_string(),
            Entry::File {
                mode: 0o640,
                data: data.into(),
            },
        );
    }

    pub fn add_directory(&self, instance: &str, path: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .entry(instance.to_string())
            .or_default()
            .insert(path.to_string(), Entry::Directory);
    }

    /// Standard output every exec produces.
    pub fn set_exec_output(&self, stdout: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().exec_stdout = stdout.into();
    }

    pub fn set_exec_stderr(&self, stderr: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().exec_stderr = stderr.into();
    }

    pub fn set_exec_exit_code(&self, code: i64) {
        self.state.lock().unwrap().exec_exit = code;
    }

    /// Make every operation of `step` fail.
    pub fn fail_on(&self, step: RuntimeStep) {
        self.state.lock().unwrap().failing.insert(step);
    }

    /// Make opening `path` fail.
    pub fn fail_open(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_paths
            .insert(path.to_string());
    }

    /// Make reading the contents of `path` fail after it was opened.
    pub fn fail_read(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_reads
            .insert(path.to_string());
    }

    /// Hold every exec operation until [`InMemoryRuntime::resume_exec`].
    pub fn pause_exec(&self) {
        self.exec_gate.send_replace(false);
    }

    pub fn resume_exec(&self) {
        self.exec_gate.send_replace(true);
    }

    pub fn calls(&self) -> RuntimeCalls {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clones(&self) -> Vec<RecordedClone> {
        self.state.lock().unwrap().clones.clone()
    }

    pub fn execs(&self) -> Vec<RecordedExec> {
        self.state.lock().unwrap().execs.clone()
    }

    /// Names passed to stop, in call order.
    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn instance_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().instances.contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().unwrap().running.contains(name)
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

struct Completed(Result<(), RuntimeError>);

#[async_trait::async_trait]
impl Operation for Completed {
    async fn wait(&mut self) -> Result<(), RuntimeError> {
        self.0.clone()
    }
}

struct PendingExec {
    gate: watch::Receiver<bool>,
    request: ExecRequest,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    result: Result<(), RuntimeError>,
}

#[async_trait::async_trait]
impl Operation for PendingExec {
    async fn wait(&mut self) -> Result<(), RuntimeError> {
        let _ = self.gate.wait_for(|open| *open).await;

        if !self.stdout.is_empty() {
            self.request.stdout.write(&self.stdout);
        }
        if !self.stderr.is_empty() {
            self.request.stderr.write(&self.stderr);
        }
        self.result.clone()
    }
}

struct Chunks {
    chunks: std::vec::IntoIter<Vec<u8>>,
    fail: bool,
}

#[async_trait::async_trait]
impl ByteStream for Chunks {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RuntimeError> {
        if self.fail {
            return Err(RuntimeError::Transport("connection reset".to_string()));
        }
        Ok(self.chunks.next())
    }
}

fn scripted_failure(step: RuntimeStep) -> RuntimeError {
    RuntimeError::OperationFailed(format!("{step:?} failed"))
}

#[async_trait::async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, RuntimeError> {
        Ok(self.state.lock().unwrap().instances.get(name).cloned())
    }

    async fn clone_instance(
        &self,
        source: &Instance,
        dest_name: &str,
        options: &CloneOptions,
    ) -> Result<Box<dyn Operation>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.clone += 1;
        state.clones.push(RecordedClone {
            spec: source.clone(),
            dest_name: dest_name.to_string(),
            options: *options,
        });

        if !state.instances.contains_key(&source.name) {
            return Err(RuntimeError::NotFound(source.name.clone()));
        }
        if state.instances.contains_key(dest_name) {
            return Err(RuntimeError::Api {
                code: 409,
                message: format!("instance {dest_name} already exists"),
            });
        }
        if state.failing.contains(&RuntimeStep::Clone) {
            return Ok(Box::new(Completed(Err(scripted_failure(RuntimeStep::Clone)))));
        }

        let mut copy = source.clone();
        copy.name = dest_name.to_string();
        let files = state.files.get(&source.name).cloned().unwrap_or_default();
        state.files.insert(dest_name.to_string(), files);
        state.instances.insert(dest_name.to_string(), copy);

        Ok(Box::new(Completed(Ok(()))))
    }

    async fn set_state(
        &self,
        name: &str,
        change: &StateChange,
    ) -> Result<Box<dyn Operation>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let step = match change.action {
            StateAction::Start => {
                state.calls.start += 1;
                RuntimeStep::Start
            }
            StateAction::Stop => {
                state.calls.stop += 1;
                state.stopped.push(name.to_string());
                RuntimeStep::Stop
            }
        };

        let Some(instance) = state.instances.get(name).cloned() else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };
        if state.failing.contains(&step) {
            return Ok(Box::new(Completed(Err(scripted_failure(step)))));
        }

        match change.action {
            StateAction::Start => {
                state.running.insert(name.to_string());
            }
            StateAction::Stop => {
                state.running.remove(name);
                if instance.ephemeral {
                    state.instances.remove(name);
                    state.files.remove(name);
                }
            }
        }

        Ok(Box::new(Completed(Ok(()))))
    }

    async fn exec(
        &self,
        name: &str,
        request: ExecRequest,
    ) -> Result<Box<dyn Operation>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.exec += 1;
        state.execs.push(RecordedExec {
            instance: name.to_string(),
            command: request.command.clone(),
            environment: request.environment.clone(),
            stdin: request.stdin.clone(),
        });

        if !state.instances.contains_key(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }

        let result = if state.failing.contains(&RuntimeStep::Exec) {
            Err(scripted_failure(RuntimeStep::Exec))
        } else if !state.running.contains(name) {
            Err(RuntimeError::OperationFailed(format!(
                "instance {name} is not running"
            )))
        } else if state.exec_exit != 0 {
            Err(RuntimeError::NonZeroExit(state.exec_exit))
        } else {
            Ok(())
        };

        Ok(Box::new(PendingExec {
            gate: self.exec_gate.subscribe(),
            request,
            stdout: state.exec_stdout.clone(),
            stderr: state.exec_stderr.clone(),
            result,
        }))
    }

    async fn open_file(&self, name: &str, path: &str) -> Result<RemoteFile, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.open_file += 1;

        if state.failing.contains(&RuntimeStep::OpenFile) || state.failing_paths.contains(path) {
            return Err(scripted_failure(RuntimeStep::OpenFile));
        }

        let entry = state
            .files
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::Api {
                code: 404,
                message: format!("{path}: no such file or directory"),
            })?;

        let fail = state.failing_reads.contains(path);
        let file = match entry {
            Entry::Directory => RemoteFile {
                kind: FileKind::Directory,
                mode: 0o755,
                body: Box::new(Chunks {
                    chunks: Vec::new().into_iter(),
                    fail: false,
                }),
            },
            Entry::File { mode, data } => RemoteFile {
                kind: FileKind::File,
                mode,
                body: Box::new(Chunks {
                    chunks: data
                        .chunks(CHUNK_SIZE)
                        .map(<[u8]>::to_vec)
                        .collect::<Vec<_>>()
                        .into_iter(),
                    fail,
                }),
            },
        };

        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CaptureBuffer;
    use std::time::Duration;

    fn source() -> Instance {
        Instance {
            name: "db".to_string(),
            profiles: vec!["default".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn clone_copies_files_and_ephemeral_clone_vanishes_on_stop() {
        let rt = InMemoryRuntime::new();
        rt.add_instance(source());
        rt.add_file("db", "/dump.sql", "select 1;");

        let mut spec = source();
        spec.ephemeral = true;
        rt.clone_instance(&spec, "db-copy", &CloneOptions::cold_single_instance())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(rt.instance_exists("db-copy"));

        let mut file = rt.open_file("db-copy", "/dump.sql").await.unwrap();
        assert_eq!(file.body.next_chunk().await.unwrap(), Some(b"select 1;".to_vec()));

        rt.set_state("db-copy", &StateChange::force_stop(Duration::from_secs(2)))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(!rt.instance_exists("db-copy"));
        assert_eq!(rt.stopped(), vec!["db-copy".to_string()]);
    }

    #[tokio::test]
    async fn exec_delivers_output_to_sinks() {
        let rt = InMemoryRuntime::new();
        rt.add_instance(source());
        rt.set_exec_output("/a\n");

        let stdout = CaptureBuffer::new();
        let request = ExecRequest {
            command: vec!["backup".to_string()],
            environment: BTreeMap::new(),
            stdin: Vec::new(),
            stdout: Arc::new(stdout.clone()),
            stderr: Arc::new(CaptureBuffer::new()),
        };

        rt.exec("db", request).await.unwrap().wait().await.unwrap();
        assert_eq!(stdout.contents(), b"/a\n".to_vec());
        assert_eq!(rt.calls().exec, 1);
    }

    #[tokio::test]
    async fn scripted_failures_surface_on_wait() {
        let rt = InMemoryRuntime::new();
        rt.add_instance(source());
        rt.fail_on(RuntimeStep::Start);

        let mut op = rt
            .set_state("db", &StateChange::start(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(op.wait().await, Err(RuntimeError::OperationFailed(_))));
    }
}
