use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::jobs::JobRegistry;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Periodic registry sweep.
///
/// Every `interval` the registry drops all jobs older than its retention
/// window, finished or not. Evicted jobs keep running; their clones are not
/// touched.
#[derive(Debug)]
pub struct EvictionWorker;

impl EvictionWorker {
    pub fn spawn(registry: Arc<JobRegistry>, interval: Duration) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("registry-eviction".to_string())
            .spawn(move || worker_loop(&registry, interval, shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop(registry: &JobRegistry, interval: Duration, shutdown_rx: mpsc::Receiver<()>) {
    debug!(?interval, retention = ?registry.retention(), "eviction worker started");

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let evicted = registry.prune();
        let stats = registry.stats();
        if evicted.is_empty() {
            debug!(processing = stats.processing, finished = stats.finished, "registry sweep");
        } else {
            info!(
                evicted = evicted.len(),
                processing = stats.processing,
                finished = stats.finished,
                "evicted expired jobs"
            );
        }
    }

    debug!("eviction worker stopped");
}
