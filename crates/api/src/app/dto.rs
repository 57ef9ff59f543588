use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ctbackup_core::CorrelationId;
use ctbackup_infra::jobs::JobSpec;

// -------------------------
// Request DTOs
// -------------------------

/// Wire body of `POST /backup`.
///
/// Only caller-controlled fields; clone name, timestamps and results are
/// derived server-side.
#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    /// Source container.
    pub name: String,
    #[serde(default = "default_ephemeral")]
    pub ephemeral: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub destination: Option<String>,
}

fn default_ephemeral() -> bool {
    true
}

impl BackupRequest {
    pub fn into_spec(self, default_destination: &Path) -> JobSpec {
        let destination = match self.destination {
            Some(d) if !d.trim().is_empty() => PathBuf::from(d),
            _ => default_destination.to_path_buf(),
        };

        JobSpec {
            source: self.name.trim().to_string(),
            ephemeral: self.ephemeral,
            profile_edits: self.profiles,
            command: self.command,
            environment: self.environment,
            destination,
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub id: CorrelationId,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

impl StatusResponse {
    pub const PROCESSING: Self = Self {
        status: "processing",
    };
    pub const DONE: Self = Self { status: "done" };
}
