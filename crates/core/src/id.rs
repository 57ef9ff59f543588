//! Correlation identifiers for backup jobs.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Maximum accepted length of a caller-supplied correlation id.
pub const MAX_ID_LEN: usize = 32;

/// Maximum length of an instance name accepted by the container runtime.
pub const MAX_INSTANCE_NAME_LEN: usize = 63;

const CLONE_INFIX: &str = "-backup-";

/// Opaque token identifying one backup job among the live jobs.
///
/// Either generated on acceptance or supplied by the caller. The character set
/// is restricted so the id can be embedded verbatim in a container name:
/// ASCII letters, digits and `-`, never at either end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id: 16 lowercase hex chars from the random tail of a UUIDv7.
    pub fn new() -> Self {
        let (_, random) = Uuid::now_v7().as_u64_pair();
        Self(format!("{random:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CorrelationId> for String {
    fn from(value: CorrelationId) -> Self {
        value.0
    }
}

impl FromStr for CorrelationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::invalid_id("correlation id is empty"));
        }
        if s.len() > MAX_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "correlation id longer than {MAX_ID_LEN} characters"
            )));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(DomainError::invalid_id(
                "correlation id may only contain [A-Za-z0-9-]",
            ));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(DomainError::invalid_id(
                "correlation id must not start or end with '-'",
            ));
        }
        Ok(Self(s.to_string()))
    }
}

/// Name of the clone created for a job: `<source>-backup-<id>`.
///
/// The source part is shortened so the result never exceeds
/// [`MAX_INSTANCE_NAME_LEN`]; the id is always kept whole. For a valid
/// instance name and a valid id the result is itself a valid instance name.
pub fn clone_name(source: &str, id: &CorrelationId) -> String {
    let room = MAX_INSTANCE_NAME_LEN - CLONE_INFIX.len() - id.as_str().len();
    // Instance names are ASCII, so byte slicing stays on char boundaries.
    let prefix = source.get(..room.min(source.len())).unwrap_or(source);
    let prefix = prefix.trim_end_matches('-');
    format!("{prefix}{CLONE_INFIX}{id}")
}
