//! `ctbackup-core`: domain building blocks for container backups.
//!
//! This crate contains **pure domain** logic (no I/O, no runtime access):
//! identifiers, profile/config/environment shaping for clones, and parsing of
//! the producer command's manifest output.

pub mod error;
pub mod id;
pub mod instance;
pub mod manifest;
pub mod profiles;

pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, MAX_INSTANCE_NAME_LEN, clone_name};
pub use instance::{
    DEFAULT_EXEC_ENV, exec_environment, strip_volatile_keys, validate_instance_name,
};
pub use manifest::{Manifest, RejectedLine};
pub use profiles::merge_profiles;
