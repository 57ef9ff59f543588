//! Infrastructure layer: job registry, backup pipeline, container runtime
//! adapters, configuration.

pub mod clock;
pub mod config;
pub mod jobs;
pub mod runtime;
pub mod workers;
