//! Background workers.

pub mod eviction_worker;

pub use eviction_worker::{EvictionWorker, WorkerHandle};
