mod engine;
mod error;
pub mod parser;
mod queue;
mod scheduler;
#[cfg(test)]
mod testkit;

pub use engine::SyncEngine;
pub use error::SyncError;
pub use queue::SyncQueue;
pub use scheduler::{DispatchSummary, SchedulerConfig, SyncScheduler, PRIORITY_HIGH, PRIORITY_LOW};
