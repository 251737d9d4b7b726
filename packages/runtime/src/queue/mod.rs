//! Persistent, schedulable request queues.

pub mod drain;
pub mod engine;
pub mod store;
pub mod sweeper;

pub use drain::{DrainController, DrainState};
pub use engine::QueueEngine;
pub use store::{EntryFilter, QueueStore};
pub use sweeper::SweepTask;
