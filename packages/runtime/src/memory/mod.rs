//! In-memory collaborators for single-process deployments and tests.

pub mod manager;
pub mod queue_store;

pub use manager::LocalManager;
pub use queue_store::MemoryQueueStore;
