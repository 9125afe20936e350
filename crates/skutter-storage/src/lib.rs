//! Skutter Storage - Authoritative cluster state for the scheduler
//!
//! This crate provides:
//! - ClusterStore trait: pods, nodes, bindings and a change feed
//! - redb-based durable implementation
//! - In-memory implementation for development and tests
//! - Optimistic-concurrency binding with capacity re-validation

pub mod error;
pub mod memory;
pub mod redb_backend;
pub mod store;

// Re-export commonly used types
pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use redb_backend::RedbStore;
pub use store::{Binding, ClusterStore, EventBusConfig};
