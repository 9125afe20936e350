//! Skutter Core - Shared types for the Skutter scheduler
//!
//! This crate provides:
//! - Unit keys identifying pending pods
//! - Resource quantity parsing and pod request accounting
//! - Cluster events emitted by the state store
//! - Error types with miette diagnostics

pub mod error;
pub mod events;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, Result};
pub use events::ClusterEvent;
pub use resources::{
    is_bound, node_name, pod_priority, pod_requests, ResourceQuantities,
};
pub use types::UnitKey;

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Node, Pod};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
