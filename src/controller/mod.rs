//! Controller module for DirectoryCluster reconciliation
//!
//! Contains the main controller loop, the replica lifecycle orchestration,
//! and the configuration plumbing for clustered directory deployments.

pub mod config;
pub mod delta;
pub mod exec;
pub mod poll;
pub mod proxy;
mod reconciler;
pub mod replicas;
pub mod yaml;

pub use reconciler::{run_controller, ControllerState};

/// Label carrying the PVC backing a replica object.
pub const PVC_LABEL: &str = "app.kubernetes.io/pvc-name";
