//! directory-operator: Kubernetes operator for clustered LDAP directories
//!
//! This crate keeps a multi-replica directory deployment converged to its
//! declared state: one replica per storage volume, a single principal
//! replica anchoring the replication graph, and a validating admission
//! webhook guarding the documents the controller consumes.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;
pub mod webhook;

pub use crate::error::{Error, Result};
