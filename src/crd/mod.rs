//! Custom Resource Definitions for the directory operator

mod directory_cluster;

pub use directory_cluster::{
    Condition, ConfigMapRef, ConfigMapRefs, DirectoryCluster, DirectoryClusterSpec,
    DirectoryClusterStatus, PodTemplate, ReplicaSpec, CONFIG_MAP_KEY,
};
