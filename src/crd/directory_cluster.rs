//! DirectoryCluster Custom Resource Definition
//!
//! A DirectoryCluster declares a clustered LDAP directory deployment: one
//! replica per PersistentVolumeClaim, a shared pod template, and references
//! to the externally maintained server and proxy configuration ConfigMaps.

use k8s_openapi::api::core::v1::{
    EnvFromSource, EnvVar, LocalObjectReference, ResourceRequirements,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Key under which configuration ConfigMaps hold their YAML document unless
/// a key is set explicitly on the reference.
pub const CONFIG_MAP_KEY: &str = "config.yaml";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "directory.io",
    version = "v1alpha1",
    kind = "DirectoryCluster",
    namespaced,
    status = "DirectoryClusterStatus",
    shortname = "dirc",
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type=='Available')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryClusterSpec {
    /// Replica membership, one replica per PVC.
    pub replicas: ReplicaSpec,

    /// Template applied to every replica pod.
    pub pods: PodTemplate,
}

/// Replica membership for the deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Names of the PersistentVolumeClaims backing the replicas. Each PVC
    /// yields exactly one replica; names must be unique.
    pub pvcs: Vec<String>,
}

/// Pod template shared by all replicas of the deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    /// Directory server image reference.
    pub image: String,

    /// Resource requests and limits for the server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub resources: Option<ResourceRequirements>,

    /// Additional environment for the server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub env: Option<Vec<EnvVar>>,

    /// Supplemental environment sources (ConfigMaps and Secrets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub env_from: Option<Vec<EnvFromSource>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// References to the externally maintained configuration documents.
    pub config_map: ConfigMapRefs,
}

/// References to the server and proxy configuration ConfigMaps
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRefs {
    pub server: ConfigMapRef,
    pub proxy: ConfigMapRef,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    /// Name of the ConfigMap in the deployment's namespace.
    pub name: String,

    /// Key holding the YAML document. Defaults to `config.yaml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ConfigMapRef {
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(CONFIG_MAP_KEY)
    }
}

impl DirectoryClusterSpec {
    /// Structural validation shared by the admission webhook.
    pub fn validate(&self) -> Result<(), String> {
        if self.replicas.pvcs.is_empty() {
            return Err("replicas.pvcs must name at least one PVC".to_string());
        }

        let mut seen = std::collections::BTreeSet::new();
        for pvc in &self.replicas.pvcs {
            if !seen.insert(pvc.as_str()) {
                return Err(format!("replicas.pvcs contains a duplicate entry: {pvc}"));
            }
        }

        if self.pods.image.is_empty() {
            return Err("pods.image must not be empty".to_string());
        }

        Ok(())
    }
}

/// Status of a DirectoryCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryClusterStatus {
    /// The single current condition of the deployment. Fully replaced on
    /// every reconciliation outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status condition following Kubernetes API conventions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec(pvcs: &[&str]) -> DirectoryClusterSpec {
        DirectoryClusterSpec {
            replicas: ReplicaSpec {
                pvcs: pvcs.iter().map(|p| p.to_string()).collect(),
            },
            pods: PodTemplate {
                image: "icr.io/isvd/verify-directory-server:latest".to_string(),
                config_map: ConfigMapRefs {
                    server: ConfigMapRef {
                        name: "server-config".to_string(),
                        key: None,
                    },
                    proxy: ConfigMapRef {
                        name: "proxy-config".to_string(),
                        key: None,
                    },
                },
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(minimal_spec(&["pvc-a", "pvc-b"]).validate().is_ok());
    }

    #[test]
    fn test_duplicate_pvcs_rejected() {
        let err = minimal_spec(&["pvc-a", "pvc-a"]).validate().unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_empty_pvcs_rejected() {
        assert!(minimal_spec(&[]).validate().is_err());
    }

    #[test]
    fn test_config_map_key_defaults() {
        let spec = minimal_spec(&["pvc-a"]);
        assert_eq!(spec.pods.config_map.server.key(), "config.yaml");

        let with_key = ConfigMapRef {
            name: "server-config".to_string(),
            key: Some("isvd.yaml".to_string()),
        };
        assert_eq!(with_key.key(), "isvd.yaml");
    }
}
