//! Server configuration resolution
//!
//! The directory server's runtime parameters live in a user-maintained
//! ConfigMap as a YAML document. The resolver extracts and validates the
//! handful of values the operator needs; every failure here is a
//! user-authoring mistake, so all of them are non-retryable.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde_yaml::Value;
use tracing::info;

use crate::controller::yaml::{lookup, normalize};
use crate::crd::DirectoryCluster;
use crate::error::{Error, Result};

/// Default LDAP port when `general.ports.ldap` is absent.
const DEFAULT_LDAP_PORT: i32 = 9389;

/// Default LDAPS port when plaintext is disabled and `general.ports.ldaps`
/// is absent.
const DEFAULT_LDAPS_PORT: i32 = 9636;

/// Validated runtime parameters for the directory server.
///
/// Built once per reconciliation and read-only afterward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: i32,
    pub secure: bool,
    pub license_key: String,
    pub admin_dn: String,
    pub admin_pwd: String,
    pub suffixes: Vec<String>,
}

/// Fetch the server ConfigMap referenced by the cluster and resolve it.
pub async fn resolve_server_config(
    client: &Client,
    cluster: &DirectoryCluster,
) -> Result<ServerConfig> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let reference = &cluster.spec.pods.config_map.server;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    let config_map = config_maps
        .get(&reference.name)
        .await
        .map_err(Error::KubeError)?;

    let document = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(reference.key()))
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "the ConfigMap {} does not contain the key {}",
                reference.name,
                reference.key()
            ))
        })?;

    let config = resolve_document(document)?;

    info!(
        port = config.port,
        secure = config.secure,
        license_key = %config.license_key,
        admin_dn = %config.admin_dn,
        admin_pwd = "XXX",
        suffixes = ?config.suffixes,
        "Server configuration information"
    );

    Ok(config)
}

/// Resolve a raw YAML document into a [`ServerConfig`].
pub fn resolve_document(document: &str) -> Result<ServerConfig> {
    let body: Value = serde_yaml::from_str(document)?;
    let body = normalize(body);

    if body.as_mapping().is_none() {
        return Err(Error::ConfigError(
            "The server configuration cannot be parsed.".to_string(),
        ));
    }

    let mut port = DEFAULT_LDAP_PORT;
    let mut secure = false;

    if let Some(ldap) = lookup(&body, &["general", "ports", "ldap"]) {
        port = as_port(ldap, "general.ports.ldap")?;

        if port == 0 {
            // A zero port means plaintext has not been activated; fall back
            // to the secure port.
            secure = true;
            port = DEFAULT_LDAPS_PORT;

            if let Some(ldaps) = lookup(&body, &["general", "ports", "ldaps"]) {
                port = as_port(ldaps, "general.ports.ldaps")?;
            }
        }
    }

    let license_key = required_string(&body, &["general", "license", "key"])?;

    let admin_dn = match lookup(&body, &["general", "admin", "dn"]) {
        None => "cn=root".to_string(),
        Some(value) => as_string(value, "general.admin.dn")?,
    };

    let admin_pwd = required_string(&body, &["general", "admin", "pwd"])?;

    let suffixes = config_suffixes(&body)?;

    Ok(ServerConfig {
        port,
        secure,
        license_key,
        admin_dn,
        admin_pwd,
        suffixes,
    })
}

/// Extract the ordered list of managed suffix DNs from `server.suffixes`.
fn config_suffixes(body: &Value) -> Result<Vec<String>> {
    let entries = lookup(body, &["server", "suffixes"]).ok_or_else(|| {
        Error::ConfigError("The server.suffixes configuration is missing.".to_string())
    })?;

    let entries = entries.as_sequence().ok_or_else(|| {
        Error::ConfigError("The server.suffixes configuration is incorrect.".to_string())
    })?;

    let mut suffixes = Vec::with_capacity(entries.len());

    for entry in entries {
        let dn = lookup(entry, &["dn"]).and_then(Value::as_str).ok_or_else(|| {
            Error::ConfigError("The server.suffixes configuration is incorrect.".to_string())
        })?;

        suffixes.push(dn.to_string());
    }

    Ok(suffixes)
}

fn as_port(value: &Value, path: &str) -> Result<i32> {
    value
        .as_i64()
        .map(|port| port as i32)
        .ok_or_else(|| Error::ConfigError(format!("The {path} configuration is incorrect.")))
}

fn as_string(value: &Value, path: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::ConfigError(format!("The {path} configuration is incorrect.")))
}

fn required_string(body: &Value, path: &[&str]) -> Result<String> {
    match lookup(body, path) {
        None => Err(Error::ConfigError(format!(
            "The {} configuration is missing.",
            path.join(".")
        ))),
        Some(value) => as_string(value, &path.join(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = r#"
general:
  ports:
    ldap: 0
  license:
    key: "K"
  admin:
    pwd: "P"
server:
  suffixes:
    - dn: "dc=example"
"#;

    #[test]
    fn test_zero_ldap_port_switches_to_secure_defaults() {
        let config = resolve_document(COMPLETE).unwrap();
        assert_eq!(config.port, 9636);
        assert!(config.secure);
        assert_eq!(config.admin_dn, "cn=root");
        assert_eq!(config.license_key, "K");
        assert_eq!(config.admin_pwd, "P");
        assert_eq!(config.suffixes, vec!["dc=example".to_string()]);
    }

    #[test]
    fn test_absent_ldap_port_defaults_to_plaintext() {
        let doc = r#"
general:
  license:
    key: "K"
  admin:
    pwd: "P"
server:
  suffixes:
    - dn: "dc=example"
"#;
        let config = resolve_document(doc).unwrap();
        assert_eq!(config.port, 9389);
        assert!(!config.secure);
    }

    #[test]
    fn test_ldaps_port_overrides_secure_default() {
        let doc = COMPLETE.replace("ldap: 0", "ldap: 0\n    ldaps: 1636");
        let config = resolve_document(&doc).unwrap();
        assert_eq!(config.port, 1636);
        assert!(config.secure);
    }

    #[test]
    fn test_non_integer_ldap_port_is_a_fatal_type_error() {
        let doc = COMPLETE.replace("ldap: 0", "ldap: \"default\"");
        let err = resolve_document(&doc).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_non_integer_ldaps_port_is_a_fatal_type_error() {
        let doc = COMPLETE.replace("ldap: 0", "ldap: 0\n    ldaps: \"secure\"");
        assert!(resolve_document(&doc).is_err());
    }

    #[test]
    fn test_missing_license_key_is_fatal() {
        let doc = COMPLETE.replace("  license:\n    key: \"K\"\n", "");
        let err = resolve_document(&doc).unwrap_err();
        assert!(err.to_string().contains("general.license.key"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_missing_admin_pwd_is_fatal() {
        let doc = COMPLETE.replace("  admin:\n    pwd: \"P\"\n", "");
        let err = resolve_document(&doc).unwrap_err();
        assert!(err.to_string().contains("general.admin.pwd"));
    }

    #[test]
    fn test_admin_dn_taken_verbatim_when_present() {
        let doc = COMPLETE.replace(
            "  admin:\n    pwd: \"P\"",
            "  admin:\n    dn: \"cn=admin\"\n    pwd: \"P\"",
        );
        let config = resolve_document(&doc).unwrap();
        assert_eq!(config.admin_dn, "cn=admin");
    }

    #[test]
    fn test_missing_suffixes_is_fatal_and_not_retriable() {
        let doc = COMPLETE.replace("server:\n  suffixes:\n    - dn: \"dc=example\"\n", "");
        let err = resolve_document(&doc).unwrap_err();
        assert!(err.to_string().contains("server.suffixes"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_suffix_entry_without_dn_is_fatal() {
        let doc = COMPLETE.replace("- dn: \"dc=example\"", "- name: \"dc=example\"");
        let err = resolve_document(&doc).unwrap_err();
        assert!(err.to_string().contains("incorrect"));
    }

    #[test]
    fn test_suffixes_preserve_document_order() {
        let doc = COMPLETE.replace(
            "    - dn: \"dc=example\"",
            "    - dn: \"dc=example\"\n    - dn: \"dc=other\"",
        );
        let config = resolve_document(&doc).unwrap();
        assert_eq!(
            config.suffixes,
            vec!["dc=example".to_string(), "dc=other".to_string()]
        );
    }

    #[test]
    fn test_unparseable_document_is_not_retriable() {
        let err = resolve_document("[ unclosed").unwrap_err();
        assert!(matches!(err, Error::YamlError(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        let err = resolve_document("just a scalar").unwrap_err();
        assert!(err.to_string().contains("cannot be parsed"));
    }
}
