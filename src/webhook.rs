//! Validating admission webhook for DirectoryCluster documents
//!
//! Rejects documents that reference storage volumes, ConfigMaps, or
//! Secrets which do not exist, and guards the constraints the controller
//! relies on: unique PVCs, an immutable pod template, and replicas that
//! are all reachable before membership changes are accepted.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::controller::poll::pod_is_started;
use crate::controller::replicas::selector_for_app;
use crate::controller::yaml::{lookup, normalize};
use crate::controller::PVC_LABEL;
use crate::crd::{ConfigMapRef, DirectoryCluster};
use crate::error::{Error, Result};

/// Keys the operator generates into the proxy configuration itself; a
/// user-supplied document must not declare them.
const RESERVED_PROXY_KEYS: [[&str; 2]; 2] = [["proxy", "server-groups"], ["proxy", "suffixes"]];

/// Webhook server state
pub struct WebhookState {
    pub client: Client,
}

/// TLS material for the webhook listener
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Serve the validating webhook until the process exits.
pub async fn run_webhook(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    tls: Option<TlsConfig>,
) -> Result<()> {
    let app = Router::new()
        .route("/validate", post(handle_validate))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    info!(%addr, tls = tls.is_some(), "Starting the admission webhook");

    let served = match tls {
        Some(tls) => {
            let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &tls.cert_path,
                &tls.key_path,
            )
            .await
            .map_err(|e| Error::ConfigError(format!("failed to load webhook TLS material: {e}")))?;

            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
        }
        None => axum_server::bind(addr).serve(app.into_make_service()).await,
    };

    served.map_err(|e| Error::ConfigError(format!("webhook server error: {e}")))
}

async fn handle_validate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DirectoryCluster>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DirectoryCluster> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "Rejecting a malformed admission review");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let response = AdmissionResponse::from(&request);

    let outcome = match (&request.operation, &request.object) {
        (Operation::Create, Some(cluster)) => {
            info!(name = %cluster.name_any(), "validate create");
            validate_create(&state.client, cluster).await
        }
        (Operation::Update, Some(cluster)) => {
            info!(name = %cluster.name_any(), "validate update");
            match &request.old_object {
                Some(old) => validate_update(&state.client, cluster, old).await,
                None => validate_create(&state.client, cluster).await,
            }
        }
        // Deletes are always allowed.
        _ => Ok(()),
    };

    match outcome {
        Ok(()) => Json(response.into_review()),
        Err(err) => Json(response.deny(err.to_string()).into_review()),
    }
}

/// Checks applied when a document is first created.
async fn validate_create(client: &Client, cluster: &DirectoryCluster) -> Result<()> {
    cluster.spec.validate().map_err(Error::ValidationError)?;

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    ensure_pvcs_exist(client, &namespace, &cluster.spec.replicas.pvcs).await?;
    ensure_env_sources_exist(client, &namespace, cluster).await?;

    fetch_document(client, &namespace, &cluster.spec.pods.config_map.server).await?;

    let proxy = fetch_document(client, &namespace, &cluster.spec.pods.config_map.proxy).await?;
    ensure_no_reserved_proxy_keys(&proxy)?;

    Ok(())
}

/// Checks applied when an existing document is updated: everything the
/// create path verifies, plus pod-template immutability and the
/// availability of every currently observed replica.
async fn validate_update(
    client: &Client,
    cluster: &DirectoryCluster,
    old: &DirectoryCluster,
) -> Result<()> {
    validate_create(client, cluster).await?;

    if pods_template_changed(old, cluster) {
        return Err(Error::ValidationError(
            "the pods template is immutable; only replicas.pvcs may be changed".to_string(),
        ));
    }

    ensure_replicas_available(client, cluster).await
}

/// Whether anything under `spec.pods` differs between the two documents.
fn pods_template_changed(old: &DirectoryCluster, new: &DirectoryCluster) -> bool {
    serde_json::to_value(&old.spec.pods).ok() != serde_json::to_value(&new.spec.pods).ok()
}

async fn ensure_pvcs_exist(client: &Client, namespace: &str, pvcs: &[String]) -> Result<()> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);

    for pvc in pvcs {
        if api.get_opt(pvc).await.map_err(Error::KubeError)?.is_none() {
            return Err(Error::ValidationError(format!(
                "the PVC {pvc} does not exist"
            )));
        }
    }

    Ok(())
}

/// Every ConfigMap and Secret named by `pods.envFrom` has to exist.
async fn ensure_env_sources_exist(
    client: &Client,
    namespace: &str,
    cluster: &DirectoryCluster,
) -> Result<()> {
    let Some(sources) = &cluster.spec.pods.env_from else {
        return Ok(());
    };

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    for source in sources {
        if let Some(name) = source.config_map_ref.as_ref().and_then(|r| r.name.as_ref()) {
            if config_maps
                .get_opt(name)
                .await
                .map_err(Error::KubeError)?
                .is_none()
            {
                return Err(Error::ValidationError(format!(
                    "the envFrom ConfigMap {name} does not exist"
                )));
            }
        }

        if let Some(name) = source.secret_ref.as_ref().and_then(|r| r.name.as_ref()) {
            if secrets
                .get_opt(name)
                .await
                .map_err(Error::KubeError)?
                .is_none()
            {
                return Err(Error::ValidationError(format!(
                    "the envFrom Secret {name} does not exist"
                )));
            }
        }
    }

    Ok(())
}

/// Fetch the document held by a configuration reference, verifying both
/// the ConfigMap and its key exist.
async fn fetch_document(
    client: &Client,
    namespace: &str,
    reference: &ConfigMapRef,
) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);

    let config_map = api
        .get_opt(&reference.name)
        .await
        .map_err(Error::KubeError)?
        .ok_or_else(|| {
            Error::ValidationError(format!("the ConfigMap {} does not exist", reference.name))
        })?;

    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(reference.key()))
        .cloned()
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "the ConfigMap {} does not contain the key {}",
                reference.name,
                reference.key()
            ))
        })
}

/// The proxy document must not declare the keys the operator generates.
fn ensure_no_reserved_proxy_keys(document: &str) -> Result<()> {
    let body = serde_yaml::from_str(document)
        .map_err(|e| Error::ValidationError(format!("the proxy configuration cannot be parsed: {e}")))?;
    let body = normalize(body);

    for path in RESERVED_PROXY_KEYS {
        if lookup(&body, &path).is_some() {
            return Err(Error::ValidationError(format!(
                "the proxy configuration must not declare {}",
                path.join(".")
            )));
        }
    }

    Ok(())
}

/// Every currently observed replica must be running and ready before a
/// membership change is accepted.
async fn ensure_replicas_available(client: &Client, cluster: &DirectoryCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let list = pods
        .list(&ListParams::default().labels(&selector_for_app(&cluster.name_any())))
        .await
        .map_err(Error::KubeError)?;

    for pod in list {
        if !pod.labels().contains_key(PVC_LABEL) {
            continue;
        }

        let available = pod_is_started(&pod).unwrap_or(false);
        if !available {
            return Err(Error::ValidationError(format!(
                "the replica pod {} is not currently available",
                pod.name_any()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConfigMapRefs, DirectoryClusterSpec, PodTemplate, ReplicaSpec};

    fn test_cluster(image: &str, pvcs: &[&str]) -> DirectoryCluster {
        DirectoryCluster::new(
            "directory",
            DirectoryClusterSpec {
                replicas: ReplicaSpec {
                    pvcs: pvcs.iter().map(|p| p.to_string()).collect(),
                },
                pods: PodTemplate {
                    image: image.to_string(),
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
            },
        )
    }

    #[test]
    fn test_plain_proxy_document_is_accepted() {
        let doc = "proxy:\n  ports:\n    ldap: 1389\n";
        assert!(ensure_no_reserved_proxy_keys(doc).is_ok());
    }

    #[test]
    fn test_reserved_proxy_keys_are_rejected() {
        let groups = "proxy:\n  server-groups:\n    - name: g1\n";
        assert!(ensure_no_reserved_proxy_keys(groups).is_err());

        let suffixes = "proxy:\n  suffixes:\n    - dn: dc=example\n";
        assert!(ensure_no_reserved_proxy_keys(suffixes).is_err());
    }

    #[test]
    fn test_replica_list_changes_do_not_count_as_template_changes() {
        let old = test_cluster("server:1", &["pvc-a"]);
        let new = test_cluster("server:1", &["pvc-a", "pvc-b"]);
        assert!(!pods_template_changed(&old, &new));
    }

    #[test]
    fn test_image_change_is_a_template_change() {
        let old = test_cluster("server:1", &["pvc-a"]);
        let new = test_cluster("server:2", &["pvc-a"]);
        assert!(pods_template_changed(&old, &new));
    }
}
