//! Main reconciler for DirectoryCluster resources
//!
//! Implements the controller pattern using kube-rs runtime. Each pass
//! rebuilds the observed replica membership from live state, realizes the
//! delta, and replaces the deployment's condition with the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controller::config::resolve_server_config;
use crate::controller::delta::replica_delta;
use crate::controller::replicas::{self, selector_for_app};
use crate::controller::{proxy, PVC_LABEL};
use crate::crd::{Condition, DirectoryCluster};
use crate::error::{Error, Result};

pub const DIRECTORY_CLUSTER_FINALIZER: &str = "directory.io/cleanup";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let clusters: Api<DirectoryCluster> = Api::all(client.clone());

    info!("Starting DirectoryCluster controller");

    // Verify the CRD exists before watching it.
    if let Err(e) = clusters.list(&Default::default()).await {
        error!(
            "DirectoryCluster CRD not found. Please install the CRD first: {:?}",
            e
        );
        return Err(Error::ConfigError(
            "DirectoryCluster CRD not installed".to_string(),
        ));
    }

    Controller::new(clusters, Config::default())
        // Watch owned resources for changes
        .owns::<Pod>(Api::all(client.clone()), Config::default())
        .owns::<Service>(Api::all(client.clone()), Config::default())
        .owns::<Job>(Api::all(client.clone()), Config::default())
        .owns::<ConfigMap>(Api::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
#[instrument(skip(ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<DirectoryCluster>, ctx: Arc<ControllerState>) -> Result<Action> {
    let client = ctx.client.clone();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<DirectoryCluster> = Api::namespaced(client.clone(), &namespace);

    info!(
        "Reconciling DirectoryCluster {}/{}",
        namespace,
        cluster.name_any()
    );

    finalizer(&api, DIRECTORY_CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => apply_cluster(&client, &cluster).await,
            FinalizerEvent::Cleanup(cluster) => delete_deployment(&client, &cluster).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Converge one DirectoryCluster towards its declared replica membership.
async fn apply_cluster(client: &Client, cluster: &DirectoryCluster) -> Result<Action> {
    let mut existing = match get_existing_pods(client, cluster).await {
        Ok(pods) => pods,
        Err(err) => {
            return Err(report_failure(
                client,
                cluster,
                err,
                "Failed to retrieve the list of existing pods.",
            )
            .await)
        }
    };

    info!(pods = ?existing, "Existing pods");

    let delta = replica_delta(&cluster.spec.replicas.pvcs, &existing);

    info!(to_remove = ?delta.to_remove, to_add = ?delta.to_add, "Updates required");

    if delta.is_empty() {
        return Ok(Action::await_change());
    }

    let config = match resolve_server_config(client, cluster).await {
        Ok(config) => config,
        Err(err) => {
            return Err(report_failure(
                client,
                cluster,
                err,
                "Failed to obtain the server information from the ConfigMap.",
            )
            .await)
        }
    };

    if let Err(err) =
        replicas::create_replicas(client, cluster, &config, &mut existing, delta.to_add).await
    {
        return Err(
            report_failure(client, cluster, err, "Failed to create the new replicas.").await,
        );
    }

    // The proxy has to learn about the new replicas before the obsolete
    // ones disappear.
    if let Err(err) = proxy::deploy_proxy(client, cluster, &config).await {
        return Err(report_failure(client, cluster, err, "Failed to deploy the proxy.").await);
    }

    if let Err(err) = replicas::delete_replicas(client, cluster, &existing, &delta.to_remove).await
    {
        return Err(report_failure(
            client,
            cluster,
            err,
            "Failed to delete the obsolete replicas.",
        )
        .await);
    }

    info!("Reconciled the document");

    publish_condition(client, cluster, None).await?;

    Ok(Action::await_change())
}

/// Tear down everything the operator created for a deleted deployment.
///
/// Owner references normally let the platform collect these, but the
/// teardown is explicit so a deployment is reclaimed even where objects
/// were created without a live owner record. Not-found failures are
/// ignored; the order is services, pods, jobs, configuration copies.
#[instrument(skip_all, fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn delete_deployment(client: &Client, cluster: &DirectoryCluster) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let params = ListParams::default().labels(&selector_for_app(&cluster.name_any()));

    info!("Deleting the deployment");

    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    services
        .delete_collection(&DeleteParams::default(), &params)
        .await
        .map_err(Error::KubeError)?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    pods.delete_collection(&DeleteParams::default(), &params)
        .await
        .map_err(Error::KubeError)?;

    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    jobs.delete_collection(&DeleteParams::default(), &params)
        .await
        .map_err(Error::KubeError)?;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    config_maps
        .delete_collection(&DeleteParams::default(), &params)
        .await
        .map_err(Error::KubeError)?;

    info!("Deployment deleted");

    Ok(Action::await_change())
}

/// Observed replica membership: PVC name to pod name, rebuilt from a live
/// list on every pass.
async fn get_existing_pods(
    client: &Client,
    cluster: &DirectoryCluster,
) -> Result<BTreeMap<String, String>> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let list = pods
        .list(&ListParams::default().labels(&selector_for_app(&cluster.name_any())))
        .await
        .map_err(Error::KubeError)?;

    let mut existing = BTreeMap::new();

    for pod in list {
        // Seed job pods carry the deployment labels but no PVC label; only
        // replica pods count towards the observed membership.
        if let Some(pvc) = pod.labels().get(PVC_LABEL) {
            existing.insert(pvc.clone(), pod.name_any());
        }
    }

    Ok(existing)
}

/// Log the failing stage, publish the failure condition, and hand the
/// error back for the retry decision.
async fn report_failure(
    client: &Client,
    cluster: &DirectoryCluster,
    err: Error,
    message: &str,
) -> Error {
    error!(error = %err, "{}", message);

    if let Err(status_err) = publish_condition(client, cluster, Some(&err)).await {
        warn!(error = %status_err, "Failed to update the condition for the resource");
    }

    err
}

/// Replace the deployment's condition with the outcome of this pass.
async fn publish_condition(
    client: &Client,
    cluster: &DirectoryCluster,
    err: Option<&Error>,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<DirectoryCluster> = Api::namespaced(client.clone(), &namespace);

    let condition = available_condition(cluster, err);
    let patch = serde_json::json!({ "status": { "conditions": [condition] } });

    api.patch_status(
        &cluster.name_any(),
        &PatchParams::apply("directory-operator"),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    Ok(())
}

/// Build the single Available condition for the deployment.
fn available_condition(cluster: &DirectoryCluster, err: Option<&Error>) -> Condition {
    let (reason, success_message) = if cluster.metadata.generation == Some(1) {
        ("DeploymentCreated", "The deployment has been created.")
    } else {
        ("DeploymentUpdated", "The deployment has been updated.")
    };

    let (status, message) = match err {
        None => ("True", success_message.to_string()),
        Some(err) => ("False", err.to_string()),
    };

    Condition {
        type_: "Available".to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Utc::now().to_rfc3339(),
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(
    cluster: Arc<DirectoryCluster>,
    error: &Error,
    _ctx: Arc<ControllerState>,
) -> Action {
    error!(
        "Reconciliation error for {}: {:?}",
        cluster.name_any(),
        error
    );

    if error.is_retriable() {
        Action::requeue(Duration::from_secs(15))
    } else {
        // A user-authoring mistake; retrying without a corrected document
        // cannot succeed, so wait for the resource to change.
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConfigMapRef, ConfigMapRefs, DirectoryClusterSpec, PodTemplate, ReplicaSpec};

    fn test_cluster(generation: i64) -> DirectoryCluster {
        let mut cluster = DirectoryCluster::new(
            "directory",
            DirectoryClusterSpec {
                replicas: ReplicaSpec {
                    pvcs: vec!["pvc-a".to_string()],
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
            },
        );
        cluster.metadata.generation = Some(generation);
        cluster
    }

    #[test]
    fn test_success_condition_is_available_true() {
        let condition = available_condition(&test_cluster(1), None);
        assert_eq!(condition.type_, "Available");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "DeploymentCreated");
        assert_eq!(condition.message, "The deployment has been created.");
    }

    #[test]
    fn test_later_generations_report_deployment_updated() {
        let condition = available_condition(&test_cluster(3), None);
        assert_eq!(condition.reason, "DeploymentUpdated");
        assert_eq!(condition.message, "The deployment has been updated.");
    }

    #[test]
    fn test_failure_condition_carries_the_raw_error_text() {
        let err = Error::ConfigError("The server.suffixes configuration is missing.".to_string());
        let condition = available_condition(&test_cluster(2), Some(&err));
        assert_eq!(condition.status, "False");
        assert!(condition
            .message
            .contains("The server.suffixes configuration is missing."));
    }
}
