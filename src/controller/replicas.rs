//! Replica lifecycle orchestration
//!
//! Realizes the computed delta against the live replica topology. The
//! replication graph always has exactly one principal replica that every
//! other replica agrees with directly, so creation and deletion are
//! strictly sequential: agreements are wired against the live principal,
//! new replicas are seeded from the principal's data before they start,
//! and victims are unwired from every survivor before their pod goes away.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, instrument};

use crate::controller::config::ServerConfig;
use crate::controller::{exec, poll, PVC_LABEL};
use crate::crd::{DirectoryCluster, CONFIG_MAP_KEY};
use crate::error::{Error, Result};

/// Mount point of the server configuration ConfigMap inside a replica.
const CONFIG_MOUNT_PATH: &str = "/var/isvd/config";

/// Mount point of the replica's persistent data volume.
const DATA_MOUNT_PATH: &str = "/var/isvd/data";

/// Mount points used by the seed job to copy the principal's data.
const SEED_SOURCE_PATH: &str = "/seed/source";
const SEED_TARGET_PATH: &str = "/seed/target";

// ============================================================================
// Names and labels
// ============================================================================

/// Labels shared by every object the operator creates for a deployment.
/// Per-replica objects additionally carry the PVC label.
pub fn labels_for_app(name: &str, pvc: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "directory-operator".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/part-of".to_string(),
        "directory".to_string(),
    );
    labels.insert("app.kubernetes.io/instance".to_string(), name.to_string());

    if let Some(pvc) = pvc {
        labels.insert(PVC_LABEL.to_string(), pvc.to_string());
    }

    labels
}

/// Label selector string matching every object owned by the deployment.
pub fn selector_for_app(name: &str) -> String {
    labels_for_app(name, None)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pod (and service, and replica identity) name for the replica backed by
/// the given PVC.
pub fn replica_pod_name(cluster: &DirectoryCluster, pvc: &str) -> String {
    format!("{}-{}", cluster.name_any(), pvc).to_lowercase()
}

/// Name of the job which seeds the replica backed by the given PVC.
pub fn seed_job_name(cluster: &DirectoryCluster, pvc: &str) -> String {
    format!("{}-seed", replica_pod_name(cluster, pvc))
}

/// Name of the configuration copy mounted by seed jobs.
pub fn seed_config_map_name(cluster: &DirectoryCluster) -> String {
    format!("{}-seed", cluster.name_any()).to_lowercase()
}

/// Owner reference back to the DirectoryCluster for garbage collection.
pub fn owner_reference(cluster: &DirectoryCluster) -> OwnerReference {
    OwnerReference {
        api_version: DirectoryCluster::api_version(&()).to_string(),
        kind: DirectoryCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

// ============================================================================
// Add planning
// ============================================================================

/// The resolved shape of one add batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AddPlan {
    /// PVC of the replica anchoring the replication graph.
    pub principal: String,
    /// Whether the principal itself still has to be deployed first.
    pub bootstrap: bool,
    /// Remaining PVCs to wire, seed, and deploy, in order.
    pub secondaries: Vec<String>,
}

/// Select the principal and order the additions.
///
/// Membership in an existing, already-converged topology is sufficient to
/// anchor the graph, so any existing replica will do; the lexically
/// smallest is used so the choice is reproducible. With no existing
/// replicas the lexically smallest addition becomes the principal and is
/// deployed before anything else.
pub(crate) fn plan_additions(
    existing: &BTreeMap<String, String>,
    mut to_add: Vec<String>,
) -> Option<AddPlan> {
    if to_add.is_empty() {
        return None;
    }

    to_add.sort();

    match existing.keys().next() {
        Some(principal) => Some(AddPlan {
            principal: principal.clone(),
            bootstrap: false,
            secondaries: to_add,
        }),
        None => {
            let principal = to_add.remove(0);
            Some(AddPlan {
                principal,
                bootstrap: true,
                secondaries: to_add,
            })
        }
    }
}

/// Pod names of the replicas that survive the removal batch and therefore
/// need their agreement with each victim torn down.
pub(crate) fn surviving_peers<'a>(
    existing: &'a BTreeMap<String, String>,
    doomed: &BTreeSet<String>,
) -> Vec<&'a String> {
    existing
        .iter()
        .filter(|(pvc, _)| !doomed.contains(*pvc))
        .map(|(_, pod)| pod)
        .collect()
}

// ============================================================================
// Replica creation
// ============================================================================

/// Create the replicas in `to_add`, updating `existing` as each one lands.
#[instrument(skip_all, fields(name = %cluster.name_any(), to_add = ?to_add))]
pub async fn create_replicas(
    client: &Client,
    cluster: &DirectoryCluster,
    config: &ServerConfig,
    existing: &mut BTreeMap<String, String>,
    to_add: Vec<String>,
) -> Result<()> {
    let Some(plan) = plan_additions(existing, to_add) else {
        return Ok(());
    };

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    if plan.bootstrap {
        info!(principal = %plan.principal, "Deploying the principal replica");
        deploy_replica(client, cluster, config, &plan.principal).await?;
        existing.insert(
            plan.principal.clone(),
            replica_pod_name(cluster, &plan.principal),
        );
    }

    if plan.secondaries.is_empty() {
        return Ok(());
    }

    let principal_pod = existing[&plan.principal].clone();

    // Wire every new replica into the topology before any data movement.
    for pvc in &plan.secondaries {
        create_replication_agreement(&pods, &principal_pod, &replica_pod_name(cluster, pvc))
            .await?;
    }

    ensure_seed_config_map(client, cluster).await?;

    for pvc in plan.secondaries {
        seed_replica(client, cluster, &plan.principal, &pvc).await?;
        deploy_replica(client, cluster, config, &pvc).await?;
        existing.insert(pvc.clone(), replica_pod_name(cluster, &pvc));
    }

    Ok(())
}

/// Deploy a single replica: create its pod, wait for it to become ready,
/// then expose it with a ClusterIP service.
#[instrument(skip_all, fields(name = %cluster.name_any(), pvc = %pvc))]
async fn deploy_replica(
    client: &Client,
    cluster: &DirectoryCluster,
    config: &ServerConfig,
    pvc: &str,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let pod_name = replica_pod_name(cluster, pvc);

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    info!(pod = %pod_name, "Creating a new replica pod");
    pods.create(&PostParams::default(), &build_replica_pod(cluster, config, pvc))
        .await
        .map_err(Error::KubeError)?;

    poll::wait_for_pod_start(&pods, &pod_name).await?;

    create_cluster_service(client, cluster, pvc, config.port).await
}

/// Build the replica pod from the deployment's pod template.
fn build_replica_pod(cluster: &DirectoryCluster, config: &ServerConfig, pvc: &str) -> Pod {
    let name = replica_pod_name(cluster, pvc);
    let template = &cluster.spec.pods;
    let config_file = format!(
        "{}/{}",
        CONFIG_MOUNT_PATH,
        template.config_map.server.key()
    );

    // The generated identity doubles as the replica id used by the
    // replication agreement commands.
    let mut env = vec![
        EnvVar {
            name: "ISVD_INSTANCE".to_string(),
            value: Some(name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "ISVD_CONFIG_FILE".to_string(),
            value: Some(config_file),
            ..Default::default()
        },
    ];
    if let Some(extra) = &template.env {
        env.extend(extra.iter().cloned());
    }

    let health_probe = Probe {
        exec: Some(ExecAction {
            command: Some(vec!["isvd_healthcheck".to_string()]),
        }),
        period_seconds: Some(10),
        ..Default::default()
    };

    let port_name = if config.secure { "ldaps" } else { "ldap" };

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels_for_app(&cluster.name_any(), Some(pvc))),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: template.service_account_name.clone(),
            image_pull_secrets: template.image_pull_secrets.clone(),
            containers: vec![Container {
                name: "isvd-server".to_string(),
                image: Some(template.image.clone()),
                env: Some(env),
                env_from: template.env_from.clone(),
                resources: template.resources.clone(),
                ports: Some(vec![ContainerPort {
                    name: Some(port_name.to_string()),
                    container_port: config.port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                liveness_probe: Some(Probe {
                    initial_delay_seconds: Some(30),
                    ..health_probe.clone()
                }),
                readiness_probe: Some(Probe {
                    initial_delay_seconds: Some(5),
                    ..health_probe
                }),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "isvd-config".to_string(),
                        mount_path: CONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "isvd-data".to_string(),
                        mount_path: DATA_MOUNT_PATH.to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                Volume {
                    name: "isvd-config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(template.config_map.server.name.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "isvd-data".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: pvc.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Create the ClusterIP service exposing a replica on the resolved port.
async fn create_cluster_service(
    client: &Client,
    cluster: &DirectoryCluster,
    pvc: &str,
    port: i32,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let pod_name = replica_pod_name(cluster, pvc);
    let labels = labels_for_app(&cluster.name_any(), Some(pvc));

    let service = Service {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("ldap".to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    };

    info!(pod = %pod_name, "Creating a new service for the pod");

    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    services
        .create(&PostParams::default(), &service)
        .await
        .map_err(Error::KubeError)?;

    Ok(())
}

// ============================================================================
// Seeding
// ============================================================================

/// Copy the server configuration document into the deployment's seed
/// ConfigMap, creating or updating it as needed.
async fn ensure_seed_config_map(client: &Client, cluster: &DirectoryCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let reference = &cluster.spec.pods.config_map.server;
    let name = seed_config_map_name(cluster);

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);

    let source = config_maps
        .get(&reference.name)
        .await
        .map_err(Error::KubeError)?;
    let document = source
        .data
        .as_ref()
        .and_then(|data| data.get(reference.key()))
        .cloned()
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "the ConfigMap {} does not contain the key {}",
                reference.name,
                reference.key()
            ))
        })?;

    let copy = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels_for_app(&cluster.name_any(), None)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        data: Some([(CONFIG_MAP_KEY.to_string(), document)].into()),
        ..Default::default()
    };

    info!(config_map = %name, "Applying the seed ConfigMap");

    config_maps
        .patch(
            &name,
            &PatchParams::apply("directory-operator").force(),
            &Patch::Apply(&copy),
        )
        .await
        .map_err(Error::KubeError)?;

    Ok(())
}

/// Seed the replica's PVC from the principal's data and wait for the copy
/// to finish.
#[instrument(skip_all, fields(name = %cluster.name_any(), pvc = %pvc))]
async fn seed_replica(
    client: &Client,
    cluster: &DirectoryCluster,
    principal_pvc: &str,
    pvc: &str,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = seed_job_name(cluster, pvc);

    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);

    info!(job = %name, "Creating the seed job for the replica");
    jobs.create(
        &PostParams::default(),
        &build_seed_job(cluster, principal_pvc, pvc),
    )
    .await
    .map_err(Error::KubeError)?;

    poll::wait_for_job(&jobs, &name).await
}

/// Build the batch job which copies the principal's data onto the new
/// replica's volume before the replica is started.
fn build_seed_job(cluster: &DirectoryCluster, principal_pvc: &str, pvc: &str) -> Job {
    let name = seed_job_name(cluster, pvc);
    let labels = labels_for_app(&cluster.name_any(), Some(pvc));

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                // No PVC label on the job's pods: only replica pods may be
                // counted when the observed membership is rebuilt.
                metadata: Some(ObjectMeta {
                    labels: Some(labels_for_app(&cluster.name_any(), None)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "isvd-seed".to_string(),
                        image: Some(cluster.spec.pods.image.clone()),
                        command: Some(vec!["isvd_seed_replica".to_string()]),
                        env: Some(vec![
                            EnvVar {
                                name: "SEED_SOURCE".to_string(),
                                value: Some(SEED_SOURCE_PATH.to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "SEED_TARGET".to_string(),
                                value: Some(SEED_TARGET_PATH.to_string()),
                                ..Default::default()
                            },
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "seed-source".to_string(),
                                mount_path: SEED_SOURCE_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "seed-target".to_string(),
                                mount_path: SEED_TARGET_PATH.to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "isvd-config".to_string(),
                                mount_path: CONFIG_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "seed-source".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: principal_pvc.to_string(),
                                read_only: Some(true),
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "seed-target".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: pvc.to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "isvd-config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(seed_config_map_name(cluster)),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Replication agreements
// ============================================================================

/// Declare on the principal that the named replica receives updates from it.
async fn create_replication_agreement(
    pods: &Api<Pod>,
    principal_pod: &str,
    replica_id: &str,
) -> Result<()> {
    info!(pod = %principal_pod, replica = %replica_id, "Creating a replication agreement");

    exec::execute_command(
        pods,
        principal_pod,
        &["isvd_manage_replica", "-a", "-i", replica_id],
    )
    .await?;

    Ok(())
}

/// Remove the agreement referencing the named replica from a peer.
async fn delete_replication_agreement(
    pods: &Api<Pod>,
    peer_pod: &str,
    replica_id: &str,
) -> Result<()> {
    info!(pod = %peer_pod, replica = %replica_id, "Deleting an existing replication agreement");

    exec::execute_command(
        pods,
        peer_pod,
        &["isvd_manage_replica", "-r", "-i", replica_id],
    )
    .await?;

    Ok(())
}

// ============================================================================
// Replica deletion
// ============================================================================

/// Delete the replicas which are no longer part of the deployment.
///
/// Victims are processed one at a time so the replication graph stays
/// consistent between steps.
#[instrument(skip_all, fields(name = %cluster.name_any(), to_remove = ?to_remove))]
pub async fn delete_replicas(
    client: &Client,
    cluster: &DirectoryCluster,
    existing: &BTreeMap<String, String>,
    to_remove: &[String],
) -> Result<()> {
    if to_remove.is_empty() {
        return Ok(());
    }

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let doomed: BTreeSet<String> = to_remove.iter().cloned().collect();

    for pvc in to_remove {
        info!(pvc = %pvc, "Deleting the replica");

        let replica_id = replica_pod_name(cluster, pvc);

        for peer_pod in surviving_peers(existing, &doomed) {
            delete_replication_agreement(&pods, peer_pod, &replica_id).await?;
        }

        delete_replica(client, cluster, pvc).await?;
    }

    Ok(())
}

/// Delete a replica's service and pod, waiting for the pod to stop before
/// returning.
async fn delete_replica(client: &Client, cluster: &DirectoryCluster, pvc: &str) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = replica_pod_name(cluster, pvc);

    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    match services.delete(&name, &DeleteParams::default()).await {
        Ok(_) => info!(service = %name, "Deleted the service"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    match pods.delete(&name, &DeleteParams::default()).await {
        Ok(_) => info!(pod = %name, "Deleted the pod"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    poll::wait_for_pod_stop(&pods, &name).await
}
