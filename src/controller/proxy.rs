//! Front-end proxy reconfiguration boundary
//!
//! The proxy fans client connections out across the replicas and must learn
//! about membership changes after every add batch. The configuration
//! generator itself lives outside the core; this boundary is invoked once
//! per reconciliation and must stay idempotent.

use kube::Client;

use crate::controller::config::ServerConfig;
use crate::crd::DirectoryCluster;
use crate::error::Result;

/// Regenerate the proxy configuration for the deployment.
///
/// Processing:
///   recreate the proxy configuration from the current replica set
///   if the proxy configuration has changed:
///     restart the proxy and wait for it to come back
///
/// A no-op when nothing changed.
pub async fn deploy_proxy(
    _client: &Client,
    _cluster: &DirectoryCluster,
    _config: &ServerConfig,
) -> Result<()> {
    // TODO: generate the proxy server-groups and suffixes documents once the
    // proxy configuration format is finalised.
    Ok(())
}
