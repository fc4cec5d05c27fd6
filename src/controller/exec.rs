//! Remote command execution inside replica pods
//!
//! Replication agreements are managed by the directory server itself, so
//! the operator drives them with `isvd_manage_replica` invocations through
//! the pod exec subresource.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Execute `command` inside the named pod, capturing its output.
///
/// Returns the captured stdout on success. A non-success termination status
/// is reported as an [`Error::ExecError`] carrying the captured stderr.
pub async fn execute_command(pods: &Api<Pod>, pod: &str, command: &[&str]) -> Result<String> {
    info!(pod = %pod, ?command, "Executing a command");

    let params = AttachParams::default().stdout(true).stderr(true);
    let mut attached = pods
        .exec(pod, command.iter().copied(), &params)
        .await
        .map_err(Error::KubeError)?;

    let status = attached.take_status();

    let mut stdout = String::new();
    if let Some(mut reader) = attached.stdout() {
        reader.read_to_string(&mut stdout).await.ok();
    }

    let mut stderr = String::new();
    if let Some(mut reader) = attached.stderr() {
        reader.read_to_string(&mut stderr).await.ok();
    }

    let status = match status {
        Some(status) => status.await,
        None => None,
    };

    attached.join().await.map_err(|e| Error::ExecError {
        pod: pod.to_string(),
        message: e.to_string(),
    })?;

    if let Some(status) = status {
        if status.status.as_deref() == Some("Failure") {
            let message = status
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| stderr.trim_end().to_string());

            error!(pod = %pod, ?command, %message, "Command failed");

            return Err(Error::ExecError {
                pod: pod.to_string(),
                message,
            });
        }
    }

    Ok(stdout)
}
