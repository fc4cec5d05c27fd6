//! Bounded-interval readiness polling
//!
//! Pods and seed jobs are provisioned asynchronously; the orchestrator
//! serializes on them with [`poll_until`], which turns a predicate into a
//! blocking wait with a fixed interval and an overall deadline. A predicate
//! reports `Ok(true)` when satisfied, `Ok(false)` to keep waiting, and
//! `Err(_)` for a terminal failure that is propagated as-is.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tracing::info;

use crate::error::{Error, Result};

/// How often each predicate is evaluated.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a single wait may take before it fails with a timeout.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll `predicate` immediately and then at `interval` until it is
/// satisfied, fails terminally, or `timeout` elapses.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    what: &str,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if predicate().await? {
            return Ok(());
        }

        if tokio::time::Instant::now() + interval > deadline {
            return Err(Error::PollTimeout {
                timeout,
                what: what.to_string(),
            });
        }

        tokio::time::sleep(interval).await;
    }
}

/// Wait for the named pod to reach Running with its server container ready.
pub async fn wait_for_pod_start(pods: &Api<Pod>, name: &str) -> Result<()> {
    info!(pod = %name, "Waiting for the pod to become ready");

    poll_until(
        POLL_INTERVAL,
        POLL_TIMEOUT,
        &format!("pod {name} to become ready"),
        || async move {
            match pods.get_opt(name).await {
                Ok(Some(pod)) => pod_is_started(&pod),
                // Not created yet, or a transient read failure.
                Ok(None) | Err(_) => Ok(false),
            }
        },
    )
    .await
}

/// Wait for the named pod to stop existing. Purely existence-based; the
/// pod's status is never inspected.
pub async fn wait_for_pod_stop(pods: &Api<Pod>, name: &str) -> Result<()> {
    info!(pod = %name, "Waiting for the pod to stop");

    poll_until(
        POLL_INTERVAL,
        POLL_TIMEOUT,
        &format!("pod {name} to stop"),
        || async move {
            match pods.get_opt(name).await {
                Ok(Some(_)) => Ok(false),
                Ok(None) | Err(_) => Ok(true),
            }
        },
    )
    .await
}

/// Wait for the named job to finish. A failure count is terminal.
pub async fn wait_for_job(jobs: &Api<Job>, name: &str) -> Result<()> {
    info!(job = %name, "Waiting for the job to finish");

    poll_until(
        POLL_INTERVAL,
        POLL_TIMEOUT,
        &format!("job {name} to complete"),
        || async move {
            match jobs.get_opt(name).await {
                Ok(Some(job)) => job_is_complete(&job, name),
                Ok(None) | Err(_) => Ok(false),
            }
        },
    )
    .await
}

/// Whether the pod has started, erring when it reached a terminal phase
/// while we were still waiting for it to come up. Also used by the
/// admission webhook's replica-availability check.
pub(crate) fn pod_is_started(pod: &Pod) -> Result<bool> {
    let status = pod.status.as_ref();

    match status.and_then(|s| s.phase.as_deref()) {
        Some("Running") => {
            let ready = status
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|cs| cs.first())
                .map(|c| c.ready)
                .unwrap_or(false);
            Ok(ready)
        }
        Some("Failed") | Some("Succeeded") => Err(Error::ResourceError(format!(
            "pod {} is no longer running",
            pod.metadata.name.as_deref().unwrap_or_default()
        ))),
        _ => Ok(false),
    }
}

fn job_is_complete(job: &Job, name: &str) -> Result<bool> {
    let status = job.status.clone().unwrap_or_default();

    if status.failed.unwrap_or(0) > 0 {
        return Err(Error::ResourceError(format!("job {name} failed")));
    }

    Ok(status.succeeded.unwrap_or(0) > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn pod_with(phase: &str, ready: Option<bool>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: ready.map(|ready| {
                    vec![ContainerStatus {
                        name: "server".to_string(),
                        ready,
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_exactly_three_polls() {
        let mut calls = 0u32;
        let result = poll_until(
            Duration::from_millis(10),
            Duration::from_secs(1),
            "test",
            || {
                calls += 1;
                let satisfied = calls >= 3;
                async move { Ok(satisfied) }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_satisfied_times_out() {
        let result = poll_until(
            Duration::from_millis(10),
            Duration::from_millis(35),
            "test",
            || async { Ok(false) },
        )
        .await;

        assert!(matches!(result, Err(Error::PollTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_propagated_unmodified() {
        let result = poll_until(
            Duration::from_millis(10),
            Duration::from_secs(1),
            "test",
            || async { Err(Error::ResourceError("the pod is no longer running".to_string())) },
        )
        .await;

        match result {
            Err(Error::ResourceError(msg)) => {
                assert_eq!(msg, "the pod is no longer running");
            }
            other => panic!("expected a terminal resource error, got {other:?}"),
        }
    }

    #[test]
    fn test_pod_running_and_ready_is_started() {
        assert!(pod_is_started(&pod_with("Running", Some(true))).unwrap());
        assert!(!pod_is_started(&pod_with("Running", Some(false))).unwrap());
        assert!(!pod_is_started(&pod_with("Pending", None)).unwrap());
    }

    #[test]
    fn test_pod_terminal_phase_is_an_error_while_starting() {
        assert!(pod_is_started(&pod_with("Failed", None)).is_err());
        assert!(pod_is_started(&pod_with("Succeeded", None)).is_err());
    }

    #[test]
    fn test_job_completion() {
        use k8s_openapi::api::batch::v1::JobStatus;

        let succeeded = Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(job_is_complete(&succeeded, "seed").unwrap());

        let failed = Job {
            status: Some(JobStatus {
                failed: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(job_is_complete(&failed, "seed").is_err());

        let pending = Job::default();
        assert!(!job_is_complete(&pending, "seed").unwrap());
    }
}
