//! Error types for the directory operator

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API failures. Transient by assumption, so always retried.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Malformed or incomplete user-supplied configuration. Retrying cannot
    /// succeed until a human corrects the document, so never requeued.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The server configuration document could not be parsed at all.
    #[error("failed to parse the server configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A bounded poll ran out of time before its predicate was satisfied.
    #[error("timed out after {timeout:?} waiting for {what}")]
    PollTimeout { timeout: Duration, what: String },

    /// A pod or job was observed in a terminal failed state while we were
    /// waiting for it. A later pass may recreate the resource.
    #[error("{0}")]
    ResourceError(String),

    /// A remote command executed inside a replica pod reported failure.
    #[error("command failed on pod {pod}: {message}")]
    ExecError { pod: String, message: String },

    /// Admission-time validation failures.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Finalizer bookkeeping failures from the controller runtime.
    #[error("finalizer error: {0}")]
    FinalizerError(String),
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as Finalizer;

        match err {
            Finalizer::ApplyFailed(e) | Finalizer::CleanupFailed(e) => e,
            Finalizer::AddFinalizer(e) | Finalizer::RemoveFinalizer(e) => Error::KubeError(e),
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

impl Error {
    /// Whether the reconciliation should be requeued after this error.
    ///
    /// Configuration and validation errors represent user-authoring mistakes
    /// and are reported once; everything else converges on a later pass.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::ConfigError(_) | Error::YamlError(_) | Error::ValidationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_not_retriable() {
        assert!(!Error::ConfigError("missing".to_string()).is_retriable());
        assert!(!Error::ValidationError("bad".to_string()).is_retriable());
    }

    #[test]
    fn test_timeouts_and_terminal_resources_are_retriable() {
        let timeout = Error::PollTimeout {
            timeout: Duration::from_secs(300),
            what: "pod test to become ready".to_string(),
        };
        assert!(timeout.is_retriable());
        assert!(Error::ResourceError("the pod is no longer running".to_string()).is_retriable());
        assert!(Error::ExecError {
            pod: "inst-a".to_string(),
            message: "exit 1".to_string(),
        }
        .is_retriable());
    }
}
