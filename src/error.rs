//! Custom error types for lsi.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while installing or upgrading a landscape.
#[derive(Error, Debug)]
pub enum LsiError {
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Version {0} not found")]
    VersionNotFound(String),

    #[error("No installation step for {component} version {version} defined")]
    NoStepFactory { component: String, version: String },

    #[error("Missing required value: {0}")]
    MissingValue(String),

    #[error("Invalid values: {0}")]
    InvalidValues(String),

    #[error("State values invalid: {0}")]
    InvalidState(String),

    #[error("Unable to add new steps to flow {0} while executing")]
    FlowStarted(String),

    #[error("Key {0} not found")]
    NotFound(String),

    #[error("Timeout exceeded after {timeout:?} waiting for {operation}")]
    TimeoutExceeded {
        operation: String,
        timeout: Duration,
    },

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Command `{command}` failed: {details}")]
    CommandFailed { command: String, details: String },
}

/// Coarse classification used for the user-visible failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transient,
    NotFound,
    Task,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Transient => "transient",
            Self::NotFound => "not-found",
            Self::Task => "task",
        };
        f.write_str(s)
    }
}

impl LsiError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidVersion(_)
            | Self::VersionNotFound(_)
            | Self::NoStepFactory { .. }
            | Self::MissingValue(_)
            | Self::InvalidValues(_)
            | Self::InvalidState(_)
            | Self::FlowStarted(_) => ErrorKind::Configuration,
            Self::TimeoutExceeded { .. } | Self::KubernetesApi(_) => ErrorKind::Transient,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CommandFailed { .. } => ErrorKind::Task,
        }
    }

    /// Returns true if this error signals an absent resource or key.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Find the first `LsiError` in an error chain and report its kind.
/// Errors raised outside the crate (I/O, serde, kube) count as task failures.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|e| e.downcast_ref::<LsiError>())
        .map_or(ErrorKind::Task, LsiError::kind)
}

/// Returns true if the chain contains `LsiError::NotFound`.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<LsiError>())
        .any(LsiError::is_not_found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_display_version_not_found() {
        let err = LsiError::VersionNotFound("v2.0.0".to_string());
        assert_eq!(err.to_string(), "Version v2.0.0 not found");
    }

    #[test]
    fn test_error_display_no_step_factory() {
        let err = LsiError::NoStepFactory {
            component: "gardener".to_string(),
            version: "v1.2.3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No installation step for gardener version v1.2.3 defined"
        );
    }

    #[test]
    fn test_error_display_timeout() {
        let err = LsiError::TimeoutExceeded {
            operation: "read secret".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "Timeout exceeded after 5s waiting for read secret"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LsiError::FlowStarted("root".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(LsiError::NotFound("k".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            LsiError::CommandFailed {
                command: "helm".into(),
                details: "exit 1".into()
            }
            .kind(),
            ErrorKind::Task
        );
    }

    #[test]
    fn test_transient_kinds() {
        assert_eq!(
            LsiError::KubernetesApi("conflict".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            LsiError::TimeoutExceeded {
                operation: "x".into(),
                timeout: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_ne!(
            LsiError::InvalidVersion("x".into()).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_kind_of_walks_context_chain() {
        let err = Err::<(), _>(LsiError::VersionNotFound("v9.0.0".into()))
            .context("resolving installation")
            .unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::Configuration);

        let io = anyhow::anyhow!("disk full");
        assert_eq!(kind_of(&io), ErrorKind::Task);
    }

    #[test]
    fn test_is_not_found_in_chain() {
        let err = Err::<(), _>(LsiError::NotFound("gardener".into()))
            .context("reading component version")
            .unwrap_err();
        assert!(is_not_found(&err));
        assert!(!is_not_found(&anyhow::anyhow!("other")));
    }
}
