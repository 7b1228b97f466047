//! Error taxonomy (spec.md section 7) and the substrate-agnostic failure
//! kinds each backend maps its native errors into (spec.md section 4.1).

use thiserror::Error;

use super::session::BackendKind;

/// Substrate-agnostic classification of a failed substrate-client call.
///
/// Every backend (`backends::local`, `backends::remote`) maps its native
/// failures into one of these kinds at the lowest level, per spec.md 4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstrateErrorKind {
    /// The substrate's CLI/client is not installed.
    NotInstalled,
    /// The substrate rejected the call for lack of credentials.
    NotAuthenticated,
    /// The call exceeded its timeout budget.
    Timeout,
    /// The target namespace does not exist.
    NamespaceMissing,
    /// The named object does not exist.
    ObjectNotFound,
    /// An object with this name already exists.
    ObjectAlreadyExists,
    /// The image registry could not be reached.
    RegistryUnreachable,
    /// An image build failed.
    BuildFailed,
    /// A retryable substrate failure (network blip, 5xx).
    TransientSubstrateError,
    /// A non-retryable substrate failure.
    PermanentSubstrateError,
}

/// The user-visible error taxonomy (spec.md section 7).
#[derive(Debug, Error)]
pub enum PaudeError {
    /// The supplied `SessionConfig` was invalid.
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Neither substrate is reachable.
    #[error("no substrate is available ({backend}): {reason}")]
    SubstrateUnavailable {
        /// The backend that was probed.
        backend: BackendKind,
        /// Why it is unavailable.
        reason: String,
    },

    /// The substrate rejected the call for lack of credentials.
    #[error("not authenticated against {backend}: {reason}")]
    NotAuthenticated {
        /// The backend that rejected the call.
        backend: BackendKind,
        /// Detail from the substrate.
        reason: String,
    },

    /// `create` was called with a name already taken.
    #[error("session '{name}' already exists on {backend}")]
    SessionExists {
        /// The conflicting name.
        name: String,
        /// The backend it exists on.
        backend: BackendKind,
    },

    /// `start`/`stop`/`delete`/`connect` referenced a session that does not exist.
    #[error("session '{name}' not found")]
    SessionNotFound {
        /// The name that was looked up.
        name: String,
    },

    /// Image materialization failed.
    #[error("image build failed for session '{session}': {detail}")]
    BuildFailed {
        /// The session the image was being built for.
        session: String,
        /// Captured build phase / log tail.
        detail: String,
    },

    /// All image-delivery strategies were exhausted.
    #[error("registry unreachable for session '{session}': {detail}")]
    RegistryUnreachable {
        /// The session the image was being delivered for.
        session: String,
        /// What was tried and why it failed.
        detail: String,
    },

    /// The remote namespace does not exist.
    #[error("namespace '{namespace}' does not exist: {remedy}")]
    NamespaceMissing {
        /// The missing namespace.
        namespace: String,
        /// A remediation hint (e.g. the `kubectl create namespace` command).
        remedy: String,
    },

    /// A substrate call exceeded its timeout budget.
    #[error("timed out running `{argv}`")]
    Timeout {
        /// The exact argv that timed out, for reproduction.
        argv: String,
    },

    /// An unclassified internal error.
    #[error("unexpected error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl PaudeError {
    /// The process exit code this error should produce (spec.md section 7).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// A short remediation hint shown alongside `NamespaceMissing` and
    /// `RegistryUnreachable`, per spec.md section 7.
    #[must_use]
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::NamespaceMissing { remedy, .. } => Some(remedy.clone()),
            Self::RegistryUnreachable { detail, .. } => {
                Some(format!("retry with an external registry configured: {detail}"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_exists_message_names_session_and_backend() {
        let err = PaudeError::SessionExists {
            name: "foo".to_owned(),
            backend: BackendKind::Local,
        };
        let msg = err.to_string();
        assert!(msg.contains("foo"));
        assert!(msg.contains("local"));
    }

    #[test]
    fn namespace_missing_carries_a_remediation_hint() {
        let err = PaudeError::NamespaceMissing {
            namespace: "ns".to_owned(),
            remedy: "kubectl create namespace ns".to_owned(),
        };
        assert_eq!(
            err.remediation(),
            Some("kubectl create namespace ns".to_owned())
        );
    }

    #[test]
    fn every_error_kind_exits_nonzero() {
        let err = PaudeError::SessionNotFound {
            name: "x".to_owned(),
        };
        assert_eq!(err.exit_code(), 1);
    }
}
