//! The `Session` value type and the naming/annotation rules that make it
//! portable across backends without a central registry.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Execution substrate a session lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local rootless container engine (docker/podman).
    Local,
    /// Remote Kubernetes-compatible cluster.
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => anyhow::bail!("unknown backend '{other}', expected 'local' or 'remote'"),
        }
    }
}

/// Derived, never-stored-separately session status (spec.md section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No workload exists (or it is scaled to zero); the volume may still exist.
    Stopped,
    /// The workload has been asked to start and readiness has not yet been observed.
    Pending,
    /// The workload exists, is labeled with the session name, and passes readiness.
    Running,
    /// The workload reported `Failed`/`Error` before the readiness budget expired.
    Error,
}

/// A persistent, reattachable session bound to a host workspace.
///
/// Every field here is either recovered from the substrate's own object graph
/// (labels, annotations, spec) or derived from it — there is no separate
/// session database (spec.md section 4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique within the containing substrate + namespace.
    pub name: String,
    /// Derived from the substrate's own state, never stored separately.
    pub status: SessionStatus,
    /// Absolute host path of the user's project directory.
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub backend: BackendKind,
    /// Local: docker/podman container ID. Remote: unused (pod name is deterministic).
    pub container_id: Option<String>,
    /// Local: docker volume name. Remote: PVC name.
    pub volume_name: Option<String>,
}

/// Value object supplied at session creation (spec.md section 3).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: Option<String>,
    pub workspace: PathBuf,
    pub image: String,
    pub env: std::collections::BTreeMap<String, String>,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub network_restricted: bool,
    pub yolo: bool,
    pub credential_timeout_minutes: u32,
    pub pvc_size: Option<String>,
    pub storage_class: Option<String>,
}

/// Fixed labels shared by every substrate object belonging to this system.
pub const APP_LABEL_KEY: &str = "app";
pub const APP_LABEL_VALUE: &str = "paude";
/// Label carrying the owning session's name, used for cascaded delete by selector.
pub const SESSION_LABEL_KEY: &str = "paude.io/session-name";
/// Annotation carrying the base64-encoded absolute workspace path.
pub const WORKSPACE_ANNOTATION_KEY: &str = "paude.io/workspace";
/// Annotation carrying the RFC3339 creation instant.
pub const CREATED_AT_ANNOTATION_KEY: &str = "paude.io/created-at";

/// Encode an absolute workspace path into the annotation's base64 form.
#[must_use]
pub fn encode_workspace_annotation(path: &Path) -> String {
    BASE64.encode(path.to_string_lossy().as_bytes())
}

/// Decode a workspace annotation back into a path.
///
/// # Errors
/// Returns an error if the value is not valid base64 or not valid UTF-8.
pub fn decode_workspace_annotation(value: &str) -> anyhow::Result<PathBuf> {
    let bytes = BASE64.decode(value)?;
    let s = String::from_utf8(bytes)?;
    Ok(PathBuf::from(s))
}

/// Sanitize a user-supplied or derived session name to the intersection of
/// "valid container name" and "valid DNS label": lower-case alphanumeric and
/// `-`, 1-63 chars, no leading/trailing `-`.
#[must_use]
pub fn sanitize_session_name(raw: &str) -> String {
    let lowered: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = lowered.trim_matches('-');
    let truncated = if trimmed.len() > 63 {
        trimmed[..63].trim_end_matches('-')
    } else {
        trimmed
    };

    if truncated.is_empty() {
        "session".to_owned()
    } else {
        truncated.to_owned()
    }
}

/// Derive a session name from the workspace basename plus a short hash of the
/// absolute workspace path, used when the caller does not supply a name.
#[must_use]
pub fn derive_session_name(workspace: &Path) -> String {
    let base = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_owned());

    let mut hasher = Sha256::new();
    hasher.update(workspace.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let suffix = hex::encode(&digest[..4]);

    let sanitized_base = sanitize_session_name(&base);
    // Reserve room for "-" + 8 hex chars within the 63-char DNS-label budget.
    let budget = 63 - 1 - suffix.len();
    let truncated_base = if sanitized_base.len() > budget {
        sanitized_base[..budget].trim_end_matches('-').to_owned()
    } else {
        sanitized_base
    };

    format!("{truncated_base}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces_invalid_chars() {
        assert_eq!(sanitize_session_name("My Project!"), "my-project-");
    }

    #[test]
    fn sanitize_trims_leading_and_trailing_dashes() {
        assert_eq!(sanitize_session_name("--foo--"), "foo");
    }

    #[test]
    fn sanitize_truncates_to_63_chars() {
        let long = "a".repeat(100);
        let sanitized = sanitize_session_name(&long);
        assert!(sanitized.len() <= 63);
    }

    #[test]
    fn sanitize_never_produces_empty_string() {
        assert_eq!(sanitize_session_name("###"), "session");
    }

    #[test]
    fn workspace_annotation_roundtrips() {
        let path = PathBuf::from("/home/user/projects/my-app");
        let encoded = encode_workspace_annotation(&path);
        let decoded = decode_workspace_annotation(&encoded).unwrap();
        assert_eq!(decoded, path);
    }

    #[test]
    fn derive_session_name_is_deterministic() {
        let workspace = PathBuf::from("/home/user/projects/my-app");
        assert_eq!(
            derive_session_name(&workspace),
            derive_session_name(&workspace)
        );
    }

    #[test]
    fn derive_session_name_differs_for_different_paths() {
        let a = derive_session_name(&PathBuf::from("/home/user/a"));
        let b = derive_session_name(&PathBuf::from("/home/user/b"));
        assert_ne!(a, b);
    }

    #[test]
    fn backend_kind_roundtrips_through_display_and_fromstr() {
        use std::str::FromStr;
        assert_eq!(BackendKind::from_str("local").unwrap(), BackendKind::Local);
        assert_eq!(BackendKind::from_str("remote").unwrap(), BackendKind::Remote);
        assert!(BackendKind::from_str("bogus").is_err());
    }
}
