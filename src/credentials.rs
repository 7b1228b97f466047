//! Credential projection (spec.md component C3): read a fixed allowlist of
//! host credential files and materialize them into a session's workload
//! without ever handing the workload a live, reusable token to copy around.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::core::session::{APP_LABEL_KEY, APP_LABEL_VALUE, SESSION_LABEL_KEY};

/// Environment variable naming the credential watchdog window, in minutes.
/// The container-side entrypoint is contracted to refresh or expire
/// credentials within this window; `0` disables the watchdog.
pub const CREDENTIAL_TIMEOUT_ENV: &str = "PAUDE_CREDENTIAL_TIMEOUT";

/// Whether a projected credential file is sensitive (goes into a Secret
/// remotely, never logged) or safe to treat as plain configuration (a
/// ConfigMap remotely).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Secret,
    Config,
}

/// One allowlisted credential path, relative to the user's home directory,
/// and the in-container path it is projected to.
#[derive(Debug, Clone)]
pub struct CredentialSpec {
    pub home_relative: &'static str,
    pub container_path: &'static str,
    pub sensitivity: Sensitivity,
}

/// The fixed allowlist (spec.md section 4.3). Nothing outside this list is
/// ever read, and in particular nothing else under `.claude/` (logs, project
/// history, cache) is touched.
pub const ALLOWLIST: &[CredentialSpec] = &[
    CredentialSpec {
        home_relative: ".config/gcloud/application_default_credentials.json",
        container_path: "/home/agent/.config/gcloud/application_default_credentials.json",
        sensitivity: Sensitivity::Secret,
    },
    CredentialSpec {
        home_relative: ".config/gcloud/credentials.db",
        container_path: "/home/agent/.config/gcloud/credentials.db",
        sensitivity: Sensitivity::Secret,
    },
    CredentialSpec {
        home_relative: ".config/gcloud/access_tokens.db",
        container_path: "/home/agent/.config/gcloud/access_tokens.db",
        sensitivity: Sensitivity::Secret,
    },
    CredentialSpec {
        home_relative: ".gitconfig",
        container_path: "/home/agent/.gitconfig",
        sensitivity: Sensitivity::Config,
    },
    CredentialSpec {
        home_relative: ".claude.json",
        container_path: "/home/agent/.claude.json",
        sensitivity: Sensitivity::Secret,
    },
    CredentialSpec {
        home_relative: ".claude/settings.json",
        container_path: "/home/agent/.claude/settings.json",
        sensitivity: Sensitivity::Config,
    },
    CredentialSpec {
        home_relative: ".claude/credentials.json",
        container_path: "/home/agent/.claude/credentials.json",
        sensitivity: Sensitivity::Secret,
    },
    CredentialSpec {
        home_relative: ".claude/statsig.json",
        container_path: "/home/agent/.claude/statsig.json",
        sensitivity: Sensitivity::Config,
    },
];

/// One credential file successfully read off the host, ready for projection.
#[derive(Debug, Clone)]
pub struct ProjectedCredential {
    pub spec_index: usize,
    pub container_path: String,
    pub sensitivity: Sensitivity,
    pub content: Vec<u8>,
}

/// Read every allowlisted file that exists under `home`, silently skipping
/// any that cannot be read (spec.md 4.3: "the projector never aborts the
/// session for credential absence").
pub fn collect(home: &Path) -> Vec<ProjectedCredential> {
    ALLOWLIST
        .iter()
        .enumerate()
        .filter_map(|(index, spec)| {
            let host_path: PathBuf = home.join(spec.home_relative);
            match std::fs::read(&host_path) {
                Ok(content) => Some(ProjectedCredential {
                    spec_index: index,
                    container_path: spec.container_path.to_owned(),
                    sensitivity: spec.sensitivity,
                    content,
                }),
                Err(err) => {
                    tracing::debug!(
                        path = %host_path.display(),
                        error = %err,
                        "credential file not present, skipping"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Bind-mount specs for the local substrate: `(host_path, container_path,
/// read_only)`. The caller is responsible for only mounting files that exist.
#[must_use]
pub fn local_bind_mounts(home: &Path) -> Vec<(PathBuf, String, bool)> {
    ALLOWLIST
        .iter()
        .filter_map(|spec| {
            let host_path = home.join(spec.home_relative);
            host_path
                .exists()
                .then(|| (host_path, spec.container_path.to_owned(), true))
        })
        .collect()
}

/// Base64-encode credential content the way a remote Secret/ConfigMap
/// `data` map requires.
#[must_use]
pub fn base64_encode(content: &[u8]) -> String {
    BASE64.encode(content)
}

/// Derive a Secret/ConfigMap data key from an in-container path: the only
/// characters a Kubernetes object's `data` map keys allow are alphanumerics,
/// `-`, `_`, and `.`, so every `/` becomes a `-`.
#[must_use]
pub fn data_key(container_path: &str) -> String {
    container_path.trim_start_matches('/').replace('/', "-")
}

/// Labels applied to every generated Secret/ConfigMap so cascaded deletion
/// (spec.md 4.3, 4.6) can find them by session name.
#[must_use]
pub fn credential_object_labels(session_name: &str) -> std::collections::BTreeMap<String, String> {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(APP_LABEL_KEY.to_owned(), APP_LABEL_VALUE.to_owned());
    labels.insert(SESSION_LABEL_KEY.to_owned(), session_name.to_owned());
    labels
}

/// Resolve the effective watchdog timeout, clamped to non-negative minutes.
/// `0` disables the watchdog per spec.md 4.3.
#[must_use]
pub fn watchdog_env_value(credential_timeout_minutes: u32) -> String {
    credential_timeout_minutes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_skips_missing_files_without_erroring() {
        let tmp = tempfile::tempdir().unwrap();
        let collected = collect(tmp.path());
        assert!(collected.is_empty());
    }

    #[test]
    fn collect_reads_present_allowlisted_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".gitconfig"), b"[user]\nname = test\n").unwrap();

        let collected = collect(tmp.path());
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].container_path, "/home/agent/.gitconfig");
    }

    #[test]
    fn collect_never_reads_outside_the_allowlist() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".claude")).unwrap();
        std::fs::write(tmp.path().join(".claude/history.log"), b"secret session log").unwrap();

        let collected = collect(tmp.path());
        assert!(collected.is_empty());
    }

    #[test]
    fn watchdog_zero_means_disabled() {
        assert_eq!(watchdog_env_value(0), "0");
    }

    #[test]
    fn credential_object_labels_carry_session_name() {
        let labels = credential_object_labels("my-session");
        assert_eq!(labels.get(SESSION_LABEL_KEY), Some(&"my-session".to_owned()));
    }

    #[test]
    fn data_key_flattens_slashes() {
        assert_eq!(data_key("/home/agent/.claude/credentials.json"), "home-agent-.claude-credentials.json");
    }
}
