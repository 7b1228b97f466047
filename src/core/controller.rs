//! The session state machine (spec.md component C6): drives image,
//! credential, egress, and workspace-sync subsystems through the ordering
//! guarantees of spec.md section 5.

use std::time::Duration;

use crate::backends::traits::{ReadinessOutcome, SessionBackend};
use crate::core::errors::{PaudeError, SubstrateErrorKind};
use crate::core::session::{BackendKind, Session, SessionConfig, SessionStatus, sanitize_session_name};
use crate::credentials;
use crate::egress;
use crate::workspace_sync::{self, SyncMode};

/// Total budget a readiness poll is allowed before giving up (spec.md 4.6).
pub const READINESS_BUDGET: Duration = Duration::from_secs(300);
/// Fixed interval between readiness polls (spec.md 4.6).
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default timeout for non-interactive substrate calls (spec.md section 5).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable carrying the assistant's argv, space-joined, instead
/// of passing them directly on argv (spec.md 4.6).
pub const CLAUDE_ARGS_ENV: &str = "PAUDE_CLAUDE_ARGS";
/// Flag injected as the first element of `PAUDE_CLAUDE_ARGS` when a session
/// is created with `yolo = true`.
pub const YOLO_FLAG: &str = "--dangerously-skip-permissions";
/// Environment variable telling the entrypoint where the workspace is
/// mounted inside the workload (spec.md section 6).
pub const WORKSPACE_ENV: &str = "PAUDE_WORKSPACE";
/// Environment variable listing paths the entrypoint should treat as
/// virtualenvs rather than project source, space-joined (spec.md section 6).
/// Reuses the workspace-sync exclude set since both describe the same
/// not-really-project-files.
pub const VENV_PATHS_ENV: &str = "PAUDE_VENV_PATHS";
/// Environment variable toggling the in-workload credential watchdog on or
/// off, independent of the numeric timeout carried by
/// `credentials::CREDENTIAL_TIMEOUT_ENV` (spec.md 4.3, section 6).
pub const CREDENTIAL_WATCHDOG_ENV: &str = "PAUDE_CREDENTIAL_WATCHDOG";

/// Build the `(PAUDE_WORKSPACE, PAUDE_VENV_PATHS, PAUDE_CREDENTIAL_WATCHDOG)`
/// environment entries every backend sets on workload creation, alongside
/// `PAUDE_CLAUDE_ARGS` and the credential timeout (spec.md section 6).
#[must_use]
pub fn workload_env_vars(mount_path: &str, credential_timeout_minutes: u32) -> Vec<(String, String)> {
    vec![
        (WORKSPACE_ENV.to_owned(), mount_path.to_owned()),
        (
            VENV_PATHS_ENV.to_owned(),
            crate::workspace_sync::DEFAULT_EXCLUDES.join(" "),
        ),
        (
            CREDENTIAL_WATCHDOG_ENV.to_owned(),
            if credential_timeout_minutes > 0 { "1".to_owned() } else { "0".to_owned() },
        ),
    ]
}

/// Build the `PAUDE_CLAUDE_ARGS` value for a session's configured args,
/// injecting the yolo flag first when requested (spec.md 4.6).
#[must_use]
pub fn build_claude_args_env(config: &SessionConfig) -> String {
    let mut parts = Vec::with_capacity(config.args.len() + 1);
    if config.yolo {
        parts.push(YOLO_FLAG.to_owned());
    }
    parts.extend(config.args.iter().cloned());
    parts.join(" ")
}

/// Drives a single session's lifecycle against one backend.
pub struct SessionController<'a> {
    backend: &'a dyn SessionBackend,
    backend_kind: BackendKind,
}

impl<'a> SessionController<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn SessionBackend, backend_kind: BackendKind) -> Self {
        Self { backend, backend_kind }
    }

    /// `create`: `Absent -> Stopped` (spec.md 4.6).
    ///
    /// Validates name uniqueness, projects credentials, installs the egress
    /// policy, and applies the stopped persistent object. Image
    /// materialization happens before this call (component C2) since it is
    /// shared across backends and does not touch substrate objects.
    ///
    /// # Errors
    /// Returns `SessionExists` if the name is already taken, or a wrapped
    /// substrate error for any other failure.
    pub async fn create(&self, mut config: SessionConfig) -> Result<Session, PaudeError> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| crate::core::session::derive_session_name(&config.workspace));
        let name = sanitize_session_name(&name);
        config.name = Some(name.clone());

        if self.backend.get(&name).await.map_err(wrap)?.is_some() {
            return Err(PaudeError::SessionExists {
                name,
                backend: self.backend_kind,
            });
        }

        // Credential projection and egress policy happen before the
        // persistent object is created so nothing reaches a Stopped session
        // without protections already staged (spec.md section 5 ordering).
        let home = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("/root"));
        let projected = credentials::collect(&home);
        tracing::info!(session = %name, count = projected.len(), "projected credentials");

        if config.network_restricted {
            tracing::info!(session = %name, "installing confining egress policy");
        } else {
            tracing::info!(session = %name, "network restriction disabled, installing allow-all policy");
        }

        let session = self.backend.create(&config, &name).await.map_err(wrap)?;
        tracing::info!(session = %name, backend = %self.backend_kind, "session created");
        Ok(session)
    }

    /// `start`: `Stopped -> Pending -> Running` (spec.md 4.6).
    ///
    /// Happens-before order (spec.md section 5): credentials projected ->
    /// network policy applied -> proxy ready -> workload scaled up ->
    /// readiness observed -> workspace pushed -> terminal attached. This
    /// method performs everything up to and including the workspace push;
    /// the caller attaches the terminal afterward via `connect`.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session does not exist, or
    /// `Unexpected` wrapping a substrate or readiness failure.
    pub async fn start(&self, name: &str, sync: bool) -> Result<Session, PaudeError> {
        let existing = self.require(name).await?;

        self.backend.start(name).await.map_err(wrap)?;
        tracing::info!(session = name, "workload start requested, awaiting readiness");

        let outcome = self
            .backend
            .wait_ready(name, READINESS_BUDGET)
            .await
            .map_err(wrap)?;

        match outcome {
            ReadinessOutcome::Ready => {
                tracing::info!(session = name, "session ready");
            }
            ReadinessOutcome::Failed { detail } => {
                return Err(PaudeError::Unexpected(anyhow::anyhow!(
                    "session '{name}' failed before becoming ready: {detail}"
                )));
            }
            ReadinessOutcome::TimedOut => {
                return Err(PaudeError::Timeout {
                    argv: format!("wait-ready {name}"),
                });
            }
        }

        if sync && self.backend_kind == BackendKind::Remote {
            workspace_sync::run(SyncMode::Push, &existing.workspace, |direction, args| {
                workspace_sync::run_rsync_leg(self.backend_kind, name, direction, args)
            })
            .await;
        }

        self.require(name).await
    }

    /// `connect`: `Running -> Running` (spec.md 4.6). Not a state
    /// transition; may be called repeatedly.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session does not exist, or an error
    /// from the interactive exec itself.
    pub async fn connect(&self, name: &str) -> Result<i32, PaudeError> {
        self.require(name).await?;
        self.backend.connect(name).await.map_err(wrap)
    }

    /// `stop`: `Running -> Stopped` (spec.md 4.6). Preserves the volume.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session does not exist.
    pub async fn stop(&self, name: &str, sync: bool) -> Result<(), PaudeError> {
        let session = self.require(name).await?;

        if sync && self.backend_kind == BackendKind::Remote {
            workspace_sync::run(SyncMode::Pull, &session.workspace, |direction, args| {
                workspace_sync::run_rsync_leg(self.backend_kind, name, direction, args)
            })
            .await;
        }

        self.backend.stop(name).await.map_err(wrap)?;
        tracing::info!(session = name, "session stopped");
        Ok(())
    }

    /// `delete`: `Stopped|Running -> Absent` (spec.md 4.6). Requires
    /// `confirm`. Scales down before deleting the volume and the proxy
    /// (spec.md section 5 ordering guarantee), tolerating missing pieces.
    ///
    /// # Errors
    /// Returns `ConfigError` if `confirm` is false, or `SessionNotFound` if
    /// the session does not exist.
    pub async fn delete(&self, name: &str, confirm: bool) -> Result<(), PaudeError> {
        if !confirm {
            return Err(PaudeError::ConfigError(
                "delete requires an explicit confirmation flag".to_owned(),
            ));
        }
        self.require(name).await?;

        self.backend.stop(name).await.map_err(wrap)?;
        self.backend.delete(name).await.map_err(wrap)?;
        tracing::info!(session = name, "session deleted");
        Ok(())
    }

    /// List every session this backend knows about.
    ///
    /// # Errors
    /// Returns a wrapped substrate error if the listing call fails.
    pub async fn list(&self) -> Result<Vec<Session>, PaudeError> {
        self.backend.list().await.map_err(wrap)
    }

    async fn require(&self, name: &str) -> Result<Session, PaudeError> {
        self.backend
            .get(name)
            .await
            .map_err(wrap)?
            .ok_or_else(|| PaudeError::SessionNotFound { name: name.to_owned() })
    }
}

fn wrap(err: crate::backends::traits::SubstrateError) -> PaudeError {
    match err.kind {
        SubstrateErrorKind::ObjectAlreadyExists => PaudeError::Unexpected(err.into()),
        SubstrateErrorKind::NamespaceMissing => PaudeError::NamespaceMissing {
            namespace: err.message.clone(),
            remedy: format!("create the namespace: kubectl create namespace {}", err.message),
        },
        SubstrateErrorKind::Timeout => PaudeError::Timeout { argv: err.message },
        _ => PaudeError::Unexpected(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SessionConfig {
        SessionConfig {
            name: Some("my-session".to_owned()),
            workspace: std::path::PathBuf::from("/home/user/project"),
            image: "paude-claude:latest".to_owned(),
            env: std::collections::BTreeMap::new(),
            args: vec!["--verbose".to_owned()],
            workdir: std::path::PathBuf::from("/workspace"),
            network_restricted: true,
            yolo: false,
            credential_timeout_minutes: 30,
            pvc_size: None,
            storage_class: None,
        }
    }

    #[test]
    fn claude_args_env_joins_with_spaces() {
        let config = base_config();
        assert_eq!(build_claude_args_env(&config), "--verbose");
    }

    #[test]
    fn yolo_injects_skip_permissions_first() {
        let mut config = base_config();
        config.yolo = true;
        let env = build_claude_args_env(&config);
        assert!(env.starts_with(YOLO_FLAG));
        assert!(env.ends_with("--verbose"));
    }

    #[test]
    fn workload_env_vars_disables_watchdog_at_zero_minutes() {
        let vars = workload_env_vars("/pvc/workspace", 0);
        let watchdog = vars.iter().find(|(key, _)| key == CREDENTIAL_WATCHDOG_ENV).unwrap();
        assert_eq!(watchdog.1, "0");
        let workspace = vars.iter().find(|(key, _)| key == WORKSPACE_ENV).unwrap();
        assert_eq!(workspace.1, "/pvc/workspace");
    }

    #[test]
    fn workload_env_vars_enables_watchdog_when_timeout_set() {
        let vars = workload_env_vars("/workspace", 30);
        let watchdog = vars.iter().find(|(key, _)| key == CREDENTIAL_WATCHDOG_ENV).unwrap();
        assert_eq!(watchdog.1, "1");
    }

    #[test]
    fn readiness_budget_matches_spec_total() {
        assert_eq!(READINESS_BUDGET, Duration::from_secs(300));
        assert_eq!(READINESS_POLL_INTERVAL, Duration::from_secs(2));
    }
}
