//! Local substrate: the rootless container engine (docker or podman) driven
//! as a child process, with session state recovered entirely from container
//! and volume labels (spec.md component C5, local half).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::session::{
    APP_LABEL_KEY, APP_LABEL_VALUE, CREATED_AT_ANNOTATION_KEY, SESSION_LABEL_KEY, Session,
    SessionConfig, SessionStatus, WORKSPACE_ANNOTATION_KEY, decode_workspace_annotation,
    encode_workspace_annotation,
};
use crate::core::errors::SubstrateErrorKind;
use crate::credentials;
use crate::egress;

use super::traits::{CommandOutput, ReadinessOutcome, SessionBackend, SubstrateClient, SubstrateError};

/// The shared internal network every restricted session's workload attaches
/// to (spec.md section 5 — "idempotent, never removed automatically").
pub const INTERNAL_NETWORK: &str = "paude-internal";

/// Budget to wait for the per-session proxy container to reach `running`
/// before starting the workload (spec.md section 5 — "proxy ready" gate).
const PROXY_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// The container engine binary this backend drives (`docker` or `podman`).
pub struct LocalBackend {
    engine: String,
}

impl LocalBackend {
    #[must_use]
    pub fn new(engine: impl Into<String>) -> Self {
        Self { engine: engine.into() }
    }

    /// Prefer podman when present, falling back to docker, matching the
    /// probe order spec.md 4.8 expects ("podman is probed before the
    /// cluster").
    #[must_use]
    pub fn detect() -> Self {
        Self::new("podman")
    }

    fn container_name(name: &str) -> String {
        format!("paude-{name}")
    }

    fn volume_name(name: &str) -> String {
        format!("paude-{name}-data")
    }

    fn proxy_container_name(name: &str) -> String {
        format!("paude-proxy-{name}")
    }

    /// Create and start the per-session forward proxy container (spec.md
    /// 4.4), attached to the internal network so the workload can reach it
    /// and to the default bridge network so it can reach the internet.
    /// Idempotent: a pre-existing proxy container is left alone.
    async fn ensure_proxy_running(&self, config: &SessionConfig, name: &str) -> Result<(), SubstrateError> {
        let proxy_container = Self::proxy_container_name(name);

        let exists = Command::new(&self.engine)
            .args(["inspect", &proxy_container])
            .output()
            .await
            .map_err(engine_missing)?
            .status
            .success();
        if exists {
            let status = Command::new(&self.engine)
                .args(["start", &proxy_container])
                .status()
                .await
                .map_err(engine_missing)?;
            return if status.success() {
                Ok(())
            } else {
                Err(SubstrateError::new(
                    SubstrateErrorKind::PermanentSubstrateError,
                    format!("proxy container '{proxy_container}' could not be restarted"),
                ))
            };
        }

        let status = Command::new(&self.engine)
            .args([
                "run",
                "-d",
                "--name",
                &proxy_container,
                "--label",
                &format!("{APP_LABEL_KEY}=paude-proxy"),
                "--label",
                &format!("{SESSION_LABEL_KEY}={name}"),
                "--network",
                INTERNAL_NETWORK,
            ])
            .arg(egress::proxy_image_reference(&config.image))
            .status()
            .await
            .map_err(engine_missing)?;
        if !status.success() {
            return Err(SubstrateError::new(
                SubstrateErrorKind::PermanentSubstrateError,
                format!("proxy container '{proxy_container}' could not be created"),
            ));
        }

        // Give the proxy a second, unrestricted NIC for egress; the
        // internal network alone would leave it as confined as the
        // workload it serves.
        let _ = Command::new(&self.engine)
            .args(["network", "connect", "bridge", &proxy_container])
            .status()
            .await;

        self.wait_proxy_ready(&proxy_container).await
    }

    async fn wait_proxy_ready(&self, proxy_container: &str) -> Result<(), SubstrateError> {
        let deadline = tokio::time::Instant::now() + PROXY_READY_TIMEOUT;
        loop {
            let output = Command::new(&self.engine)
                .args(["inspect", "--format", "{{.State.Running}}", proxy_container])
                .output()
                .await
                .map_err(engine_missing)?;
            if String::from_utf8_lossy(&output.stdout).trim() == "true" {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SubstrateError::new(
                    SubstrateErrorKind::Timeout,
                    format!("proxy container '{proxy_container}' did not become ready"),
                ));
            }
            tokio::time::sleep(crate::core::controller::READINESS_POLL_INTERVAL).await;
        }
    }

    async fn inspect_label(&self, container: &str, label: &str) -> Option<String> {
        let output = Command::new(&self.engine)
            .args(["inspect", "--format", &format!("{{{{index .Config.Labels \"{label}\"}}}}"), container])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        (!value.is_empty() && value != "<no value>").then_some(value)
    }

    async fn ensure_internal_network(&self) -> Result<(), SubstrateError> {
        let exists = Command::new(&self.engine)
            .args(["network", "inspect", INTERNAL_NETWORK])
            .output()
            .await
            .map_err(engine_missing)?
            .status
            .success();

        if exists {
            return Ok(());
        }

        let status = Command::new(&self.engine)
            .args(["network", "create", "--internal", INTERNAL_NETWORK])
            .status()
            .await
            .map_err(engine_missing)?;

        if !status.success() {
            return Err(SubstrateError::new(
                SubstrateErrorKind::PermanentSubstrateError,
                format!("failed to create internal network '{INTERNAL_NETWORK}'"),
            ));
        }
        Ok(())
    }
}

fn engine_missing(err: std::io::Error) -> SubstrateError {
    SubstrateError::new(
        SubstrateErrorKind::NotInstalled,
        err.to_string(),
    )
}

#[async_trait]
impl SubstrateClient for LocalBackend {
    async fn run(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
        call_timeout: Option<Duration>,
    ) -> Result<CommandOutput, SubstrateError> {
        let mut command = Command::new(&self.engine);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().map_err(engine_missing)?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            use tokio::io::AsyncWriteExt as _;
            pipe.write_all(bytes)
                .await
                .map_err(|err| SubstrateError::new(SubstrateErrorKind::TransientSubstrateError, err.to_string()))?;
        }

        let budget = call_timeout.unwrap_or(crate::core::controller::DEFAULT_CALL_TIMEOUT);
        let output = if budget.is_zero() {
            child.wait_with_output().await
        } else {
            timeout(budget, child.wait_with_output())
                .await
                .map_err(|_| SubstrateError::new(SubstrateErrorKind::Timeout, args.join(" ")))?
        }
        .map_err(|err| SubstrateError::new(SubstrateErrorKind::TransientSubstrateError, err.to_string()))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exec_interactive(&self, target: &str, args: &[String]) -> Result<i32, SubstrateError> {
        let mut full_args = vec!["exec".to_owned(), "-it".to_owned(), target.to_owned()];
        full_args.extend(args.iter().cloned());

        let status = Command::new(&self.engine)
            .args(&full_args)
            .status()
            .await
            .map_err(engine_missing)?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl SessionBackend for LocalBackend {
    async fn create(&self, config: &SessionConfig, name: &str) -> Result<Session, SubstrateError> {
        self.ensure_internal_network().await?;

        let container = Self::container_name(name);
        let volume = Self::volume_name(name);

        let _ = Command::new(&self.engine).args(["volume", "create", &volume]).status().await;

        let mut args = vec![
            "create".to_owned(),
            "--name".to_owned(),
            container.clone(),
            "--label".to_owned(),
            format!("{APP_LABEL_KEY}={APP_LABEL_VALUE}"),
            "--label".to_owned(),
            format!("{WORKSPACE_ANNOTATION_KEY}={}", encode_workspace_annotation(&config.workspace)),
            "--label".to_owned(),
            format!("{CREATED_AT_ANNOTATION_KEY}={}", chrono::Utc::now().to_rfc3339()),
            "-v".to_owned(),
            format!("{}:{}", config.workspace.display(), config.workspace.display()),
            "-v".to_owned(),
            format!("{volume}:/pvc"),
            "-w".to_owned(),
            config.workdir.to_string_lossy().into_owned(),
        ];

        for (key, value) in &config.env {
            args.push("-e".to_owned());
            args.push(format!("{key}={value}"));
        }

        let claude_args_env = crate::core::controller::build_claude_args_env(config);
        args.push("-e".to_owned());
        args.push(format!("{}={claude_args_env}", crate::core::controller::CLAUDE_ARGS_ENV));
        args.push("-e".to_owned());
        args.push(format!(
            "{}={}",
            credentials::CREDENTIAL_TIMEOUT_ENV,
            credentials::watchdog_env_value(config.credential_timeout_minutes)
        ));
        for (key, value) in crate::core::controller::workload_env_vars(
            &self.workload_mount_path(&config.workspace).to_string_lossy(),
            config.credential_timeout_minutes,
        ) {
            args.push("-e".to_owned());
            args.push(format!("{key}={value}"));
        }

        // Credential projection happens unconditionally (spec.md 4.3):
        // whether the workload's network is restricted is orthogonal to
        // whether it should see the user's credentials.
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        for (host_path, container_path, read_only) in credentials::local_bind_mounts(&home) {
            args.push("-v".to_owned());
            let mode = if read_only { "ro" } else { "rw" };
            args.push(format!("{}:{container_path}:{mode}", host_path.display()));
        }
        // Plugin directory, mounted at its original host path so absolute
        // paths seeded into `.claude.json`/`settings.json` keep resolving
        // (original_source/src/paude/mounts.py item 4).
        let plugins_dir = home.join(".claude").join("plugins");
        if plugins_dir.is_dir() {
            args.push("-v".to_owned());
            args.push(format!("{}:{}:ro", plugins_dir.display(), plugins_dir.display()));
        }

        if config.network_restricted {
            self.ensure_proxy_running(config, name).await?;

            args.push("--network".to_owned());
            args.push(INTERNAL_NETWORK.to_owned());
            for (key, value) in egress::proxy_env_vars(&Self::proxy_container_name(name), egress::PROXY_PORT) {
                args.push("-e".to_owned());
                args.push(format!("{key}={value}"));
            }
        }

        args.push(config.image.clone());

        let status = Command::new(&self.engine)
            .args(&args)
            .status()
            .await
            .map_err(engine_missing)?;

        if !status.success() {
            return Err(SubstrateError::new(
                SubstrateErrorKind::ObjectAlreadyExists,
                format!("container '{container}' could not be created (exit {status})"),
            ));
        }

        Ok(Session {
            name: name.to_owned(),
            status: SessionStatus::Stopped,
            workspace: config.workspace.clone(),
            created_at: chrono::Utc::now(),
            backend: crate::core::session::BackendKind::Local,
            container_id: Some(container),
            volume_name: Some(volume),
        })
    }

    async fn start(&self, name: &str) -> Result<(), SubstrateError> {
        let container = Self::container_name(name);
        let proxy_container = Self::proxy_container_name(name);
        let proxy_exists = Command::new(&self.engine)
            .args(["inspect", &proxy_container])
            .output()
            .await
            .map_err(engine_missing)?
            .status
            .success();
        if proxy_exists {
            let _ = Command::new(&self.engine).args(["start", &proxy_container]).status().await;
            self.wait_proxy_ready(&proxy_container).await?;
        }

        let status = Command::new(&self.engine)
            .args(["start", &container])
            .status()
            .await
            .map_err(engine_missing)?;
        if !status.success() {
            return Err(SubstrateError::new(
                SubstrateErrorKind::ObjectNotFound,
                format!("container '{container}' could not be started"),
            ));
        }
        Ok(())
    }

    async fn wait_ready(&self, name: &str, budget: Duration) -> Result<ReadinessOutcome, SubstrateError> {
        let container = Self::container_name(name);
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let output = Command::new(&self.engine)
                .args(["inspect", "--format", "{{.State.Status}}", &container])
                .output()
                .await
                .map_err(engine_missing)?;
            let state = String::from_utf8_lossy(&output.stdout).trim().to_owned();

            match state.as_str() {
                "running" => return Ok(ReadinessOutcome::Ready),
                "exited" | "dead" => {
                    return Ok(ReadinessOutcome::Failed {
                        detail: format!("container entered state '{state}'"),
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(ReadinessOutcome::TimedOut);
            }
            tokio::time::sleep(crate::core::controller::READINESS_POLL_INTERVAL).await;
        }
    }

    async fn stop(&self, name: &str) -> Result<(), SubstrateError> {
        let container = Self::container_name(name);
        let proxy_container = Self::proxy_container_name(name);
        let _ = Command::new(&self.engine).args(["stop", &container]).status().await;
        let _ = Command::new(&self.engine).args(["stop", &proxy_container]).status().await;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SubstrateError> {
        let container = Self::container_name(name);
        let proxy_container = Self::proxy_container_name(name);
        let volume = Self::volume_name(name);
        let _ = Command::new(&self.engine).args(["rm", "-f", &container]).status().await;
        let _ = Command::new(&self.engine).args(["rm", "-f", &proxy_container]).status().await;
        let _ = Command::new(&self.engine).args(["volume", "rm", "-f", &volume]).status().await;
        Ok(())
    }

    async fn connect(&self, name: &str) -> Result<i32, SubstrateError> {
        let container = Self::container_name(name);
        self.exec_interactive(&container, &["tmux".to_owned(), "attach".to_owned(), "-t".to_owned(), "main".to_owned()])
            .await
    }

    async fn get(&self, name: &str) -> Result<Option<Session>, SubstrateError> {
        let container = Self::container_name(name);
        let app_label = self.inspect_label(&container, APP_LABEL_KEY).await;
        let Some(app_label) = app_label else {
            return Ok(None);
        };
        if app_label != APP_LABEL_VALUE {
            return Ok(None);
        }

        let workspace_label = self.inspect_label(&container, WORKSPACE_ANNOTATION_KEY).await;
        let workspace = workspace_label
            .as_deref()
            .and_then(|value| decode_workspace_annotation(value).ok())
            .unwrap_or_default();

        let state_output = Command::new(&self.engine)
            .args(["inspect", "--format", "{{.State.Status}}", &container])
            .output()
            .await
            .map_err(engine_missing)?;
        let state = String::from_utf8_lossy(&state_output.stdout).trim().to_owned();
        let status = if state == "running" {
            SessionStatus::Running
        } else {
            SessionStatus::Stopped
        };

        Ok(Some(Session {
            name: name.to_owned(),
            status,
            workspace,
            created_at: chrono::Utc::now(),
            backend: crate::core::session::BackendKind::Local,
            container_id: Some(container),
            volume_name: Some(Self::volume_name(name)),
        }))
    }

    async fn list(&self) -> Result<Vec<Session>, SubstrateError> {
        let output = Command::new(&self.engine)
            .args([
                "ps",
                "-a",
                "--filter",
                &format!("label={APP_LABEL_KEY}={APP_LABEL_VALUE}"),
                "--format",
                "{{.Names}}",
            ])
            .output()
            .await
            .map_err(engine_missing)?;

        let mut sessions = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some(name) = line.strip_prefix("paude-") {
                if let Some(session) = self.get(name).await? {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn exec_piped(&self, name: &str, args: &[String]) -> Result<i32, SubstrateError> {
        let container = Self::container_name(name);
        let mut full_args = vec!["exec".to_owned(), "-i".to_owned(), container];
        full_args.extend(args.iter().cloned());

        let status = Command::new(&self.engine)
            .args(&full_args)
            .status()
            .await
            .map_err(engine_missing)?;
        Ok(status.code().unwrap_or(-1))
    }

    fn workload_mount_path(&self, workspace: &Path) -> PathBuf {
        workspace.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_namespaced() {
        assert_eq!(LocalBackend::container_name("my-session"), "paude-my-session");
    }

    #[test]
    fn volume_name_is_namespaced_and_distinct_from_container() {
        assert_eq!(LocalBackend::volume_name("my-session"), "paude-my-session-data");
        assert_ne!(
            LocalBackend::container_name("my-session"),
            LocalBackend::volume_name("my-session")
        );
    }

    #[test]
    fn workload_mount_path_preserves_the_original_path() {
        let backend = LocalBackend::new("podman");
        let workspace = PathBuf::from("/home/user/project");
        assert_eq!(backend.workload_mount_path(&workspace), workspace);
    }
}
