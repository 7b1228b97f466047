//! The two-backend abstraction (spec.md component C1 + C5): one contract
//! that makes the local container engine and the remote cluster
//! interchangeable to everything above them.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::SubstrateErrorKind;
use crate::core::session::{Session, SessionConfig};

/// Outcome of a single non-interactive substrate-client invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A substrate-specific error, already classified into the taxonomy every
/// backend shares (spec.md section 4.1).
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct SubstrateError {
    pub kind: SubstrateErrorKind,
    pub message: String,
}

impl SubstrateError {
    #[must_use]
    pub fn new(kind: SubstrateErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Thin typed wrapper over a substrate's CLI/client (spec.md component C1).
///
/// Argv is always constructed from a vector, never shell-interpolated, and
/// secrets are passed as stdin or environment, never on argv.
#[async_trait]
pub trait SubstrateClient: Send + Sync {
    /// Run a non-interactive command to completion.
    ///
    /// `timeout` of `None` uses the default 30s budget; `Some(Duration::ZERO)`
    /// means no timeout.
    async fn run(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SubstrateError>;

    /// Exec an interactive process, forwarding the caller's stdio and
    /// returning only its exit code. Unbounded: no timeout applies.
    async fn exec_interactive(&self, target: &str, args: &[String]) -> Result<i32, SubstrateError>;
}

/// Readiness outcome of a poll (spec.md section 4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    Failed { detail: String },
    TimedOut,
}

/// CRUD over the substrate's own persistent session objects (spec.md C5/C6).
///
/// There is no separate database: every method here reads or writes the
/// substrate's own object graph (named container + volume, or
/// StatefulSet + PVC), recovering `Session` fields from labels/annotations.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create the stopped persistent object (replicas=0 / `--no-start`).
    ///
    /// Returns `ObjectAlreadyExists` if the name is taken within this
    /// substrate + namespace.
    async fn create(&self, config: &SessionConfig, name: &str) -> Result<Session, SubstrateError>;

    /// Scale up / start the workload. Does not wait for readiness.
    async fn start(&self, name: &str) -> Result<(), SubstrateError>;

    /// Poll readiness every 2s until `Running` is observed or `budget` elapses.
    async fn wait_ready(&self, name: &str, budget: Duration) -> Result<ReadinessOutcome, SubstrateError>;

    /// Scale down to zero. Preserves the volume.
    async fn stop(&self, name: &str) -> Result<(), SubstrateError>;

    /// Idempotently delete the workload, volume, credential objects (by
    /// label), network policy, and proxy objects. Tolerates missing pieces.
    async fn delete(&self, name: &str) -> Result<(), SubstrateError>;

    /// Open an interactive exec into the workload's terminal multiplexer
    /// entrypoint, forwarding the caller's stdio.
    async fn connect(&self, name: &str) -> Result<i32, SubstrateError>;

    /// Exec a non-interactive process inside the workload, piping the
    /// caller's own stdin/stdout/stderr through unmodified. Used as the
    /// remote-shell transport for rsync-over-exec (spec.md component C7);
    /// unlike `connect`, no TTY is allocated.
    async fn exec_piped(&self, name: &str, args: &[String]) -> Result<i32, SubstrateError>;

    /// Look up a single session by name.
    async fn get(&self, name: &str) -> Result<Option<Session>, SubstrateError>;

    /// List every session labeled `app=paude` in this substrate + namespace.
    async fn list(&self) -> Result<Vec<Session>, SubstrateError>;

    /// Absolute path the workload mounts the workspace at
    /// (the original workspace path locally, `/pvc/workspace` remotely).
    fn workload_mount_path(&self, workspace: &Path) -> PathBuf;
}
