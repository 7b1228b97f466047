//! Workspace synchronization (spec.md component C7).
//!
//! The local substrate needs no sync: the workspace is bind-mounted
//! read-write at the same absolute path. The remote substrate has no shared
//! filesystem, so files move over an rsync-over-exec tunnel.

use std::path::Path;

use crate::core::session::BackendKind;

/// Default excludes applied to every remote sync (spec.md section 4.7).
/// `.git` is deliberately absent so history stays readable/writable inside
/// the session.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".venv",
    "venv",
    ".virtualenv",
    "env",
    ".env",
    "__pycache__",
    "*.pyc",
    "node_modules",
];

/// The remote workload's fixed workspace mount path (spec.md 4.7).
pub const REMOTE_WORKSPACE_PATH: &str = "/pvc/workspace";

/// Which way a single rsync leg moves files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local workspace -> remote pod.
    Push,
    /// Remote pod -> local workspace.
    Pull,
}

/// A CLI-level sync request (spec.md `sync` command, section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Push,
    Pull,
    Both,
}

impl SyncMode {
    /// The ordered legs a given mode runs: `both` pushes first, then pulls
    /// (spec.md 4.7 — "push runs first in both").
    #[must_use]
    pub fn legs(self) -> &'static [Direction] {
        match self {
            Self::Push => &[Direction::Push],
            Self::Pull => &[Direction::Pull],
            Self::Both => &[Direction::Push, Direction::Pull],
        }
    }
}

/// Build the `rsync` argv for one leg. The exec transport (kube exec or
/// similar) is expected to wrap this with its own `rsync -e "..."` remote
/// shell invocation; this function only builds the rsync-side flags and
/// source/destination pair.
#[must_use]
pub fn build_rsync_args(local_workspace: &Path, direction: Direction) -> Vec<String> {
    let mut args = vec!["-az".to_owned(), "--no-perms".to_owned(), "--delete".to_owned()];
    for exclude in DEFAULT_EXCLUDES {
        args.push("--exclude".to_owned());
        args.push((*exclude).to_owned());
    }

    let local = format!("{}/", local_workspace.to_string_lossy());
    let remote = format!("{REMOTE_WORKSPACE_PATH}/");

    match direction {
        Direction::Push => {
            args.push(local);
            args.push(remote);
        }
        Direction::Pull => {
            args.push(remote);
            args.push(local);
        }
    }

    args
}

/// Run a sync for `mode`, invoking `run_leg` for each leg in order. Every
/// leg's failure is logged as a warning and swallowed — sync is best-effort
/// and never fails the calling operation (spec.md 4.7).
pub async fn run<F, Fut>(mode: SyncMode, local_workspace: &Path, mut run_leg: F)
where
    F: FnMut(Direction, Vec<String>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    for direction in mode.legs() {
        let args = build_rsync_args(local_workspace, *direction);
        if let Err(err) = run_leg(*direction, args).await {
            tracing::warn!(?direction, error = %err, "workspace sync leg failed, continuing");
        }
    }
}

/// Build the `-e` remote-shell command rsync invokes for the given session:
/// the running binary's own hidden `__rsync-shell` transport, which execs
/// into the session's workload via its backend and pipes rsync's protocol
/// bytes through unmodified (spec.md component C7, the exec-based
/// alternative to an ssh transport).
fn remote_shell_command(backend_kind: BackendKind, name: &str) -> anyhow::Result<String> {
    let exe = std::env::current_exe()?;
    Ok(format!("{} __rsync-shell {backend_kind} {name}", exe.display()))
}

/// Give every argument under the remote workspace mount a placeholder host
/// prefix so rsync treats it as a remote destination/source and invokes its
/// `-e` transport, rather than a second local path.
fn prefix_remote_paths(args: Vec<String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if let Some(rest) = arg.strip_prefix(REMOTE_WORKSPACE_PATH) {
                format!("paude-session:{REMOTE_WORKSPACE_PATH}{rest}")
            } else {
                arg
            }
        })
        .collect()
}

/// Run one rsync leg for real: shells out to the local `rsync` binary with
/// its `-e` transport pointed at this session's exec-based remote shell
/// (spec.md 4.7). Paths under the remote workspace mount are given a
/// placeholder host prefix so rsync actually invokes the `-e` shell instead
/// of treating the destination as another local path.
///
/// # Errors
/// Returns an error if the current executable path cannot be resolved or
/// the `rsync` invocation exits non-zero; both are logged as warnings and
/// swallowed by `run`, never propagated to the caller's operation.
pub async fn run_rsync_leg(backend_kind: BackendKind, name: &str, direction: Direction, args: Vec<String>) -> anyhow::Result<()> {
    let shell_command = remote_shell_command(backend_kind, name)?;
    let mut full_args = vec!["-e".to_owned(), shell_command];
    full_args.extend(prefix_remote_paths(args));

    let status = tokio::process::Command::new("rsync").args(&full_args).status().await?;
    if !status.success() {
        anyhow::bail!("rsync exited with {status}");
    }
    tracing::info!(session = name, ?direction, "workspace sync leg completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn both_mode_pushes_before_pulling() {
        assert_eq!(SyncMode::Both.legs(), &[Direction::Push, Direction::Pull]);
    }

    #[test]
    fn default_excludes_never_contain_git() {
        assert!(!DEFAULT_EXCLUDES.contains(&".git"));
    }

    #[test]
    fn push_args_put_local_before_remote() {
        let args = build_rsync_args(&PathBuf::from("/home/user/project"), Direction::Push);
        let local_index = args.iter().position(|a| a.contains("/home/user/project")).unwrap();
        let remote_index = args.iter().position(|a| a.contains(REMOTE_WORKSPACE_PATH)).unwrap();
        assert!(local_index < remote_index);
    }

    #[test]
    fn pull_args_put_remote_before_local() {
        let args = build_rsync_args(&PathBuf::from("/home/user/project"), Direction::Pull);
        let remote_index = args.iter().position(|a| a.contains(REMOTE_WORKSPACE_PATH)).unwrap();
        let local_index = args.iter().position(|a| a.contains("/home/user/project")).unwrap();
        assert!(remote_index < local_index);
    }

    #[test]
    fn args_always_include_no_perms() {
        let args = build_rsync_args(&PathBuf::from("/x"), Direction::Push);
        assert!(args.iter().any(|a| a == "--no-perms"));
    }

    #[test]
    fn prefix_remote_paths_only_touches_the_remote_side() {
        let args = build_rsync_args(&PathBuf::from("/home/user/project"), Direction::Push);
        let prefixed = prefix_remote_paths(args);
        assert!(prefixed.iter().any(|a| a == "/home/user/project/"));
        assert!(prefixed.iter().any(|a| a == "paude-session:/pvc/workspace/"));
    }

    #[test]
    fn remote_shell_command_embeds_backend_kind_and_session_name() {
        let command = remote_shell_command(BackendKind::Remote, "my-session").unwrap();
        assert!(command.contains("__rsync-shell remote my-session"));
    }

    #[tokio::test]
    async fn run_continues_past_a_failing_leg() {
        let mut calls = Vec::new();
        run(SyncMode::Both, &PathBuf::from("/x"), |direction, _args| {
            calls.push(direction);
            async move {
                if direction == Direction::Push {
                    anyhow::bail!("simulated failure")
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(calls, vec![Direction::Push, Direction::Pull]);
    }
}
