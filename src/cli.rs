//! The command-line surface (spec.md component C9, section 6).

use clap::{Parser, Subcommand, ValueEnum};

use crate::core::session::BackendKind;
use crate::workspace_sync::SyncMode;

/// Isolated, network-restricted container sessions for AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "paude", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Backend selector shared by every verb; auto-detects when absent
/// (spec.md section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Local,
    Remote,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Local => Self::Local,
            BackendArg::Remote => Self::Remote,
        }
    }
}

/// Sync direction flag for the `sync` verb (spec.md section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncDirectionArg {
    Local,
    Remote,
    Both,
}

impl From<SyncDirectionArg> for SyncMode {
    fn from(value: SyncDirectionArg) -> Self {
        match value {
            SyncDirectionArg::Local => Self::Pull,
            SyncDirectionArg::Remote => Self::Push,
            SyncDirectionArg::Both => Self::Both,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new session bound to a workspace directory.
    Create {
        /// Session name; derived from the workspace when omitted.
        name: Option<String>,
        #[arg(long)]
        backend: Option<BackendArg>,
        /// Skip the assistant's permission prompts.
        #[arg(long)]
        yolo: bool,
        /// Disable network restriction for this session.
        #[arg(long)]
        allow_network: bool,
        #[arg(long)]
        pvc_size: Option<String>,
        #[arg(long)]
        storage_class: Option<String>,
        #[arg(long, default_value_t = 30)]
        credential_timeout: u32,
        /// Workspace directory; defaults to the current directory.
        #[arg(long)]
        workspace: Option<std::path::PathBuf>,
    },
    /// Start a stopped session and wait for readiness.
    Start {
        name: Option<String>,
        #[arg(long)]
        backend: Option<BackendArg>,
        /// Skip the initial workspace sync (remote substrate only).
        #[arg(long)]
        no_sync: bool,
    },
    /// Attach an interactive terminal to a running session.
    Connect {
        name: Option<String>,
        #[arg(long)]
        backend: Option<BackendArg>,
    },
    /// Scale a session down to zero, preserving its volume.
    Stop {
        name: Option<String>,
        #[arg(long)]
        backend: Option<BackendArg>,
        /// Pull workspace changes back before stopping (remote only).
        #[arg(long)]
        sync: bool,
    },
    /// Permanently remove a session and its volume.
    Delete {
        name: String,
        #[arg(long)]
        backend: Option<BackendArg>,
        /// Required: confirms the irreversible delete.
        #[arg(long)]
        confirm: bool,
    },
    /// List every known session across all reachable backends.
    List {
        #[arg(long)]
        backend: Option<BackendArg>,
    },
    /// Synchronize workspace files with a session's persistent volume.
    Sync {
        name: Option<String>,
        #[arg(long)]
        backend: Option<BackendArg>,
        #[arg(short = 'd', long, default_value = "both")]
        direction: SyncDirectionArg,
    },
    /// Internal rsync remote-shell transport (spec.md component C7); not a
    /// user-facing verb. Invoked by `rsync -e` as its own child process, so
    /// it must not appear in `--help` or participate in backend discovery.
    #[command(hide = true, name = "__rsync-shell")]
    RsyncShell {
        backend: BackendArg,
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn cli_definition_is_internally_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn delete_requires_a_positional_name() {
        let parsed = Cli::try_parse_from(["paude", "delete", "--confirm"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn create_accepts_an_optional_name() {
        let parsed = Cli::try_parse_from(["paude", "create"]).unwrap();
        assert!(matches!(parsed.command, Command::Create { name: None, .. }));
    }

    #[test]
    fn sync_direction_defaults_to_both() {
        let parsed = Cli::try_parse_from(["paude", "sync"]).unwrap();
        match parsed.command {
            Command::Sync { direction, .. } => assert_eq!(direction, SyncDirectionArg::Both),
            _ => panic!("expected Sync command"),
        }
    }
}
