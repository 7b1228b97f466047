//! CLI contract tests: verify the argument surface matches spec.md section 6
//! without executing any command.

use clap::CommandFactory as _;
use paude::cli::{Cli, Command};

#[test]
fn every_subcommand_parses_with_only_its_required_arguments() {
    for args in [
        vec!["paude", "create"],
        vec!["paude", "start"],
        vec!["paude", "connect"],
        vec!["paude", "stop"],
        vec!["paude", "delete", "my-session", "--confirm"],
        vec!["paude", "list"],
        vec!["paude", "sync"],
    ] {
        Cli::try_parse_from(args.clone()).unwrap_or_else(|err| panic!("{args:?} failed to parse: {err}"));
    }
}

#[test]
fn create_accepts_every_flag_from_the_contract_table() {
    let parsed = Cli::try_parse_from([
        "paude",
        "create",
        "my-session",
        "--yolo",
        "--allow-network",
        "--pvc-size",
        "20Gi",
        "--storage-class",
        "fast",
        "--credential-timeout",
        "45",
    ])
    .unwrap();

    match parsed.command {
        Command::Create {
            name,
            yolo,
            allow_network,
            pvc_size,
            storage_class,
            credential_timeout,
            ..
        } => {
            assert_eq!(name.as_deref(), Some("my-session"));
            assert!(yolo);
            assert!(allow_network);
            assert_eq!(pvc_size.as_deref(), Some("20Gi"));
            assert_eq!(storage_class.as_deref(), Some("fast"));
            assert_eq!(credential_timeout, 45);
        }
        other => panic!("expected Create, got {other:?}"),
    }
}

#[test]
fn delete_without_confirm_is_rejected_at_parse_time_by_the_controller_not_clap() {
    // --confirm is a plain bool flag, not `required`, so clap accepts its
    // absence; the controller enforces the contract instead (spec.md 4.6).
    let parsed = Cli::try_parse_from(["paude", "delete", "my-session"]).unwrap();
    assert!(matches!(parsed.command, Command::Delete { confirm: false, .. }));
}

#[test]
fn sync_direction_accepts_all_three_values() {
    for value in ["local", "remote", "both"] {
        Cli::try_parse_from(["paude", "sync", "--direction", value]).unwrap();
    }
}

#[test]
fn cli_definition_is_internally_consistent() {
    Cli::command().debug_assert();
}
