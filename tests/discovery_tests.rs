#![allow(clippy::unwrap_used, reason = "test code")]

//! Session discovery tests: explicit name, workspace match, and singleton
//! fallback, exercised across two `MockBackend` probes the way `main.rs`
//! wires the local and remote substrates together (spec.md component C8).

use std::collections::BTreeMap;
use std::path::PathBuf;

use paude::backends::{MockBackend, SessionBackend};
use paude::core::session::{BackendKind, SessionConfig};
use paude::core::{Probe, Resolution};

fn config(workspace: &str) -> SessionConfig {
    SessionConfig {
        name: None,
        workspace: PathBuf::from(workspace),
        image: "img".to_owned(),
        env: BTreeMap::new(),
        args: Vec::new(),
        workdir: PathBuf::from("/workspace"),
        network_restricted: true,
        yolo: false,
        credential_timeout_minutes: 30,
        pvc_size: None,
        storage_class: None,
    }
}

#[tokio::test]
async fn resolve_finds_the_only_session_across_both_substrates() {
    let local = MockBackend::new(BackendKind::Local);
    local.create(&config("/home/user/project"), "only-one").await.unwrap();
    let remote = MockBackend::new(BackendKind::Remote);

    let probes = vec![
        Probe { kind: BackendKind::Local, backend: &local },
        Probe { kind: BackendKind::Remote, backend: &remote },
    ];

    let resolution = paude::core::discovery::resolve(&probes, None, None, &PathBuf::from("/elsewhere")).await;
    match resolution {
        Resolution::Found(candidate) => assert_eq!(candidate.session.name, "only-one"),
        other => panic!("expected a unique match, got {other:?}"),
    }
}

#[tokio::test]
async fn resolve_prefers_a_workspace_match_over_the_singleton_fallback() {
    let local = MockBackend::new(BackendKind::Local);
    local.create(&config("/home/user/project-a"), "a").await.unwrap();
    local.create(&config("/home/user/project-b"), "b").await.unwrap();

    let probes = vec![Probe { kind: BackendKind::Local, backend: &local }];

    let resolution = paude::core::discovery::resolve(&probes, None, None, &PathBuf::from("/home/user/project-b")).await;
    match resolution {
        Resolution::Found(candidate) => assert_eq!(candidate.session.name, "b"),
        other => panic!("expected the workspace match, got {other:?}"),
    }
}

#[tokio::test]
async fn resolve_reports_ambiguity_when_neither_strategy_narrows_it_down() {
    let local = MockBackend::new(BackendKind::Local);
    local.create(&config("/home/user/project-a"), "a").await.unwrap();
    local.create(&config("/home/user/project-b"), "b").await.unwrap();

    let probes = vec![Probe { kind: BackendKind::Local, backend: &local }];

    let resolution = paude::core::discovery::resolve(&probes, None, None, &PathBuf::from("/elsewhere")).await;
    assert!(matches!(resolution, Resolution::Ambiguous(candidates) if candidates.len() == 2));
}

#[tokio::test]
async fn resolve_by_explicit_name_ignores_the_current_workspace() {
    let local = MockBackend::new(BackendKind::Local);
    local.create(&config("/home/user/project-a"), "a").await.unwrap();

    let probes = vec![Probe { kind: BackendKind::Local, backend: &local }];

    let resolution = paude::core::discovery::resolve(&probes, Some("a"), None, &PathBuf::from("/nowhere-near-it")).await;
    assert!(matches!(resolution, Resolution::Found(candidate) if candidate.session.name == "a"));
}

#[tokio::test]
async fn resolve_by_name_returns_not_found_for_an_unknown_session() {
    let local = MockBackend::new(BackendKind::Local);
    let probes = vec![Probe { kind: BackendKind::Local, backend: &local }];

    let resolution = paude::core::discovery::resolve(&probes, Some("nope"), None, &PathBuf::from("/x")).await;
    assert!(matches!(resolution, Resolution::NotFound));
}
