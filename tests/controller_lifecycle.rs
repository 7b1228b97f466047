#![allow(clippy::unwrap_used, reason = "test code")]

//! Controller lifecycle tests: exercise `SessionController` end to end
//! against `MockBackend`, asserting the ordering guarantees of spec.md
//! section 5 by inspecting the backend's recorded call sequence.

use std::collections::BTreeMap;
use std::path::PathBuf;

use paude::backends::MockBackend;
use paude::backends::mock::RecordedCall;
use paude::core::session::{BackendKind, SessionConfig};
use paude::core::SessionController;

fn config(workspace: &str) -> SessionConfig {
    SessionConfig {
        name: None,
        workspace: PathBuf::from(workspace),
        image: "paude-claude-amd64:1.0.0".to_owned(),
        env: BTreeMap::new(),
        args: vec!["--model".to_owned(), "sonnet".to_owned()],
        workdir: PathBuf::from("/workspace"),
        network_restricted: true,
        yolo: false,
        credential_timeout_minutes: 30,
        pvc_size: None,
        storage_class: None,
    }
}

#[tokio::test]
async fn create_derives_a_name_from_the_workspace_basename() {
    let backend = MockBackend::new(BackendKind::Local);
    let controller = SessionController::new(&backend, BackendKind::Local);

    let session = controller.create(config("/home/user/my-project")).await.unwrap();
    assert!(session.name.starts_with("my-project-"));
}

#[tokio::test]
async fn create_rejects_a_name_already_in_use() {
    let backend = MockBackend::new(BackendKind::Local);
    let controller = SessionController::new(&backend, BackendKind::Local);

    let mut first = config("/home/user/my-project");
    first.name = Some("taken".to_owned());
    controller.create(first).await.unwrap();

    let mut second = config("/home/user/other-project");
    second.name = Some("taken".to_owned());
    let result = controller.create(second).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn start_waits_for_readiness_before_returning() {
    let backend = MockBackend::new(BackendKind::Local);
    let controller = SessionController::new(&backend, BackendKind::Local);

    let mut cfg = config("/home/user/my-project");
    cfg.name = Some("sess".to_owned());
    controller.create(cfg).await.unwrap();

    let session = controller.start("sess", false).await.unwrap();
    assert_eq!(session.status, paude::core::session::SessionStatus::Running);

    let calls = backend.calls();
    let start_index = calls.iter().position(|c| *c == RecordedCall::Start("sess".to_owned())).unwrap();
    let ready_index = calls.iter().position(|c| *c == RecordedCall::WaitReady("sess".to_owned())).unwrap();
    assert!(start_index < ready_index, "workload must be started before readiness is polled");
}

#[tokio::test]
async fn delete_without_confirm_is_rejected() {
    let backend = MockBackend::new(BackendKind::Local);
    let controller = SessionController::new(&backend, BackendKind::Local);

    let mut cfg = config("/home/user/my-project");
    cfg.name = Some("sess".to_owned());
    controller.create(cfg).await.unwrap();

    let result = controller.delete("sess", false).await;
    assert!(result.is_err());
    assert!(backend.calls().iter().all(|c| *c != RecordedCall::Delete("sess".to_owned())));
}

#[tokio::test]
async fn delete_stops_the_workload_before_removing_it() {
    let backend = MockBackend::new(BackendKind::Remote);
    let controller = SessionController::new(&backend, BackendKind::Remote);

    let mut cfg = config("/home/user/my-project");
    cfg.name = Some("sess".to_owned());
    controller.create(cfg).await.unwrap();
    controller.start("sess", false).await.unwrap();

    controller.delete("sess", true).await.unwrap();

    let calls = backend.calls();
    let stop_index = calls.iter().rposition(|c| *c == RecordedCall::Stop("sess".to_owned())).unwrap();
    let delete_index = calls.iter().position(|c| *c == RecordedCall::Delete("sess".to_owned())).unwrap();
    assert!(stop_index < delete_index, "delete must scale the workload down before removing it");

    assert!(controller.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn readiness_timeout_surfaces_as_a_timeout_error() {
    let backend = MockBackend::new(BackendKind::Local);
    *backend.forced_readiness.lock().unwrap() = Some(paude::backends::ReadinessOutcome::TimedOut);
    let controller = SessionController::new(&backend, BackendKind::Local);

    let mut cfg = config("/home/user/my-project");
    cfg.name = Some("sess".to_owned());
    controller.create(cfg).await.unwrap();

    let result = controller.start("sess", false).await;
    assert!(matches!(result, Err(paude::core::errors::PaudeError::Timeout { .. })));
}

#[tokio::test]
async fn readiness_failure_surfaces_with_the_captured_detail() {
    let backend = MockBackend::new(BackendKind::Local);
    *backend.forced_readiness.lock().unwrap() = Some(paude::backends::ReadinessOutcome::Failed {
        detail: "container exited with code 1".to_owned(),
    });
    let controller = SessionController::new(&backend, BackendKind::Local);

    let mut cfg = config("/home/user/my-project");
    cfg.name = Some("sess".to_owned());
    controller.create(cfg).await.unwrap();

    let result = controller.start("sess", false).await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("container exited with code 1"));
}
