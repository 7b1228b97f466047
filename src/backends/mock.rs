//! An in-memory `SessionBackend` double for exercising the controller and
//! discovery logic without a real container engine or cluster.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::session::{BackendKind, Session, SessionConfig, SessionStatus};

use super::traits::{ReadinessOutcome, SessionBackend, SubstrateError};
use crate::core::errors::SubstrateErrorKind;

/// One recorded call, in order, for tests to assert ordering guarantees
/// (spec.md section 5) against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Create(String),
    Start(String),
    WaitReady(String),
    Stop(String),
    Delete(String),
    Connect(String),
    Get(String),
    List,
    ExecPiped(String),
}

/// A backend double that stores sessions in memory and records every call
/// made against it.
pub struct MockBackend {
    sessions: Mutex<BTreeMap<String, Session>>,
    calls: Mutex<Vec<RecordedCall>>,
    /// When set, `wait_ready` returns this outcome instead of `Ready`.
    pub forced_readiness: Mutex<Option<ReadinessOutcome>>,
    backend_kind: BackendKind,
}

impl MockBackend {
    #[must_use]
    pub fn new(backend_kind: BackendKind) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            forced_readiness: Mutex::new(None),
            backend_kind,
        }
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(call);
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn create(&self, config: &SessionConfig, name: &str) -> Result<Session, SubstrateError> {
        self.record(RecordedCall::Create(name.to_owned()));
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if sessions.contains_key(name) {
            return Err(SubstrateError::new(
                SubstrateErrorKind::ObjectAlreadyExists,
                format!("session '{name}' already exists"),
            ));
        }
        let session = Session {
            name: name.to_owned(),
            status: SessionStatus::Stopped,
            workspace: config.workspace.clone(),
            created_at: chrono::Utc::now(),
            backend: self.backend_kind,
            container_id: None,
            volume_name: Some(format!("paude-{name}-data")),
        };
        sessions.insert(name.to_owned(), session.clone());
        Ok(session)
    }

    async fn start(&self, name: &str) -> Result<(), SubstrateError> {
        self.record(RecordedCall::Start(name.to_owned()));
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| SubstrateError::new(SubstrateErrorKind::ObjectNotFound, name.to_owned()))?;
        session.status = SessionStatus::Pending;
        Ok(())
    }

    async fn wait_ready(&self, name: &str, _budget: Duration) -> Result<ReadinessOutcome, SubstrateError> {
        self.record(RecordedCall::WaitReady(name.to_owned()));
        if let Some(forced) = self.forced_readiness.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() {
            return Ok(forced);
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(session) = sessions.get_mut(name) {
            session.status = SessionStatus::Running;
        }
        Ok(ReadinessOutcome::Ready)
    }

    async fn stop(&self, name: &str) -> Result<(), SubstrateError> {
        self.record(RecordedCall::Stop(name.to_owned()));
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(session) = sessions.get_mut(name) {
            session.status = SessionStatus::Stopped;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SubstrateError> {
        self.record(RecordedCall::Delete(name.to_owned()));
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(name);
        Ok(())
    }

    async fn connect(&self, name: &str) -> Result<i32, SubstrateError> {
        self.record(RecordedCall::Connect(name.to_owned()));
        Ok(0)
    }

    async fn get(&self, name: &str) -> Result<Option<Session>, SubstrateError> {
        self.record(RecordedCall::Get(name.to_owned()));
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, SubstrateError> {
        self.record(RecordedCall::List);
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn exec_piped(&self, name: &str, _args: &[String]) -> Result<i32, SubstrateError> {
        self.record(RecordedCall::ExecPiped(name.to_owned()));
        Ok(0)
    }

    fn workload_mount_path(&self, workspace: &Path) -> PathBuf {
        workspace.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            name: Some("s".to_owned()),
            workspace: PathBuf::from("/w"),
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
    async fn create_then_get_round_trips() {
        let backend = MockBackend::new(BackendKind::Local);
        backend.create(&config(), "s").await.unwrap();
        let fetched = backend.get("s").await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn create_twice_fails_with_already_exists() {
        let backend = MockBackend::new(BackendKind::Local);
        backend.create(&config(), "s").await.unwrap();
        let second = backend.create(&config(), "s").await;
        assert!(matches!(second, Err(err) if err.kind == SubstrateErrorKind::ObjectAlreadyExists));
    }

    #[tokio::test]
    async fn calls_are_recorded_in_order() {
        let backend = MockBackend::new(BackendKind::Local);
        backend.create(&config(), "s").await.unwrap();
        backend.start("s").await.unwrap();
        backend.wait_ready("s", Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                RecordedCall::Create("s".to_owned()),
                RecordedCall::Start("s".to_owned()),
                RecordedCall::WaitReady("s".to_owned()),
            ]
        );
    }
}
