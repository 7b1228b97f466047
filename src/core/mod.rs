//! Core session management logic and domain types.

/// The session state machine (C6): create/start/connect/stop/delete.
pub mod controller;
/// Session discovery (C8): explicit name, workspace match, singleton fallback.
pub mod discovery;
/// Domain error types with rich context.
pub mod errors;
/// Session domain model and related types.
pub mod session;

pub use controller::SessionController;
pub use discovery::{Candidate, Probe, Resolution};
pub use errors::{PaudeError, SubstrateErrorKind};
pub use session::{BackendKind, Session, SessionConfig, SessionStatus};
