//! Session discovery (spec.md component C8): resolve a session referent from
//! an explicit name, a workspace match, or a singleton fallback, probing all
//! available backends and tolerating the absence of either.

use std::path::Path;

use crate::backends::traits::{SessionBackend, SubstrateError};
use crate::core::errors::SubstrateErrorKind;
use crate::core::session::{BackendKind, Session, SessionStatus};

/// One backend made available to discovery, tagged with its kind so results
/// can report which substrate a session lives on.
pub struct Probe<'a> {
    pub kind: BackendKind,
    pub backend: &'a dyn SessionBackend,
}

/// A session found during discovery, together with the backend it lives on.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub session: Session,
    pub backend_kind: BackendKind,
}

/// List sessions from every reachable probe, skipping any that are
/// unreachable (`NotInstalled`/`NotAuthenticated`) silently (spec.md 4.8).
/// Podman (local) is probed before the cluster so it wins ties when both are
/// present and a choice must be made between equally-valid results.
pub async fn list_all(probes: &[Probe<'_>]) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for probe in probes {
        match probe.backend.list().await {
            Ok(sessions) => candidates.extend(sessions.into_iter().map(|session| Candidate {
                session,
                backend_kind: probe.kind,
            })),
            Err(err) if is_silently_skippable(&err) => {
                tracing::debug!(backend = %probe.kind, error = %err, "substrate unreachable, skipping");
            }
            Err(err) => {
                tracing::warn!(backend = %probe.kind, error = %err, "substrate listing failed");
            }
        }
    }
    candidates
}

fn is_silently_skippable(err: &SubstrateError) -> bool {
    matches!(
        err.kind,
        SubstrateErrorKind::NotInstalled | SubstrateErrorKind::NotAuthenticated
    )
}

/// Outcome of a resolution attempt: either a unique session, or the
/// numbered-candidate-list ambiguity the CLI renders with exit code 1
/// (spec.md 4.8).
#[derive(Debug)]
pub enum Resolution {
    Found(Candidate),
    Ambiguous(Vec<Candidate>),
    NotFound,
}

/// Strategy 1: explicit name, looked up directly. If `preferred_backend` is
/// `None`, both substrates are probed and the lookup must be unique.
pub async fn resolve_by_name(
    probes: &[Probe<'_>],
    name: &str,
    preferred_backend: Option<BackendKind>,
) -> Resolution {
    let mut matches = Vec::new();
    for probe in probes {
        if let Some(preferred) = preferred_backend {
            if probe.kind != preferred {
                continue;
            }
        }
        if let Ok(Some(session)) = probe.backend.get(name).await {
            matches.push(Candidate {
                session,
                backend_kind: probe.kind,
            });
        }
    }
    finalize(matches)
}

/// Strategy 2: resolve every candidate's workspace to an absolute path and
/// match against `cwd`'s resolved path; return the unique match.
pub async fn resolve_by_workspace(probes: &[Probe<'_>], cwd: &Path) -> Resolution {
    let candidates = list_all(probes).await;
    let matches: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| candidate.session.workspace == cwd)
        .collect();
    finalize(matches)
}

/// Strategy 3: if exactly one session exists across all available
/// substrates (optionally filtered to `running` only), use it.
pub async fn resolve_singleton(probes: &[Probe<'_>], running_only: bool) -> Resolution {
    let candidates = list_all(probes).await;
    let filtered: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| !running_only || candidate.session.status == SessionStatus::Running)
        .collect();
    finalize(filtered)
}

/// Run all three strategies in order, short-circuiting on the first unique
/// result (spec.md 4.8).
pub async fn resolve(
    probes: &[Probe<'_>],
    explicit_name: Option<&str>,
    preferred_backend: Option<BackendKind>,
    cwd: &Path,
) -> Resolution {
    if let Some(name) = explicit_name {
        return resolve_by_name(probes, name, preferred_backend).await;
    }

    match resolve_by_workspace(probes, cwd).await {
        Resolution::Found(candidate) => return Resolution::Found(candidate),
        Resolution::Ambiguous(candidates) => return Resolution::Ambiguous(candidates),
        Resolution::NotFound => {}
    }

    resolve_singleton(probes, false).await
}

fn finalize(matches: Vec<Candidate>) -> Resolution {
    match matches.len() {
        0 => Resolution::NotFound,
        1 => Resolution::Found(matches.into_iter().next().expect("len checked above")),
        _ => Resolution::Ambiguous(matches),
    }
}

/// Render the numbered candidate list shown when resolution is ambiguous
/// (spec.md 4.8).
#[must_use]
pub fn render_candidate_list(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            format!(
                "{}. {} [{}] ({})",
                index + 1,
                candidate.session.name,
                candidate.backend_kind,
                candidate.session.workspace.display()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(name: &str, workspace: &str) -> Session {
        Session {
            name: name.to_owned(),
            status: SessionStatus::Running,
            workspace: std::path::PathBuf::from(workspace),
            created_at: chrono::Utc::now(),
            backend: BackendKind::Local,
            container_id: None,
            volume_name: None,
        }
    }

    #[test]
    fn finalize_empty_is_not_found() {
        assert!(matches!(finalize(Vec::new()), Resolution::NotFound));
    }

    #[test]
    fn finalize_single_is_found() {
        let candidates = vec![Candidate {
            session: sample_session("a", "/x"),
            backend_kind: BackendKind::Local,
        }];
        assert!(matches!(finalize(candidates), Resolution::Found(_)));
    }

    #[test]
    fn finalize_multiple_is_ambiguous() {
        let candidates = vec![
            Candidate {
                session: sample_session("a", "/x"),
                backend_kind: BackendKind::Local,
            },
            Candidate {
                session: sample_session("b", "/y"),
                backend_kind: BackendKind::Remote,
            },
        ];
        assert!(matches!(finalize(candidates), Resolution::Ambiguous(_)));
    }

    #[test]
    fn render_candidate_list_is_numbered_from_one() {
        let candidates = vec![Candidate {
            session: sample_session("a", "/x"),
            backend_kind: BackendKind::Local,
        }];
        let rendered = render_candidate_list(&candidates);
        assert!(rendered.starts_with("1. a"));
    }
}
