use std::path::{Path, PathBuf};

/// Resolve a user-supplied workspace argument to an absolute, canonical path.
///
/// Session discovery (spec.md component C8) keys the workspace-match
/// resolution strategy on this canonical form, so both creation and
/// discovery must normalize through the same function.
///
/// # Errors
///
/// Returns an error if the path does not exist or cannot be canonicalized.
pub fn resolve_workspace(path: &Path) -> std::io::Result<PathBuf> {
    let expanded = expand_tilde(path);
    expanded.canonicalize()
}

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_joins_home_for_relative_suffix() {
        let expanded = expand_tilde(Path::new("~/projects/app"));
        assert!(!expanded.to_string_lossy().contains('~'));
        assert!(expanded.to_string_lossy().ends_with("projects/app"));
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths_untouched() {
        let expanded = expand_tilde(Path::new("/absolute/path"));
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn resolve_workspace_canonicalizes_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = resolve_workspace(tmp.path()).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn resolve_workspace_errors_on_missing_path() {
        let missing = PathBuf::from("/definitely/does/not/exist/paude-test");
        assert!(resolve_workspace(&missing).is_err());
    }
}
