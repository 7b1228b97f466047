use std::path::PathBuf;

/// Base directory for this tool's local state: proxy port leases, the CA
/// bundle used for registry TLS, and any other process-local bookkeeping. No
/// session state lives here (spec.md section 4.5) — only ephemeral process
/// state that would otherwise need a daemon.
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
#[must_use]
pub fn base_dir() -> PathBuf {
    #[expect(clippy::expect_used, reason = "home directory is required for operation")]
    dirs::home_dir()
        .expect("could not find home directory")
        .join(".paude")
}

/// Directory the local forward proxy uses for its allocated-port lease file.
#[must_use]
pub fn proxy_state_dir() -> PathBuf {
    base_dir().join("proxy")
}

/// Path to the root CA certificate bundle mounted into sessions so the
/// forward proxy's tunnel is trusted, if egress restriction is enabled.
#[must_use]
pub fn ca_cert_path() -> PathBuf {
    base_dir().join("ca.pem")
}

/// Translate a host credential path into the path it is mounted at inside a
/// local session's workload, mirroring the fixed prefix swap every mounted
/// credential undergoes (spec.md component C3).
#[must_use]
pub fn translate_credential_path_to_container(host_path: &str) -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_owned());
    if let Some(suffix) = host_path.strip_prefix(&home) {
        format!("/home/agent{suffix}")
    } else {
        host_path.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_credential_path_rewrites_home_prefix() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("HOME", "/home/user");
        }
        let translated = translate_credential_path_to_container("/home/user/.gitconfig");
        assert_eq!(translated, "/home/agent/.gitconfig");
    }

    #[test]
    fn translate_credential_path_passes_through_unrelated_paths() {
        let translated = translate_credential_path_to_container("/etc/resolv.conf");
        assert_eq!(translated, "/etc/resolv.conf");
    }
}
