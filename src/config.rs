//! Runtime configuration consumed from the environment (spec.md section 6).
//!
//! Parsing of an on-disk config file is an external collaborator per
//! spec.md's Non-goals; this module only defines and reads the shape the
//! rest of the crate consumes.

use std::path::PathBuf;

/// Process-wide settings read from environment variables at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `PAUDE_DEV=1` enables local image builds from a sibling `containers/`
    /// directory instead of pulling a published image.
    pub dev_mode: bool,
    /// `PAUDE_REGISTRY`: default registry prefix for image pulls.
    pub registry_prefix: Option<String>,
    /// The user's home directory, for credential projection.
    pub home: PathBuf,
}

impl RuntimeConfig {
    /// Read configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            dev_mode: std::env::var("PAUDE_DEV").as_deref() == Ok("1"),
            registry_prefix: std::env::var("PAUDE_REGISTRY").ok(),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root")),
        }
    }

    /// Build the default workload image reference for `platform`/`version`.
    #[must_use]
    pub fn default_workload_image(&self, platform: &str, version: &str) -> String {
        self.qualify(&format!("paude-claude-{platform}:{version}"))
    }

    /// Build the default proxy image reference for `platform`/`version`.
    #[must_use]
    pub fn default_proxy_image(&self, platform: &str, version: &str) -> String {
        self.qualify(&format!("paude-proxy-{platform}:{version}"))
    }

    fn qualify(&self, image: &str) -> String {
        match &self.registry_prefix {
            Some(prefix) => format!("{prefix}/{image}"),
            None => image.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_prepends_registry_when_configured() {
        let config = RuntimeConfig {
            dev_mode: false,
            registry_prefix: Some("registry.example.com".to_owned()),
            home: PathBuf::from("/home/user"),
        };
        assert_eq!(
            config.default_workload_image("amd64", "1.0.0"),
            "registry.example.com/paude-claude-amd64:1.0.0"
        );
    }

    #[test]
    fn qualify_leaves_image_unqualified_without_registry() {
        let config = RuntimeConfig {
            dev_mode: false,
            registry_prefix: None,
            home: PathBuf::from("/home/user"),
        };
        assert_eq!(config.default_proxy_image("arm64", "1.0.0"), "paude-proxy-arm64:1.0.0");
    }
}
