//! Image materialization (spec.md component C2): a content-addressed build
//! cache shared by the local and remote substrates.

/// Local substrate image build.
pub mod local;
/// Remote substrate image delivery (push strategies + in-cluster build).
pub mod remote;

use sha2::{Digest, Sha256};

/// Everything that changes an image's effective contents, hashed together to
/// derive the cache tag (spec.md section 3, `BuildInputs`).
#[derive(Debug, Clone, Default)]
pub struct BuildInputs {
    pub config_file: Vec<u8>,
    pub dockerfile: Option<Vec<u8>>,
    pub base_image: String,
    pub entrypoint_script: Vec<u8>,
    /// Only included when `pip_install` is enabled (spec.md 4.2); `None`
    /// otherwise keeps the hash stable across unrelated workspace edits.
    pub workspace_tree_digest: Option<Vec<u8>>,
    pub system_version: String,
}

/// SHA-256 over the ordered concatenation of every build input, truncated to
/// 12 hex characters, per spec.md section 4.2.
#[must_use]
pub fn hash_tag(inputs: &BuildInputs) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&inputs.config_file);
    if let Some(dockerfile) = &inputs.dockerfile {
        hasher.update(dockerfile);
    }
    hasher.update(inputs.base_image.as_bytes());
    hasher.update(&inputs.entrypoint_script);
    if let Some(tree_digest) = &inputs.workspace_tree_digest {
        hasher.update(tree_digest);
    }
    hasher.update(inputs.system_version.as_bytes());

    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

/// Build the full image tag: `workspace:<hash>-<arch>` (spec.md section 4.2).
#[must_use]
pub fn image_tag(inputs: &BuildInputs, arch: &str) -> String {
    format!("workspace:{}-{arch}", hash_tag(inputs))
}

/// A digest over an entire workspace file tree, used as `workspace_tree_digest`
/// when `pip_install` is enabled. Walks the tree in a stable (sorted) order so
/// the digest is reproducible across platforms.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a file cannot be read.
pub fn hash_workspace_tree(root: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    let mut paths: Vec<_> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .collect();
    paths.sort();

    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(path.to_string_lossy().as_bytes());
        let content = std::fs::read(&path)?;
        hasher.update(&content);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs() -> BuildInputs {
        BuildInputs {
            config_file: b"config".to_vec(),
            dockerfile: Some(b"FROM scratch".to_vec()),
            base_image: "docker.io/library/rust:1.88".to_owned(),
            entrypoint_script: b"#!/bin/sh\n".to_vec(),
            workspace_tree_digest: None,
            system_version: "1.0.0".to_owned(),
        }
    }

    #[test]
    fn hash_tag_is_twelve_hex_characters() {
        let tag = hash_tag(&sample_inputs());
        assert_eq!(tag.len(), 12);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_tag_is_deterministic() {
        assert_eq!(hash_tag(&sample_inputs()), hash_tag(&sample_inputs()));
    }

    #[test]
    fn hash_tag_changes_when_dockerfile_changes() {
        let mut changed = sample_inputs();
        changed.dockerfile = Some(b"FROM alpine".to_vec());
        assert_ne!(hash_tag(&sample_inputs()), hash_tag(&changed));
    }

    #[test]
    fn image_tag_embeds_arch_suffix() {
        let tag = image_tag(&sample_inputs(), "arm64");
        assert!(tag.starts_with("workspace:"));
        assert!(tag.ends_with("-arm64"));
    }
}
