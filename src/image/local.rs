//! Local-substrate image materialization: generate a Dockerfile and build it
//! with the host's docker/podman binary (spec.md section 4.2).

use std::path::Path;
use tokio::process::Command;

use super::BuildInputs;

/// The layer order a generated Dockerfile follows: base image, then package
/// install, then entrypoint copy, then (optionally) pip install.
#[must_use]
pub fn render_dockerfile(inputs: &BuildInputs, pip_install: bool) -> String {
    let mut lines = vec![format!("FROM {}", inputs.base_image)];
    lines.push("RUN apt-get update && apt-get install -y --no-install-recommends \\".to_owned());
    lines.push("    ca-certificates git openssh-client rsync && rm -rf /var/lib/apt/lists/*".to_owned());
    lines.push("COPY entrypoint.sh /usr/local/bin/paude-entrypoint".to_owned());
    lines.push("RUN chmod +x /usr/local/bin/paude-entrypoint".to_owned());
    if pip_install {
        lines.push("COPY . /workspace".to_owned());
        lines.push("RUN pip install --no-cache-dir -r /workspace/requirements.txt || true".to_owned());
    }
    lines.push("ENTRYPOINT [\"/usr/local/bin/paude-entrypoint\"]".to_owned());
    lines.join("\n")
}

/// Check whether `tag` already exists in the local image store.
///
/// # Errors
/// Returns an error if the engine binary cannot be invoked at all.
pub async fn image_exists(engine: &str, tag: &str) -> anyhow::Result<bool> {
    let output = Command::new(engine)
        .args(["image", "inspect", tag])
        .output()
        .await?;
    Ok(output.status.success())
}

/// Build `tag` from a Dockerfile written into `build_context`, unless it
/// already exists and `force` is false (spec.md 4.2 cache policy:
/// "the image is considered valid if and only if the hash tag resolves").
///
/// # Errors
/// Returns an error if the engine build invocation fails.
pub async fn build(
    engine: &str,
    build_context: &Path,
    dockerfile: &str,
    tag: &str,
    force: bool,
) -> anyhow::Result<()> {
    if !force && image_exists(engine, tag).await? {
        tracing::debug!(tag, "image already cached, skipping build");
        return Ok(());
    }

    let dockerfile_path = build_context.join("Dockerfile.paude");
    tokio::fs::write(&dockerfile_path, dockerfile).await?;

    let status = Command::new(engine)
        .args([
            "build",
            "-f",
            &dockerfile_path.to_string_lossy(),
            "-t",
            tag,
            &build_context.to_string_lossy(),
        ])
        .status()
        .await?;

    if !status.success() {
        anyhow::bail!("{engine} build failed for tag '{tag}' (exit {status})");
    }

    tracing::info!(tag, engine, "built local image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockerfile_starts_with_base_image() {
        let inputs = BuildInputs {
            base_image: "docker.io/library/rust:1.88".to_owned(),
            ..Default::default()
        };
        let rendered = render_dockerfile(&inputs, false);
        assert!(rendered.starts_with("FROM docker.io/library/rust:1.88"));
    }

    #[test]
    fn pip_install_layer_only_present_when_requested() {
        let inputs = BuildInputs::default();
        let without = render_dockerfile(&inputs, false);
        let with = render_dockerfile(&inputs, true);
        assert!(!without.contains("pip install"));
        assert!(with.contains("pip install"));
    }

    #[test]
    fn entrypoint_install_comes_after_package_install_layer() {
        let rendered = render_dockerfile(&BuildInputs::default(), false);
        let pkg_idx = rendered.find("apt-get install").unwrap();
        let entry_idx = rendered.find("paude-entrypoint").unwrap();
        assert!(pkg_idx < entry_idx);
    }
}
