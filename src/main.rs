use clap::Parser as _;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use paude::backends::{LocalBackend, RemoteBackend, SessionBackend};
use paude::cli::{BackendArg, Cli, Command};
use paude::config::RuntimeConfig;
use paude::core::session::{BackendKind, SessionConfig};
use paude::core::{Probe, Resolution, SessionController};
use paude::image::{self, BuildInputs};
use paude::utils;
use paude::workspace_sync::SyncMode;

/// Default architecture materialized images are tagged and built for. The
/// crate has no multi-arch build matrix (spec.md Non-goals), so this is a
/// fixed constant rather than a detected value.
const BUILD_ARCH: &str = "amd64";

/// The workload entrypoint baked into every dev-mode image build: a thin
/// wrapper that starts the `tmux` session `connect` attaches to.
const ENTRYPOINT_SCRIPT: &[u8] = b"#!/bin/sh\nexec tmux new-session -d -s main \"$@\"\n";

/// Resolve the workload image reference for a new session (spec.md 4.2).
///
/// Outside dev mode, the published image is pulled directly and the content-
/// addressed build cache never runs. In dev mode (`PAUDE_DEV=1`), the image
/// is hashed from its build inputs and materialized: built locally always,
/// then (for the remote substrate) delivered by pushing to a configured
/// external registry or, absent one, built in-cluster.
async fn materialize_image(runtime_config: &RuntimeConfig, backend_kind: BackendKind, namespace: &str) -> anyhow::Result<String> {
    if !runtime_config.dev_mode {
        return Ok(runtime_config.default_workload_image(BUILD_ARCH, env!("CARGO_PKG_VERSION")));
    }

    let inputs = BuildInputs {
        config_file: Vec::new(),
        dockerfile: None,
        base_image: "docker.io/library/debian:bookworm-slim".to_owned(),
        entrypoint_script: ENTRYPOINT_SCRIPT.to_vec(),
        workspace_tree_digest: None,
        system_version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    let tag = image::hash_tag(&inputs);
    let local_tag = image::image_tag(&inputs, BUILD_ARCH);
    let dockerfile = image::local::render_dockerfile(&inputs, false);

    let engine = "podman";
    let build_context = std::env::temp_dir().join(format!("paude-build-{tag}"));
    tokio::fs::create_dir_all(&build_context).await?;
    tokio::fs::write(build_context.join("entrypoint.sh"), ENTRYPOINT_SCRIPT).await?;
    image::local::build(engine, &build_context, &dockerfile, &local_tag, false).await?;

    match backend_kind {
        BackendKind::Local => Ok(local_tag),
        BackendKind::Remote => {
            let repository = format!("paude-{tag}");
            let external = match (
                std::env::var("PAUDE_REGISTRY_HOST"),
                std::env::var("PAUDE_REGISTRY_USER"),
                std::env::var("PAUDE_REGISTRY_PASSWORD"),
            ) {
                (Ok(host), Ok(username), Ok(password)) => Some(image::remote::ExternalRegistry { host, username, password }),
                _ => None,
            };

            if let Some(registry) = external {
                let delivered = image::remote::push_to_external_registry(engine, &local_tag, &registry, &repository).await?;
                Ok(delivered.reference)
            } else {
                let client = kube::Client::try_default().await?;
                image::remote::ensure_in_cluster_build_objects(client, namespace, &tag).await?;
                Ok(image::remote::reference_from_image_stream(
                    &format!("image-registry.openshift-image-registry.svc:5000/{namespace}/{repository}"),
                    &format!("{tag}-{BUILD_ARCH}"),
                ))
            }
        }
    }
}

fn initialize_cli_logging() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "paude=info".into()),
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
}

async fn local_backend() -> Option<LocalBackend> {
    let backend = LocalBackend::detect();
    backend
        .list()
        .await
        .ok()
        .map(|_| backend)
        .or_else(|| None)
}

async fn remote_backend(namespace: &str) -> Option<RemoteBackend> {
    let client = kube::Client::try_default().await.ok()?;
    Some(RemoteBackend::new(client, namespace.to_owned()))
}

async fn resolve_name(
    local: Option<&LocalBackend>,
    remote: Option<&RemoteBackend>,
    explicit_name: Option<&str>,
    preferred: Option<BackendKind>,
) -> anyhow::Result<(String, BackendKind)> {
    let mut probes = Vec::new();
    if let Some(local) = local {
        probes.push(Probe {
            kind: BackendKind::Local,
            backend: local,
        });
    }
    if let Some(remote) = remote {
        probes.push(Probe {
            kind: BackendKind::Remote,
            backend: remote,
        });
    }

    let cwd = utils::resolve_workspace(&std::env::current_dir()?).unwrap_or_else(|_| std::env::current_dir().unwrap_or_default());
    let resolution = paude::core::discovery::resolve(&probes, explicit_name, preferred, &cwd).await;

    match resolution {
        Resolution::Found(candidate) => Ok((candidate.session.name, candidate.backend_kind)),
        Resolution::NotFound => anyhow::bail!("no matching session found"),
        Resolution::Ambiguous(candidates) => {
            anyhow::bail!(
                "session reference is ambiguous, pick one:\n{}",
                paude::core::discovery::render_candidate_list(&candidates)
            )
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let runtime_config = RuntimeConfig::from_env();
    let namespace = std::env::var("PAUDE_NAMESPACE").unwrap_or_else(|_| "default".to_owned());

    match cli.command {
        Command::Create {
            name,
            backend,
            yolo,
            allow_network,
            pvc_size,
            storage_class,
            credential_timeout,
            workspace,
        } => {
            let workspace = workspace.unwrap_or(std::env::current_dir()?);
            let workspace = utils::resolve_workspace(&workspace)?;
            let kind = backend.map(BackendKind::from).unwrap_or(BackendKind::Local);
            let image = materialize_image(&runtime_config, kind, &namespace).await?;

            let config = SessionConfig {
                name,
                workspace,
                image,
                env: std::collections::BTreeMap::new(),
                args: Vec::new(),
                workdir: std::path::PathBuf::from("/workspace"),
                network_restricted: !allow_network,
                yolo,
                credential_timeout_minutes: credential_timeout,
                pvc_size,
                storage_class,
            };

            match kind {
                BackendKind::Local => {
                    let backend = LocalBackend::detect();
                    let controller = SessionController::new(&backend, kind);
                    let session = controller.create(config).await?;
                    println!("created session '{}'", session.name);
                }
                BackendKind::Remote => {
                    let backend = remote_backend(&namespace)
                        .await
                        .ok_or_else(|| anyhow::anyhow!("remote substrate is not reachable"))?;
                    let controller = SessionController::new(&backend, kind);
                    let session = controller.create(config).await?;
                    println!("created session '{}'", session.name);
                }
            }
            Ok(0)
        }

        Command::Start { name, backend, no_sync } => {
            let local = local_backend().await;
            let remote = remote_backend(&namespace).await;
            let (resolved_name, kind) = resolve_name(
                local.as_ref(),
                remote.as_ref(),
                name.as_deref(),
                backend.map(BackendKind::from),
            )
            .await?;

            match kind {
                BackendKind::Local => {
                    let backend = local.ok_or_else(|| anyhow::anyhow!("local substrate unavailable"))?;
                    let controller = SessionController::new(&backend, kind);
                    controller.start(&resolved_name, !no_sync).await?;
                }
                BackendKind::Remote => {
                    let backend = remote.ok_or_else(|| anyhow::anyhow!("remote substrate unavailable"))?;
                    let controller = SessionController::new(&backend, kind);
                    controller.start(&resolved_name, !no_sync).await?;
                }
            }
            Ok(0)
        }

        Command::Connect { name, backend } => {
            let local = local_backend().await;
            let remote = remote_backend(&namespace).await;
            let (resolved_name, kind) = resolve_name(
                local.as_ref(),
                remote.as_ref(),
                name.as_deref(),
                backend.map(BackendKind::from),
            )
            .await?;

            let exit_code = match kind {
                BackendKind::Local => {
                    let backend = local.ok_or_else(|| anyhow::anyhow!("local substrate unavailable"))?;
                    SessionController::new(&backend, kind).connect(&resolved_name).await?
                }
                BackendKind::Remote => {
                    let backend = remote.ok_or_else(|| anyhow::anyhow!("remote substrate unavailable"))?;
                    SessionController::new(&backend, kind).connect(&resolved_name).await?
                }
            };
            Ok(exit_code)
        }

        Command::Stop { name, backend, sync } => {
            let local = local_backend().await;
            let remote = remote_backend(&namespace).await;
            let (resolved_name, kind) = resolve_name(
                local.as_ref(),
                remote.as_ref(),
                name.as_deref(),
                backend.map(BackendKind::from),
            )
            .await?;

            match kind {
                BackendKind::Local => {
                    let backend = local.ok_or_else(|| anyhow::anyhow!("local substrate unavailable"))?;
                    SessionController::new(&backend, kind).stop(&resolved_name, sync).await?;
                }
                BackendKind::Remote => {
                    let backend = remote.ok_or_else(|| anyhow::anyhow!("remote substrate unavailable"))?;
                    SessionController::new(&backend, kind).stop(&resolved_name, sync).await?;
                }
            }
            Ok(0)
        }

        Command::Delete { name, backend, confirm } => {
            let local = local_backend().await;
            let remote = remote_backend(&namespace).await;
            let (resolved_name, kind) = resolve_name(
                local.as_ref(),
                remote.as_ref(),
                Some(name.as_str()),
                backend.map(BackendKind::from),
            )
            .await?;

            match kind {
                BackendKind::Local => {
                    let backend = local.ok_or_else(|| anyhow::anyhow!("local substrate unavailable"))?;
                    SessionController::new(&backend, kind).delete(&resolved_name, confirm).await?;
                }
                BackendKind::Remote => {
                    let backend = remote.ok_or_else(|| anyhow::anyhow!("remote substrate unavailable"))?;
                    SessionController::new(&backend, kind).delete(&resolved_name, confirm).await?;
                }
            }
            Ok(0)
        }

        Command::List { backend } => {
            let local = local_backend().await;
            let remote = remote_backend(&namespace).await;
            let mut printed = 0;

            if matches!(backend, None | Some(BackendArg::Local)) {
                if let Some(backend) = &local {
                    for session in SessionController::new(backend, BackendKind::Local).list().await? {
                        println!("{}\t{:?}\t[local]\t{}", session.name, session.status, session.workspace.display());
                        printed += 1;
                    }
                }
            }
            if matches!(backend, None | Some(BackendArg::Remote)) {
                if let Some(backend) = &remote {
                    for session in SessionController::new(backend, BackendKind::Remote).list().await? {
                        println!("{}\t{:?}\t[remote]\t{}", session.name, session.status, session.workspace.display());
                        printed += 1;
                    }
                }
            }
            if printed == 0 {
                println!("no sessions found");
            }
            Ok(0)
        }

        Command::Sync { name, backend, direction } => {
            let local = local_backend().await;
            let remote = remote_backend(&namespace).await;
            let (resolved_name, kind) = resolve_name(
                local.as_ref(),
                remote.as_ref(),
                name.as_deref(),
                backend.map(BackendKind::from),
            )
            .await?;
            let _ = kind;

            if kind == BackendKind::Local {
                println!("session '{resolved_name}' is local, workspace is already shared, nothing to sync");
                return Ok(0);
            }

            let workspace = std::env::current_dir()?;
            let mode: SyncMode = direction.into();
            paude::workspace_sync::run(mode, &workspace, |direction, args| {
                paude::workspace_sync::run_rsync_leg(kind, &resolved_name, direction, args)
            })
            .await;
            println!("synced session '{resolved_name}'");
            Ok(0)
        }

        Command::RsyncShell { backend, name, argv } => {
            // rsync's `-e` transport prepends the placeholder host before
            // its own `rsync --server ...` invocation; that host token
            // carries no meaning for an exec-based transport and is dropped.
            let argv = if argv.is_empty() { argv } else { argv[1..].to_vec() };
            let kind = BackendKind::from(backend);
            let exit_code = match kind {
                BackendKind::Local => {
                    let backend = local_backend().await.ok_or_else(|| anyhow::anyhow!("local substrate unavailable"))?;
                    backend.exec_piped(&name, &argv).await?
                }
                BackendKind::Remote => {
                    let backend = remote_backend(&namespace).await.ok_or_else(|| anyhow::anyhow!("remote substrate unavailable"))?;
                    backend.exec_piped(&name, &argv).await?
                }
            };
            Ok(exit_code)
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    initialize_cli_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            if let Some(paude_err) = err.downcast_ref::<paude::core::errors::PaudeError>() {
                eprintln!("error: {paude_err}");
                if let Some(hint) = paude_err.remediation() {
                    eprintln!("hint: {hint}");
                }
                std::process::ExitCode::from(u8::try_from(paude_err.exit_code()).unwrap_or(1))
            } else {
                eprintln!("error: {err:#}");
                std::process::ExitCode::from(1)
            }
        }
    }
}
