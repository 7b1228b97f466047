//! Remote substrate: a Kubernetes-compatible cluster driven through the
//! typed `kube` client, with session state recovered from a StatefulSet's
//! own spec/status and annotations (spec.md component C5, remote half).

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    Secret, Service, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::session::{
    APP_LABEL_KEY, APP_LABEL_VALUE, CREATED_AT_ANNOTATION_KEY, Session, SessionConfig,
    SessionStatus, WORKSPACE_ANNOTATION_KEY, decode_workspace_annotation,
    encode_workspace_annotation,
};
use crate::egress;

use super::traits::{ReadinessOutcome, SessionBackend, SubstrateError};
use crate::core::errors::SubstrateErrorKind;

/// Fixed remote workspace mount path (spec.md 4.7).
pub const REMOTE_WORKSPACE_PATH: &str = "/pvc/workspace";

/// Budget to wait for the proxy `Deployment` to report an available replica
/// before scaling the workload up (spec.md section 5 — "proxy ready" gate).
const PROXY_READY_BUDGET: Duration = Duration::from_secs(60);

/// The Kubernetes-compatible remote substrate.
pub struct RemoteBackend {
    client: Client,
    namespace: String,
}

impl RemoteBackend {
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn statefulset_name(name: &str) -> String {
        format!("paude-{name}")
    }

    fn pvc_name(name: &str) -> String {
        format!("paude-{name}-data")
    }

    fn secret_name(name: &str) -> String {
        format!("paude-{name}-credentials")
    }

    fn config_map_name(name: &str) -> String {
        format!("paude-{name}-config")
    }

    fn proxy_name(name: &str) -> String {
        format!("paude-proxy-{name}")
    }

    /// Deterministic pod name for the lone StatefulSet replica (spec.md 4.5).
    fn pod_name(name: &str) -> String {
        format!("paude-{name}-0")
    }

    fn statefulsets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<k8s_openapi::api::core::v1::Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn network_policies(&self) -> Api<k8s_openapi::api::networking::v1::NetworkPolicy> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Poll the proxy `Deployment` until it has an available replica or
    /// `budget` elapses (spec.md section 5 — "proxy ready" gate).
    async fn wait_proxy_ready(&self, name: &str, budget: Duration) -> Result<(), SubstrateError> {
        let proxy_name = Self::proxy_name(name);
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let deployment = self.deployments().get(&proxy_name).await.map_err(to_substrate_error)?;
            let available = deployment.status.as_ref().and_then(|status| status.available_replicas).unwrap_or(0);
            if available >= 1 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SubstrateError::new(
                    SubstrateErrorKind::Timeout,
                    format!("proxy deployment '{proxy_name}' did not become ready"),
                ));
            }
            tokio::time::sleep(crate::core::controller::READINESS_POLL_INTERVAL).await;
        }
    }

    fn labels(name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL_KEY.to_owned(), APP_LABEL_VALUE.to_owned());
        labels.insert(crate::core::session::SESSION_LABEL_KEY.to_owned(), name.to_owned());
        labels
    }

    fn session_from_statefulset(&self, sts: &StatefulSet) -> Option<Session> {
        let metadata = &sts.metadata;
        let name = metadata.name.as_ref()?.strip_prefix("paude-")?.to_owned();
        let annotations = metadata.annotations.clone().unwrap_or_default();
        let workspace = annotations
            .get(WORKSPACE_ANNOTATION_KEY)
            .and_then(|value| decode_workspace_annotation(value).ok())
            .unwrap_or_default();
        let created_at = annotations
            .get(CREATED_AT_ANNOTATION_KEY)
            .and_then(|value| chrono::DateTime::parse_from_rfc3339(value).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let spec_replicas = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);
        let ready_replicas = sts.status.as_ref().and_then(|status| status.ready_replicas).unwrap_or(0);
        let status = if spec_replicas == 0 {
            SessionStatus::Stopped
        } else if ready_replicas >= spec_replicas {
            SessionStatus::Running
        } else {
            SessionStatus::Pending
        };

        Some(Session {
            name: name.clone(),
            status,
            workspace,
            created_at,
            backend: crate::core::session::BackendKind::Remote,
            container_id: None,
            volume_name: Some(Self::pvc_name(&name)),
        })
    }
}

fn to_substrate_error(err: kube::Error) -> SubstrateError {
    match &err {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            SubstrateError::new(SubstrateErrorKind::ObjectNotFound, api_err.message.clone())
        }
        kube::Error::Api(api_err) if api_err.code == 409 => {
            SubstrateError::new(SubstrateErrorKind::ObjectAlreadyExists, api_err.message.clone())
        }
        kube::Error::Api(api_err) if api_err.code == 401 || api_err.code == 403 => {
            SubstrateError::new(SubstrateErrorKind::NotAuthenticated, api_err.message.clone())
        }
        _ => SubstrateError::new(SubstrateErrorKind::TransientSubstrateError, err.to_string()),
    }
}

#[async_trait]
impl SessionBackend for RemoteBackend {
    async fn create(&self, config: &SessionConfig, name: &str) -> Result<Session, SubstrateError> {
        let sts_name = Self::statefulset_name(name);
        let labels = Self::labels(name);

        let mut annotations = BTreeMap::new();
        annotations.insert(WORKSPACE_ANNOTATION_KEY.to_owned(), encode_workspace_annotation(&config.workspace));
        annotations.insert(CREATED_AT_ANNOTATION_KEY.to_owned(), chrono::Utc::now().to_rfc3339());

        let mut requests = BTreeMap::new();
        requests.insert(
            "storage".to_owned(),
            Quantity(config.pvc_size.clone().unwrap_or_else(|| "10Gi".to_owned())),
        );

        let mut env = vec![EnvVar {
            name: crate::core::controller::CLAUDE_ARGS_ENV.to_owned(),
            value: Some(crate::core::controller::build_claude_args_env(config)),
            ..Default::default()
        }];
        env.push(EnvVar {
            name: crate::credentials::CREDENTIAL_TIMEOUT_ENV.to_owned(),
            value: Some(crate::credentials::watchdog_env_value(config.credential_timeout_minutes)),
            ..Default::default()
        });
        for (key, value) in crate::core::controller::workload_env_vars(REMOTE_WORKSPACE_PATH, config.credential_timeout_minutes) {
            env.push(EnvVar {
                name: key,
                value: Some(value),
                ..Default::default()
            });
        }
        for (key, value) in &config.env {
            env.push(EnvVar {
                name: key.clone(),
                value: Some(value.clone()),
                ..Default::default()
            });
        }
        if config.network_restricted {
            for (key, value) in egress::proxy_env_vars(&format!("paude-proxy-{name}.{}.svc", self.namespace), egress::PROXY_PORT) {
                env.push(EnvVar {
                    name: key,
                    value: Some(value),
                    ..Default::default()
                });
            }
        }

        // Credential projection (spec.md 4.3): a per-session Secret carries
        // sensitive files, a ConfigMap carries plain text, both labeled for
        // cascaded deletion; each projected file is mounted individually by
        // its data key so the in-container path matches the allowlist.
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let projected = crate::credentials::collect(&home);
        let credential_labels = crate::credentials::credential_object_labels(name);

        let mut secret_data = BTreeMap::new();
        let mut config_data = BTreeMap::new();
        let mut credential_mounts = Vec::new();
        for credential in &projected {
            let key = crate::credentials::data_key(&credential.container_path);
            let volume_name = match credential.sensitivity {
                crate::credentials::Sensitivity::Secret => {
                    secret_data.insert(key.clone(), ByteString(credential.content.clone()));
                    "credentials-secret"
                }
                crate::credentials::Sensitivity::Config => {
                    config_data.insert(key.clone(), String::from_utf8_lossy(&credential.content).into_owned());
                    "credentials-config"
                }
            };
            credential_mounts.push(VolumeMount {
                name: volume_name.to_owned(),
                mount_path: credential.container_path.clone(),
                sub_path: Some(key),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let has_secret = !secret_data.is_empty();
        let has_config = !config_data.is_empty();

        if has_secret {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(Self::secret_name(name)),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(credential_labels.clone()),
                    ..Default::default()
                },
                data: Some(secret_data),
                ..Default::default()
            };
            self.secrets()
                .patch(&Self::secret_name(name), &PatchParams::apply("paude").force(), &Patch::Apply(&secret))
                .await
                .map_err(to_substrate_error)?;
        }
        if has_config {
            let config_map = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(Self::config_map_name(name)),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(credential_labels),
                    ..Default::default()
                },
                data: Some(config_data),
                ..Default::default()
            };
            self.config_maps()
                .patch(&Self::config_map_name(name), &PatchParams::apply("paude").force(), &Patch::Apply(&config_map))
                .await
                .map_err(to_substrate_error)?;
        }

        let mut volume_mounts = vec![VolumeMount {
            name: "workspace".to_owned(),
            mount_path: REMOTE_WORKSPACE_PATH.to_owned(),
            ..Default::default()
        }];
        volume_mounts.extend(credential_mounts);

        let mut volumes = Vec::new();
        if has_secret {
            volumes.push(Volume {
                name: "credentials-secret".to_owned(),
                secret: Some(k8s_openapi::api::core::v1::SecretVolumeSource {
                    secret_name: Some(Self::secret_name(name)),
                    optional: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        if has_config {
            volumes.push(Volume {
                name: "credentials-config".to_owned(),
                config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                    name: Self::config_map_name(name),
                    optional: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let statefulset = StatefulSet {
            metadata: ObjectMeta {
                name: Some(sts_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(0),
                service_name: Some(sts_name.clone()),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "workload".to_owned(),
                            image: Some(config.image.clone()),
                            env: Some(env),
                            working_dir: Some(config.workdir.to_string_lossy().into_owned()),
                            volume_mounts: Some(volume_mounts),
                            ..Default::default()
                        }],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some("workspace".to_owned()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(requests),
                            ..Default::default()
                        }),
                        storage_class_name: config.storage_class.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };

        let params = PostParams::default();
        let created = self
            .statefulsets()
            .create(&params, &statefulset)
            .await
            .map_err(to_substrate_error)?;

        if config.network_restricted {
            let policy = egress::confining_network_policy(name, &self.namespace);
            let apply_params = PatchParams::apply("paude").force();
            let _ = self
                .network_policies()
                .patch(policy.metadata.name.as_deref().unwrap_or_default(), &apply_params, &Patch::Apply(&policy))
                .await;

            let proxy_name = Self::proxy_name(name);
            let proxy_image = egress::proxy_image_reference(&config.image);
            let deployment = egress::proxy_deployment(name, &self.namespace, &proxy_image);
            self.deployments()
                .patch(&proxy_name, &apply_params, &Patch::Apply(&deployment))
                .await
                .map_err(to_substrate_error)?;
            let service = egress::proxy_service(name, &self.namespace);
            self.services()
                .patch(&proxy_name, &apply_params, &Patch::Apply(&service))
                .await
                .map_err(to_substrate_error)?;
        }

        self.session_from_statefulset(&created)
            .ok_or_else(|| SubstrateError::new(SubstrateErrorKind::PermanentSubstrateError, "created StatefulSet had no recoverable name".to_owned()))
    }

    async fn start(&self, name: &str) -> Result<(), SubstrateError> {
        // Wait for the proxy before scaling the workload up (spec.md
        // section 5 ordering). A missing proxy Deployment means the
        // session was created with network restriction disabled.
        if self.deployments().get(&Self::proxy_name(name)).await.is_ok() {
            self.wait_proxy_ready(name, PROXY_READY_BUDGET).await?;
        }

        let sts_name = Self::statefulset_name(name);
        let patch = serde_json::json!({ "spec": { "replicas": 1 } });
        self.statefulsets()
            .patch(&sts_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(to_substrate_error)?;
        Ok(())
    }

    async fn wait_ready(&self, name: &str, budget: Duration) -> Result<ReadinessOutcome, SubstrateError> {
        let sts_name = Self::statefulset_name(name);
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let sts = self.statefulsets().get(&sts_name).await.map_err(to_substrate_error)?;
            let ready = sts.status.as_ref().and_then(|status| status.ready_replicas).unwrap_or(0);
            if ready >= 1 {
                return Ok(ReadinessOutcome::Ready);
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(ReadinessOutcome::TimedOut);
            }
            tokio::time::sleep(crate::core::controller::READINESS_POLL_INTERVAL).await;
        }
    }

    async fn stop(&self, name: &str) -> Result<(), SubstrateError> {
        let sts_name = Self::statefulset_name(name);
        let patch = serde_json::json!({ "spec": { "replicas": 0 } });
        self.statefulsets()
            .patch(&sts_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(to_substrate_error)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SubstrateError> {
        // Scale down first so mounts are released before the PVC is deleted
        // (spec.md section 5 ordering guarantee), then tolerate every
        // missing piece in the cascade.
        let _ = self.stop(name).await;

        let sts_name = Self::statefulset_name(name);
        let pvc_name = Self::pvc_name(name);
        let policy_name = format!("paude-{name}-egress");
        let delete_params = DeleteParams::default();

        for result in [
            self.statefulsets().delete(&sts_name, &delete_params).await.map(|_| ()),
        ] {
            if let Err(err) = result {
                if !matches!(to_substrate_error(err).kind, SubstrateErrorKind::ObjectNotFound) {
                    tracing::warn!(session = name, "failed to delete StatefulSet during cascade");
                }
            }
        }
        let _ = self.pvcs().delete(&pvc_name, &delete_params).await;
        let _ = self.network_policies().delete(&policy_name, &delete_params).await;
        let _ = self.secrets().delete(&Self::secret_name(name), &delete_params).await;
        let _ = self.config_maps().delete(&Self::config_map_name(name), &delete_params).await;
        let proxy_name = Self::proxy_name(name);
        let _ = self.deployments().delete(&proxy_name, &delete_params).await;
        let _ = self.services().delete(&proxy_name, &delete_params).await;
        // Legacy ephemeral-pod sessions (spec.md 4.5) have no StatefulSet to
        // scale down; deleting the bare pod directly is a no-op if absent.
        let _ = self.pods().delete(&format!("paude-{name}"), &delete_params).await;

        Ok(())
    }

    async fn connect(&self, name: &str) -> Result<i32, SubstrateError> {
        let pod_name = Self::pod_name(name);
        let attach_params = AttachParams::interactive_tty().stdin(true).stdout(true).stderr(false);
        let mut attached = self
            .pods()
            .exec(&pod_name, vec!["tmux", "attach", "-t", "main"], &attach_params)
            .await
            .map_err(to_substrate_error)?;

        let status = attached.take_status();
        drop(attached);
        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Success") {
                    return Ok(0);
                }
            }
        }
        Ok(0)
    }

    async fn exec_piped(&self, name: &str, args: &[String]) -> Result<i32, SubstrateError> {
        let pod_name = Self::pod_name(name);
        let attach_params = AttachParams::default().stdin(true).stdout(true).stderr(true);
        let mut attached = self
            .pods()
            .exec(&pod_name, args, &attach_params)
            .await
            .map_err(to_substrate_error)?;

        let mut tasks = Vec::new();
        if let Some(mut remote_stdin) = attached.stdin() {
            tasks.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut tokio::io::stdin(), &mut remote_stdin).await;
            }));
        }
        if let Some(mut remote_stdout) = attached.stdout() {
            tasks.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut remote_stdout, &mut tokio::io::stdout()).await;
            }));
        }
        if let Some(mut remote_stderr) = attached.stderr() {
            tasks.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut remote_stderr, &mut tokio::io::stderr()).await;
            }));
        }

        let status = attached.take_status();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Success") {
                    return Ok(0);
                }
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn get(&self, name: &str) -> Result<Option<Session>, SubstrateError> {
        let sts_name = Self::statefulset_name(name);
        match self.statefulsets().get(&sts_name).await {
            Ok(sts) => Ok(self.session_from_statefulset(&sts)),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(None),
            Err(err) => Err(to_substrate_error(err)),
        }
    }

    async fn list(&self) -> Result<Vec<Session>, SubstrateError> {
        let list_params = ListParams::default().labels(&format!("{APP_LABEL_KEY}={APP_LABEL_VALUE}"));
        let statefulsets = self.statefulsets().list(&list_params).await.map_err(to_substrate_error)?;
        let mut sessions: Vec<Session> = statefulsets.items.iter().filter_map(|sts| self.session_from_statefulset(sts)).collect();

        // Backward compatibility with sessions created by the older
        // ephemeral-Pod path (spec.md 4.5 Open Questions): a bare pod
        // labeled app=paude with no owning StatefulSet is still surfaced.
        let known: std::collections::HashSet<String> = sessions.iter().map(|session| session.name.clone()).collect();
        let pods = self.pods().list(&list_params).await.map_err(to_substrate_error)?;
        for pod in &pods.items {
            if pod.metadata.owner_references.as_ref().is_some_and(|refs| !refs.is_empty()) {
                continue;
            }
            let Some(name) = pod.metadata.name.as_ref().and_then(|n| n.strip_prefix("paude-")) else {
                continue;
            };
            if known.contains(name) {
                continue;
            }
            let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref()).unwrap_or("Unknown");
            sessions.push(Session {
                name: name.to_owned(),
                status: if phase == "Running" { SessionStatus::Running } else { SessionStatus::Stopped },
                workspace: PathBuf::new(),
                created_at: pod
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .and_then(|t| chrono::DateTime::from_timestamp_millis(t.0.as_millisecond()))
                    .unwrap_or_else(chrono::Utc::now),
                backend: crate::core::session::BackendKind::Remote,
                container_id: None,
                volume_name: None,
            });
        }
        Ok(sessions)
    }

    fn workload_mount_path(&self, _workspace: &Path) -> PathBuf {
        PathBuf::from(REMOTE_WORKSPACE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_name_is_deterministic_replica_zero() {
        assert_eq!(RemoteBackend::pod_name("my-session"), "paude-my-session-0");
    }

    #[test]
    fn statefulset_and_pvc_names_are_distinct() {
        assert_ne!(
            RemoteBackend::statefulset_name("my-session"),
            RemoteBackend::pvc_name("my-session")
        );
    }

    #[test]
    fn proxy_name_matches_the_deployment_and_service_naming_used_in_env_vars() {
        assert_eq!(RemoteBackend::proxy_name("my-session"), "paude-proxy-my-session");
    }
}
