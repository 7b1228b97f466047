//! Construction of the confining network policy (spec.md section 4.4).
//!
//! The remote substrate expresses this as a `NetworkPolicy`; the local
//! substrate expresses the equivalent confinement as container attachment to
//! an internal-only network (see `backends::local`). Both share the same
//! decision: pod-selector semantics, never CIDR allowlists, because IP ranges
//! for hyperscaler services drift.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use crate::core::session::{APP_LABEL_KEY, APP_LABEL_VALUE, SESSION_LABEL_KEY};

/// Well-known UDP/TCP port DNS resolves on, plus mDNS, which must stay open
/// even under a deny-all-egress policy.
const DNS_PORT: i32 = 53;
const MDNS_PORT: i32 = 5353;

/// Build the `NetworkPolicy` that confines session `name`'s workload pod to
/// DNS plus the proxy pods, per spec.md 4.4.
///
/// The DNS destination carries both an empty `namespace_selector` and an
/// empty `pod_selector` in the *same* `NetworkPolicyPeer` — a pod-selector
/// alone without the namespace selector does not match cross-namespace
/// targets (like `kube-system`) on common SDN implementations.
#[must_use]
pub fn confining_network_policy(name: &str, namespace: &str) -> NetworkPolicy {
    let mut workload_selector = BTreeMap::new();
    workload_selector.insert(APP_LABEL_KEY.to_owned(), APP_LABEL_VALUE.to_owned());
    workload_selector.insert(SESSION_LABEL_KEY.to_owned(), name.to_owned());

    let mut proxy_selector = BTreeMap::new();
    proxy_selector.insert(APP_LABEL_KEY.to_owned(), "paude-proxy".to_owned());
    proxy_selector.insert(SESSION_LABEL_KEY.to_owned(), name.to_owned());

    let dns_peer = NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector::default()),
        pod_selector: Some(LabelSelector::default()),
        ..Default::default()
    };

    let proxy_peer = NetworkPolicyPeer {
        pod_selector: Some(LabelSelector {
            match_labels: Some(proxy_selector),
            ..Default::default()
        }),
        ..Default::default()
    };

    let egress_rules = vec![
        NetworkPolicyEgressRule {
            to: Some(vec![dns_peer]),
            ports: Some(vec![
                NetworkPolicyPort {
                    protocol: Some("UDP".to_owned()),
                    port: Some(IntOrString::Int(DNS_PORT)),
                    ..Default::default()
                },
                NetworkPolicyPort {
                    protocol: Some("TCP".to_owned()),
                    port: Some(IntOrString::Int(DNS_PORT)),
                    ..Default::default()
                },
                NetworkPolicyPort {
                    protocol: Some("UDP".to_owned()),
                    port: Some(IntOrString::Int(MDNS_PORT)),
                    ..Default::default()
                },
            ]),
        },
        NetworkPolicyEgressRule {
            to: Some(vec![proxy_peer]),
            ports: Some(vec![NetworkPolicyPort {
                protocol: Some("TCP".to_owned()),
                port: Some(IntOrString::Int(i32::from(crate::egress::proxy::PROXY_PORT))),
                ..Default::default()
            }]),
        },
    ];

    NetworkPolicy {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(format!("paude-{name}-egress")),
            namespace: Some(namespace.to_owned()),
            labels: Some(workload_selector.clone()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: Some(LabelSelector {
                match_labels: Some(workload_selector),
                ..Default::default()
            }),
            policy_types: Some(vec!["Egress".to_owned()]),
            egress: Some(egress_rules),
            ingress: Option::<Vec<NetworkPolicyIngressRule>>::None,
        }),
    }
}

/// Build the permissive replacement policy used when a session opts out of
/// network restriction (`allow_network = true`, spec.md 4.4): an empty
/// egress rule list under `policy_types: [Egress]` allows everything.
#[must_use]
pub fn allow_all_network_policy(name: &str, namespace: &str) -> NetworkPolicy {
    let mut workload_selector = BTreeMap::new();
    workload_selector.insert(APP_LABEL_KEY.to_owned(), APP_LABEL_VALUE.to_owned());
    workload_selector.insert(SESSION_LABEL_KEY.to_owned(), name.to_owned());

    NetworkPolicy {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(format!("paude-{name}-egress")),
            namespace: Some(namespace.to_owned()),
            labels: Some(workload_selector.clone()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: Some(LabelSelector {
                match_labels: Some(workload_selector),
                ..Default::default()
            }),
            policy_types: Some(vec!["Egress".to_owned()]),
            egress: Some(vec![NetworkPolicyEgressRule {
                to: None,
                ports: None,
            }]),
            ingress: Option::<Vec<NetworkPolicyIngressRule>>::None,
        }),
    }
}

/// Build the single-replica `Deployment` running the per-session forward
/// proxy on the remote substrate (spec.md 4.4), selected by the same
/// `app=paude-proxy` + session label pair `confining_network_policy` grants
/// egress to.
#[must_use]
pub fn proxy_deployment(name: &str, namespace: &str, image: &str) -> Deployment {
    let mut selector = BTreeMap::new();
    selector.insert(APP_LABEL_KEY.to_owned(), "paude-proxy".to_owned());
    selector.insert(SESSION_LABEL_KEY.to_owned(), name.to_owned());

    Deployment {
        metadata: ObjectMeta {
            name: Some(format!("paude-proxy-{name}")),
            namespace: Some(namespace.to_owned()),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "proxy".to_owned(),
                        image: Some(image.to_owned()),
                        ports: Some(vec![ContainerPort {
                            container_port: i32::from(crate::egress::proxy::PROXY_PORT),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the `ClusterIP` `Service` fronting a session's proxy `Deployment`,
/// addressed by the workload as `paude-proxy-<name>.<namespace>.svc`
/// (spec.md 4.4).
#[must_use]
pub fn proxy_service(name: &str, namespace: &str) -> Service {
    let mut selector = BTreeMap::new();
    selector.insert(APP_LABEL_KEY.to_owned(), "paude-proxy".to_owned());
    selector.insert(SESSION_LABEL_KEY.to_owned(), name.to_owned());

    Service {
        metadata: ObjectMeta {
            name: Some(format!("paude-proxy-{name}")),
            namespace: Some(namespace.to_owned()),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: i32::from(crate::egress::proxy::PROXY_PORT),
                target_port: Some(IntOrString::Int(i32::from(crate::egress::proxy::PROXY_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Derive the per-session proxy image reference from the workload image by
/// substituting the component name and preserving the tag (spec.md 4.4):
/// `registry/paude-claude:abc123` -> `registry/paude-proxy:abc123`.
#[must_use]
pub fn proxy_image_reference(workload_image: &str) -> String {
    let (repo, tag) = workload_image
        .rsplit_once(':')
        .map_or((workload_image, "latest"), |(r, t)| (r, t));

    let proxy_repo = if let Some((prefix, _)) = repo.rsplit_once('/') {
        format!("{prefix}/paude-proxy")
    } else {
        "paude-proxy".to_owned()
    };

    format!("{proxy_repo}:{tag}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_peer_has_both_selectors_empty_in_the_same_peer() {
        let policy = confining_network_policy("my-session", "default");
        let egress = policy.spec.unwrap().egress.unwrap();
        let dns_peer = &egress[0].to.as_ref().unwrap()[0];
        assert!(dns_peer.namespace_selector.is_some());
        assert!(dns_peer.pod_selector.is_some());
    }

    #[test]
    fn proxy_peer_is_selected_by_session_label() {
        let policy = confining_network_policy("my-session", "default");
        let egress = policy.spec.unwrap().egress.unwrap();
        let proxy_peer = &egress[1].to.as_ref().unwrap()[0];
        let selector = proxy_peer.pod_selector.as_ref().unwrap();
        let labels = selector.match_labels.as_ref().unwrap();
        assert_eq!(labels.get(SESSION_LABEL_KEY), Some(&"my-session".to_owned()));
    }

    #[test]
    fn allow_all_policy_has_no_egress_restriction() {
        let policy = allow_all_network_policy("my-session", "default");
        let egress = policy.spec.unwrap().egress.unwrap();
        assert_eq!(egress.len(), 1);
        assert!(egress[0].to.is_none());
        assert!(egress[0].ports.is_none());
    }

    #[test]
    fn proxy_image_reference_substitutes_component_name() {
        assert_eq!(
            proxy_image_reference("registry.example.com/paude-claude:abc123def456"),
            "registry.example.com/paude-proxy:abc123def456"
        );
    }

    #[test]
    fn proxy_image_reference_defaults_tag_when_absent() {
        assert_eq!(proxy_image_reference("paude-claude"), "paude-proxy:latest");
    }

    #[test]
    fn proxy_deployment_is_selected_by_the_network_policys_proxy_peer() {
        let deployment = proxy_deployment("my-session", "default", "registry/paude-proxy:latest");
        let pod_labels = deployment.spec.unwrap().template.metadata.unwrap().labels.unwrap();

        let policy = confining_network_policy("my-session", "default");
        let egress = policy.spec.unwrap().egress.unwrap();
        let proxy_peer_labels = egress[1].to.as_ref().unwrap()[0]
            .pod_selector
            .as_ref()
            .unwrap()
            .match_labels
            .as_ref()
            .unwrap();

        assert_eq!(&pod_labels, proxy_peer_labels);
    }

    #[test]
    fn proxy_service_targets_the_proxy_port() {
        let service = proxy_service("my-session", "default");
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, i32::from(crate::egress::proxy::PROXY_PORT));
    }
}
