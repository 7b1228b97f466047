//! Egress enforcement (spec.md component C4): a per-session forward proxy
//! plus a pod-selector-based confining policy at the substrate boundary.

/// NetworkPolicy / internal-network construction.
pub mod policy;
/// Local port leasing for the forward proxy.
pub mod port_allocator;
/// The forward proxy server itself.
pub mod proxy;

pub use policy::{allow_all_network_policy, confining_network_policy, proxy_deployment, proxy_image_reference, proxy_service};
pub use port_allocator::PortAllocator;
pub use proxy::{PROXY_PORT, serve as serve_proxy};

/// Names of the environment variables injected into a network-restricted
/// workload so HTTP(S) clients route through the proxy (spec.md 4.4).
pub const PROXY_ENV_VARS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Build the `VAR=value` pairs to inject for a given proxy host:port.
#[must_use]
pub fn proxy_env_vars(proxy_host: &str, proxy_port: u16) -> Vec<(String, String)> {
    let value = format!("http://{proxy_host}:{proxy_port}");
    PROXY_ENV_VARS
        .iter()
        .map(|name| ((*name).to_owned(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_env_vars_cover_both_cases() {
        let vars = proxy_env_vars("paude-proxy.default.svc", 3128);
        let names: Vec<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"HTTP_PROXY"));
        assert!(names.contains(&"https_proxy"));
        assert!(vars.iter().all(|(_, v)| v == "http://paude-proxy.default.svc:3128"));
    }
}
