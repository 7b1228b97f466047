//! Local TCP port allocation for the per-session forward proxy when running
//! against the local substrate (remote substrate proxies are addressed
//! through a cluster-internal Service, not a host port).

use std::collections::HashMap;
use std::net::TcpListener;
use tokio::sync::RwLock;

/// Hands out unique, actually-bindable host ports for local proxy instances.
pub struct PortAllocator {
    state: RwLock<AllocatorState>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator").finish_non_exhaustive()
    }
}

struct AllocatorState {
    base_port: u16,
    next_offset: u16,
    allocated: HashMap<u16, String>,
}

impl PortAllocator {
    const BASE_PORT: u16 = 13128;
    const MAX_PORTS: u16 = 500;

    /// Create a new allocator starting at `start_port`, or the default base.
    #[must_use]
    pub fn new(start_port: Option<u16>) -> Self {
        Self {
            state: RwLock::new(AllocatorState {
                base_port: start_port.unwrap_or(Self::BASE_PORT),
                next_offset: 0,
                allocated: HashMap::new(),
            }),
        }
    }

    fn is_port_available(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Allocate a port for `session_name`, skipping ports already leased
    /// internally or actually in use by another process.
    ///
    /// # Errors
    /// Returns an error if no port is free within the allocator's range.
    pub async fn allocate(&self, session_name: &str) -> anyhow::Result<u16> {
        let mut state = self.state.write().await;

        for _ in 0..Self::MAX_PORTS {
            let port = state.base_port + (state.next_offset % Self::MAX_PORTS);
            state.next_offset = state.next_offset.wrapping_add(1);

            if !state.allocated.contains_key(&port) && Self::is_port_available(port) {
                state.allocated.insert(port, session_name.to_owned());
                tracing::info!(port, session = session_name, "allocated proxy port");
                return Ok(port);
            }
        }

        anyhow::bail!("no available proxy ports (all {} in use)", Self::MAX_PORTS)
    }

    /// Release a previously allocated port.
    pub async fn release(&self, port: u16) {
        self.state.write().await.allocated.remove(&port);
        tracing::info!(port, "released proxy port");
    }

    /// Look up which session owns `port`, if any.
    pub async fn owner(&self, port: u16) -> Option<String> {
        self.state.read().await.allocated.get(&port).cloned()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_distinct_ports() {
        let allocator = PortAllocator::new(None);
        let a = allocator.allocate("session-a").await.unwrap();
        let b = allocator.allocate("session-b").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(allocator.owner(a).await.as_deref(), Some("session-a"));
    }

    #[tokio::test]
    async fn release_frees_the_port_for_reuse() {
        let allocator = PortAllocator::new(None);
        let port = allocator.allocate("session-a").await.unwrap();
        allocator.release(port).await;
        assert_eq!(allocator.owner(port).await, None);
    }
}
