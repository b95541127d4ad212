//! 4.E UDP client cache.
//!
//! A per-service table of active client flows, keyed by the client's
//! address string (not `SocketAddr` directly — matching the teacher's
//! `Identifier` keying by a formatted address lets eviction log a stable
//! key even if the socket's `peer_addr()` later becomes unavailable).
//! Eviction is lazy: a read timeout in the reply pump is what notices a
//! flow has gone idle, not a background sweeper.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

struct ClientEntry {
    backend: Arc<UdpSocket>,
}

/// Owned by one [`crate::proxy_socket::UdpProxySocket`]; never shared
/// across services. Expiry is driven by the reply pump's own read timeout,
/// not by a deadline tracked here — see `spec.md` §4.E.
#[derive(Default)]
pub struct UdpClientCache {
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl UdpClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached backend socket for `client`, if its flow hasn't
    /// been evicted.
    pub fn get(&self, client: SocketAddr) -> Option<Arc<UdpSocket>> {
        self.clients.lock().get(&client.to_string()).map(|e| e.backend.clone())
    }

    /// Inserts a flow keyed by the client's address.
    pub fn insert(&self, client: SocketAddr, backend: Arc<UdpSocket>) {
        self.clients
            .lock()
            .insert(client.to_string(), ClientEntry { backend });
    }

    /// Removes a flow, e.g. once its reply pump has observed a read
    /// timeout. Tolerated if the flow isn't present.
    pub fn evict(&self, client: SocketAddr) {
        self.clients.lock().remove(&client.to_string());
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap())
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cache = UdpClientCache::new();
        let client: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let backend = loopback_socket();
        cache.insert(client, backend.clone());
        assert!(cache.get(client).is_some());
    }

    #[test]
    fn evict_removes_entry() {
        let cache = UdpClientCache::new();
        let client: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        cache.insert(client, loopback_socket());
        cache.evict(client);
        assert!(cache.get(client).is_none());
    }

    #[test]
    fn evict_of_unknown_client_is_tolerated() {
        let cache = UdpClientCache::new();
        let client: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        cache.evict(client);
        assert_eq!(cache.len(), 0);
    }
}
