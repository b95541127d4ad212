//! 6. `LoadBalancer` collaborator contract.
//!
//! Policy (round-robin selection, session-affinity bookkeeping) is out of
//! scope; this module only declares the trait the reconciler and the
//! forwarding loops call through, plus a minimal fixture used by tests.

use std::net::SocketAddr;

use crate::types::{EndpointsDescriptor, Protocol, ServicePortName, SessionAffinity};

/// Thread-safe: called concurrently from the sync loop and every live
/// forwarding loop.
pub trait LoadBalancer: Send + Sync {
    fn new_service(
        &self,
        name: &ServicePortName,
        affinity: Option<SessionAffinity>,
        sticky_max_age_seconds: u32,
    );

    fn delete_service(&self, name: &ServicePortName);

    /// Picks a backend for the next connection/datagram. `remote_addr` is
    /// the caller's address, consulted for affinity.
    /// `reset_session_affinity` asks the balancer to forget any existing
    /// affinity for this remote (used when a backend has gone away).
    fn next_endpoint(
        &self,
        name: &ServicePortName,
        remote_addr: SocketAddr,
        protocol: Protocol,
        reset_session_affinity: bool,
    ) -> Option<SocketAddr>;

    fn on_endpoints_add(&self, endpoints: &EndpointsDescriptor, service: &ServicePortName);

    fn on_endpoints_delete(&self, endpoints: &EndpointsDescriptor, service: &ServicePortName);

    fn on_endpoints_synced(&self);

    fn cleanup_stale_sticky_sessions(&self, name: &ServicePortName);
}

/// A test fixture, not a production policy: always returns the first
/// registered endpoint address for a service, round-robin-free. Useful for
/// exercising the reconciler and forwarding loops without importing a real
/// balancer implementation.
#[derive(Default)]
pub struct RoundRobinStub {
    endpoints: parking_lot::Mutex<std::collections::HashMap<ServicePortName, Vec<SocketAddr>>>,
    cursor: parking_lot::Mutex<std::collections::HashMap<ServicePortName, usize>>,
}

impl RoundRobinStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_endpoints(&self, name: &ServicePortName, addrs: Vec<SocketAddr>) {
        self.endpoints.lock().insert(name.clone(), addrs);
    }
}

impl LoadBalancer for RoundRobinStub {
    fn new_service(
        &self,
        name: &ServicePortName,
        _affinity: Option<SessionAffinity>,
        _sticky_max_age_seconds: u32,
    ) {
        self.endpoints.lock().entry(name.clone()).or_default();
    }

    fn delete_service(&self, name: &ServicePortName) {
        self.endpoints.lock().remove(name);
        self.cursor.lock().remove(name);
    }

    fn next_endpoint(
        &self,
        name: &ServicePortName,
        _remote_addr: SocketAddr,
        _protocol: Protocol,
        _reset_session_affinity: bool,
    ) -> Option<SocketAddr> {
        let endpoints = self.endpoints.lock();
        let addrs = endpoints.get(name)?;
        if addrs.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.lock();
        let slot = cursor.entry(name.clone()).or_insert(0);
        let addr = addrs[*slot % addrs.len()];
        *slot = (*slot + 1) % addrs.len();
        Some(addr)
    }

    fn on_endpoints_add(&self, _endpoints: &EndpointsDescriptor, _service: &ServicePortName) {}

    fn on_endpoints_delete(&self, _endpoints: &EndpointsDescriptor, _service: &ServicePortName) {}

    fn on_endpoints_synced(&self) {}

    fn cleanup_stale_sticky_sessions(&self, _name: &ServicePortName) {}
}
