//! The data model shared by every component: service identity, portals, and
//! the per-service-port installed state (`ServiceInfo`).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Transport protocol a service port is exposed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// The unique key for everything installed by the proxy for one service port.
///
/// Two services may share neither a port name nor a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    pub port_name: String,
}

impl std::fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port_name.is_empty() {
            write!(f, "{}/{}", self.namespace, self.name)
        } else {
            write!(f, "{}/{}:{}", self.namespace, self.name, self.port_name)
        }
    }
}

/// A virtual `(ip, port)` tuple plus whether packets addressed to it will
/// have originated off-host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Portal {
    pub ip: IpAddr,
    pub port: u16,
    pub is_external: bool,
}

/// One port on a service as declared by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortSpec {
    pub port_name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub node_port: u16,
}

/// Optional client-IP session affinity configuration, passed through
/// unexamined to the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAffinity {
    pub sticky_max_age_seconds: u32,
}

/// A service descriptor as received from the control plane. Opaque beyond
/// what the reconciler needs to install portals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub namespace: String,
    pub name: String,
    pub cluster_ip: Option<IpAddr>,
    pub external_ips: Vec<IpAddr>,
    pub load_balancer_ips: Vec<IpAddr>,
    pub ports: Vec<ServicePortSpec>,
    pub headless: bool,
    pub session_affinity: Option<SessionAffinity>,
}

impl ServiceDescriptor {
    /// A headless service, or one with no cluster IP, is ignored entirely.
    pub fn is_proxyable(&self) -> bool {
        !self.headless && self.cluster_ip.is_some()
    }

    pub fn service_port_names(&self) -> Vec<ServicePortName> {
        self.ports
            .iter()
            .map(|p| ServicePortName {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                port_name: p.port_name.clone(),
            })
            .collect()
    }
}

/// An endpoint descriptor. Opaque to the proxy core — forwarded verbatim to
/// the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointsDescriptor {
    pub namespace: String,
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Monotonic `false -> true` flags, observable from threads that never take
/// the service-map lock (forwarding loops, tests). Never fold these into
/// lock-protected fields: that is the whole point of keeping them atomic.
#[derive(Debug, Default)]
pub struct LifecycleFlags {
    alive: AtomicBool,
    started: AtomicBool,
    finished: AtomicBool,
}

impl LifecycleFlags {
    pub fn new_alive() -> Self {
        let flags = Self::default();
        flags.alive.store(true, Ordering::Release);
        flags
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn mark_finished(&self) {
        self.alive.store(false, Ordering::Release);
        self.finished.store(true, Ordering::Release);
    }
}

/// Per active service port: everything the reconciler installed for it.
///
/// An entry exists in the service map if and only if a listening socket
/// exists, a proxy port is allocated, and filter rules have been installed
/// (invariant 1 in `spec.md` §3).
pub struct ServiceInfo {
    pub name: ServicePortName,
    pub protocol: Protocol,
    pub portal: Portal,
    pub external_ips: Vec<IpAddr>,
    pub load_balancer_ips: Vec<IpAddr>,
    pub node_port: u16,
    pub proxy_port: u16,
    pub timeout: std::time::Duration,
    pub sticky_max_age_seconds: u32,
    pub session_affinity: bool,
    pub flags: Arc<LifecycleFlags>,
}

impl ServiceInfo {
    /// `sameConfig` equality: protocol, cluster-port, node-port, cluster IP
    /// and external IPs (in order) define idempotence. Deliberately ignores
    /// session-affinity configuration and load-balancer status — see
    /// DESIGN.md's note on the open question this preserves from the source.
    pub fn same_config(&self, spec: &ServicePortSpec, desc: &ServiceDescriptor) -> bool {
        self.protocol == spec.protocol
            && self.portal.port == spec.port
            && self.node_port == spec.node_port
            && desc.cluster_ip == Some(self.portal.ip)
            && self.external_ips == desc.external_ips
    }
}

/// `0.0.0.0` — the "unspecified" sentinel used by the filter program to
/// decide between `REDIRECT` and `DNAT` jump targets.
pub const UNSPECIFIED_IPV4: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
