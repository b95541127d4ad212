//! 4.B Port claim registry.
//!
//! Records which `(ip, port, protocol)` triples are held open by
//! bind-placeholder sockets, keyed by owning service. A `None` ip means "all
//! local addresses" and is used for node ports.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};

use parking_lot::Mutex;

use crate::error::Error;
use crate::types::{Protocol, ServicePortName};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClaimKey {
    ip: Option<IpAddr>,
    port: u16,
    protocol: Protocol,
}

enum Placeholder {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

struct Claim {
    owner: ServicePortName,
    #[allow(dead_code)]
    placeholder: Placeholder,
}

/// Guarded by its own lock (`portMapLock` in `spec.md` §5); never held at the
/// same time as the service-map lock or the change-tracker lock.
#[derive(Default)]
pub struct PortClaimRegistry {
    claims: Mutex<HashMap<ClaimKey, Claim>>,
}

impl PortClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(ip, port, protocol)` for `owner`.
    ///
    /// Idempotent: claiming the same triple again with the same owner
    /// succeeds without reopening the placeholder. Claiming it with a
    /// different owner fails with [`Error::PortConflict`] and leaves the
    /// existing claim untouched.
    pub fn claim_node_port(
        &self,
        ip: Option<IpAddr>,
        port: u16,
        protocol: Protocol,
        owner: &ServicePortName,
    ) -> Result<(), Error> {
        let key = ClaimKey { ip, port, protocol };
        let mut claims = self.claims.lock();

        if let Some(existing) = claims.get(&key) {
            return if existing.owner == *owner {
                Ok(())
            } else {
                Err(Error::PortConflict {
                    ip,
                    port,
                    protocol: protocol.as_str(),
                    existing_owner: existing.owner.clone(),
                    requested_owner: owner.clone(),
                })
            };
        }

        let bind_ip = ip.unwrap_or(crate::types::UNSPECIFIED_IPV4);
        let addr = SocketAddr::new(bind_ip, port);
        let placeholder = match protocol {
            Protocol::Tcp => Placeholder::Tcp(TcpListener::bind(addr).map_err(|source| {
                Error::Bind {
                    service: owner.clone(),
                    ip: bind_ip,
                    port,
                    source,
                }
            })?),
            Protocol::Udp => Placeholder::Udp(UdpSocket::bind(addr).map_err(|source| {
                Error::Bind {
                    service: owner.clone(),
                    ip: bind_ip,
                    port,
                    source,
                }
            })?),
        };

        claims.insert(
            key,
            Claim {
                owner: owner.clone(),
                placeholder,
            },
        );

        Ok(())
    }

    /// Release a claim. Releasing a claim that doesn't exist is tolerated
    /// (logged, not an error). Releasing with the wrong owner fails.
    pub fn release_node_port(
        &self,
        ip: Option<IpAddr>,
        port: u16,
        protocol: Protocol,
        owner: &ServicePortName,
    ) -> Result<(), Error> {
        let key = ClaimKey { ip, port, protocol };
        let mut claims = self.claims.lock();

        let Some(existing) = claims.get(&key) else {
            log::debug!("release of unheld claim {ip:?}:{port}/{protocol:?} tolerated");
            return Ok(());
        };

        if existing.owner != *owner {
            return Err(Error::ClaimOwnerMismatch {
                ip,
                port,
                protocol: protocol.as_str(),
                owner: existing.owner.clone(),
                releaser: owner.clone(),
            });
        }

        claims.remove(&key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
