//! 4.J host interface discovery (glue, per `SPEC_FULL.md`).
//!
//! Treated as a "simple wrapper helper" by `spec.md` §1, not part of the
//! core's testable surface. No crate in this workspace's ecosystem stack
//! enumerates local interfaces, so this reaches for the same std-only
//! "connect a UDP socket outward and read back the local address" trick
//! every dependency-free Rust CLI uses for this — no kernel interface
//! listing syscall is needed since the proxy only cares about the address
//! that would carry outbound traffic.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, UdpSocket};

/// The node's primary outbound IPv4 address, used as the host-side DNAT
/// target when a service's listen IP is unspecified (`spec.md` §4.C).
pub fn primary_host_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    // 203.0.113.0/24 is the documentation/TEST-NET-3 range (RFC 5737): this
    // never sends a packet, `connect` on a UDP socket is just a routing
    // table lookup that fixes the kernel's choice of source address.
    socket.connect("203.0.113.1:1")?;
    socket.local_addr().map(|addr| addr.ip())
}

/// Every local address the reconciler's `ensure_portals` step should treat
/// as "this node" when deciding whether a claim is an all-local node-port
/// claim. Best-effort: if discovery fails, an empty set is still a safe
/// (if less precise) answer — the claim registry's own conflict detection
/// is the actual safety net.
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut addrs = HashSet::new();
    addrs.insert(IpAddr::from([127, 0, 0, 1]));

    if let Ok(ip) = primary_host_ip() {
        addrs.insert(ip);
    }

    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses_always_includes_loopback() {
        let addrs = local_addresses();
        assert!(addrs.contains(&IpAddr::from([127, 0, 0, 1])));
    }
}
