//! Conntrack eviction, shelled out to `conntrack-tools` the same way
//! `iptables.rs` shells out to the packet-filter binary. `spec.md` §9 notes
//! the source dropped this on the floor; `SPEC_FULL.md` reinstates it as a
//! best-effort collaborator so a stale UDP flow doesn't keep pinning
//! traffic to a backend that's gone.

use std::process::Command;

use svcproxy_core::reconciler::ConntrackEvictor;
use svcproxy_core::types::Protocol;
use std::net::IpAddr;

pub struct ShellConntrackEvictor;

impl ConntrackEvictor for ShellConntrackEvictor {
    fn evict(&self, ip: IpAddr, port: u16, protocol: Protocol) {
        let output = Command::new("conntrack")
            .args([
                "-D",
                "--orig-dst",
                &ip.to_string(),
                "--dport",
                &port.to_string(),
                "-p",
                protocol.as_str(),
            ])
            .output();

        match output {
            // conntrack exits non-zero when there was nothing to delete;
            // that's the common case and not worth logging.
            Ok(_) => {}
            Err(err) => log::warn!("conntrack eviction for {ip}:{port}/{protocol:?} failed to spawn: {err}"),
        }
    }
}
