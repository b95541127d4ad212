//! Core of a userspace service proxy for a cluster networking data plane.
//!
//! This crate has no knowledge of CLI flags, config file formats, or the
//! transport that delivers service/endpoint events — see the workspace's
//! `svcproxy` binary crate for that glue. What lives here is the
//! reconciler, the proxy-port allocator and claim registry, the
//! packet-filter rule program, the bounded-frequency synchronizer, and the
//! TCP/UDP forwarding loops.

pub mod change_tracker;
pub mod claims;
pub mod error;
pub mod filter;
pub mod load_balancer;
pub mod ports;
pub mod proxy_socket;
pub mod reconciler;
pub mod runner;
pub mod types;
pub mod udp_cache;

pub use error::{Disposition, Error};
pub use reconciler::{ConntrackEvictor, LocalAddressesFunc, NullConntrackEvictor, Reconciler, ReconcilerConfig};
