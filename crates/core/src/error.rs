//! The error kinds named in `spec.md` §7 and how they carry enough context
//! to log meaningfully. Per-service failures never leak across services: the
//! reconciler catches these at the top of each merge/unmerge step.

use std::net::IpAddr;

use crate::types::ServicePortName;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{service}: no ports left in allocator range")]
    PortAllocation { service: ServicePortName },

    #[error("{service}: failed to bind proxy socket on {ip}:{port}: {source}")]
    Bind {
        service: ServicePortName,
        ip: IpAddr,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{ip:?}:{port}/{protocol} already claimed by {existing_owner}, refusing {requested_owner}")]
    PortConflict {
        ip: Option<IpAddr>,
        port: u16,
        protocol: &'static str,
        existing_owner: ServicePortName,
        requested_owner: ServicePortName,
    },

    #[error("{ip:?}:{port}/{protocol} released by {releaser} but owned by {owner}")]
    ClaimOwnerMismatch {
        ip: Option<IpAddr>,
        port: u16,
        protocol: &'static str,
        owner: ServicePortName,
        releaser: ServicePortName,
    },

    #[error("{service}: failed to install filter rule: {reason}")]
    FilterRule {
        service: ServicePortName,
        reason: String,
    },

    #[error("unmerge of {service} failed with {count} aggregated error(s): {first}")]
    Unmerge {
        service: ServicePortName,
        count: usize,
        first: String,
    },
}

/// How a failure should be handled, per the table in `spec.md` §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fatal at construction, but only a logged warning during a later sync.
    FatalAtConstruction,
    /// The service is skipped until the next sync; any partial state the
    /// reconciler allocated for it is unwound.
    LogAndSkip,
    /// All other retractions still run; the failure is aggregated and
    /// reported once teardown of the service finishes.
    AggregateAndReport,
    /// Not actually an error — a known, expected condition.
    Tolerated,
}

impl Error {
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::PortAllocation { .. }
            | Error::Bind { .. }
            | Error::PortConflict { .. }
            | Error::FilterRule { .. } => Disposition::LogAndSkip,
            Error::ClaimOwnerMismatch { .. } => Disposition::LogAndSkip,
            Error::Unmerge { .. } => Disposition::AggregateAndReport,
        }
    }
}
