//! 4.C Packet-filter program.
//!
//! Declares the fixed chain topology and emits/retracts the per-service
//! rules that redirect virtual-address traffic to a proxy port. The actual
//! shelling-out to a kernel packet-filter utility is a collaborator
//! (`IptablesDriver`) and out of scope here; what's in scope is chain
//! topology, rule ordering, and byte-exact argument reconstruction, since
//! some drivers match existing rules by parsing `iptables-save` output.

mod rules;

pub use rules::{build_node_port_rules, build_portal_rules, PortalRule};

use std::net::IpAddr;

use crate::types::{Portal, ServicePortName, UNSPECIFIED_IPV4};

/// The two tables the program touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

/// Where a jump/rule is inserted relative to the existing rules in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Prepend,
    Append,
}

/// An opaque driver error. The driver is the only thing that knows whether
/// a given failure means "rule/chain already gone" — see
/// [`IptablesDriver::is_not_found_error`].
#[derive(Debug)]
pub struct DriverError {
    pub message: String,
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DriverError {}

/// The packet-filter driver collaborator (`spec.md` §6). Implementations
/// shell out to a kernel utility; this crate ships only a recording test
/// double (see `RecordingDriver`) since the real driver is out of scope.
pub trait IptablesDriver: Send + Sync {
    /// Returns whether the chain already existed.
    fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool, DriverError>;

    /// Returns whether the rule already existed.
    fn ensure_rule(
        &self,
        position: Position,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool, DriverError>;

    fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<(), DriverError>;

    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), DriverError>;

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError>;

    fn is_not_found_error(&self, err: &DriverError) -> bool;
}

pub const CHAIN_PORTALS_CONTAINER: &str = "PORTALS-CONTAINER";
pub const CHAIN_PORTALS_HOST: &str = "PORTALS-HOST";
pub const CHAIN_NODEPORT_CONTAINER: &str = "NODEPORT-CONTAINER";
pub const CHAIN_NODEPORT_HOST: &str = "NODEPORT-HOST";
pub const CHAIN_NODEPORT_NON_LOCAL: &str = "NODEPORT-NON-LOCAL";

struct EntryPoint {
    table: Table,
    chain: &'static str,
    hook_chain: &'static str,
    position: Position,
    jump_args: Vec<String>,
}

fn entry_points() -> [EntryPoint; 5] {
    [
        EntryPoint {
            table: Table::Nat,
            chain: CHAIN_PORTALS_CONTAINER,
            hook_chain: "PREROUTING",
            position: Position::Prepend,
            jump_args: vec!["-j".into(), CHAIN_PORTALS_CONTAINER.into()],
        },
        EntryPoint {
            table: Table::Nat,
            chain: CHAIN_PORTALS_HOST,
            hook_chain: "OUTPUT",
            position: Position::Prepend,
            jump_args: vec!["-j".into(), CHAIN_PORTALS_HOST.into()],
        },
        EntryPoint {
            table: Table::Nat,
            chain: CHAIN_NODEPORT_CONTAINER,
            hook_chain: "PREROUTING",
            // Must be appended, not prepended: portal rules have to match
            // before node-port rules (`spec.md` §4.C) since a load-balancer
            // ingress IP can be categorized LOCAL in some environments.
            position: Position::Append,
            jump_args: vec![
                "-m".into(),
                "addrtype".into(),
                "--dst-type".into(),
                "LOCAL".into(),
                "-j".into(),
                CHAIN_NODEPORT_CONTAINER.into(),
            ],
        },
        EntryPoint {
            table: Table::Nat,
            chain: CHAIN_NODEPORT_HOST,
            hook_chain: "OUTPUT",
            position: Position::Append,
            jump_args: vec![
                "-m".into(),
                "addrtype".into(),
                "--dst-type".into(),
                "LOCAL".into(),
                "-j".into(),
                CHAIN_NODEPORT_HOST.into(),
            ],
        },
        EntryPoint {
            table: Table::Filter,
            chain: CHAIN_NODEPORT_NON_LOCAL,
            hook_chain: "INPUT",
            position: Position::Prepend,
            jump_args: vec!["-j".into(), CHAIN_NODEPORT_NON_LOCAL.into()],
        },
    ]
}

/// The chains and rules the reconciler installs and retracts, built on top
/// of an [`IptablesDriver`].
pub struct FilterProgram<D> {
    driver: D,
}

impl<D: IptablesDriver> FilterProgram<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Installs the fixed five-chain topology. Fatal at construction time
    /// (per the resolved Open Question in DESIGN.md); callers that need the
    /// "log and hope the next sync recovers" behavior for re-syncs should
    /// call this again from `ensure_portals` and only log a failure there.
    pub fn init(&self) -> Result<(), DriverError> {
        for ep in entry_points() {
            self.driver.ensure_chain(ep.table, ep.chain)?;
            self.driver
                .ensure_rule(ep.position, ep.table, ep.hook_chain, &ep.jump_args)?;
        }
        Ok(())
    }

    /// Re-installs the topology, tolerating failure by logging rather than
    /// propagating — used during steady-state re-sync (`ensurePortals`).
    pub fn ensure_topology(&self) {
        if let Err(err) = self.init() {
            log::warn!("filter topology drift during re-sync, will retry next pass: {err}");
        }
    }

    /// Installs the rules for one portal (cluster IP, external IP, or
    /// load-balancer ingress IP), following the exact rule set in
    /// `spec.md` §4.C.
    pub fn open_portal(
        &self,
        service: &ServicePortName,
        protocol: crate::types::Protocol,
        portal: Portal,
        proxy_ip: IpAddr,
        proxy_port: u16,
        host_ip: IpAddr,
    ) -> Result<(), DriverError> {
        let rules = build_portal_rules(service, protocol, portal, proxy_ip, proxy_port, host_ip);
        for rule in rules {
            self.driver
                .ensure_rule(Position::Prepend, rule.table, rule.chain, &rule.args)?;
        }
        Ok(())
    }

    /// Removes the rules for one portal. Not-found failures are tolerated.
    pub fn close_portal(
        &self,
        service: &ServicePortName,
        protocol: crate::types::Protocol,
        portal: Portal,
        proxy_ip: IpAddr,
        proxy_port: u16,
        host_ip: IpAddr,
    ) -> Result<(), DriverError> {
        let rules = build_portal_rules(service, protocol, portal, proxy_ip, proxy_port, host_ip);
        let mut first_err = None;
        for rule in rules {
            if let Err(err) = self.driver.delete_rule(rule.table, rule.chain, &rule.args) {
                if !self.driver.is_not_found_error(&err) {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Installs the node-port rules: container + host DNAT/REDIRECT plus
    /// the filter-chain accept rule for the proxy port.
    pub fn open_node_port(
        &self,
        service: &ServicePortName,
        protocol: crate::types::Protocol,
        node_port: u16,
        proxy_ip: IpAddr,
        proxy_port: u16,
        host_ip: IpAddr,
    ) -> Result<(), DriverError> {
        let rules = build_node_port_rules(service, protocol, node_port, proxy_ip, proxy_port, host_ip);
        for rule in rules {
            self.driver
                .ensure_rule(Position::Prepend, rule.table, rule.chain, &rule.args)?;
        }
        Ok(())
    }

    pub fn close_node_port(
        &self,
        service: &ServicePortName,
        protocol: crate::types::Protocol,
        node_port: u16,
        proxy_ip: IpAddr,
        proxy_port: u16,
        host_ip: IpAddr,
    ) -> Result<(), DriverError> {
        let rules = build_node_port_rules(service, protocol, node_port, proxy_ip, proxy_port, host_ip);
        let mut first_err = None;
        for rule in rules {
            if let Err(err) = self.driver.delete_rule(rule.table, rule.chain, &rule.args) {
                if !self.driver.is_not_found_error(&err) {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The authoritative retraction: deletes the five entry-point rules
    /// (ignoring not-found), flushes the five chains, then deletes them.
    pub fn cleanup_leftovers(&self) {
        for ep in entry_points() {
            if let Err(err) = self
                .driver
                .delete_rule(ep.table, ep.hook_chain, &ep.jump_args)
            {
                if !self.driver.is_not_found_error(&err) {
                    log::warn!("cleanup: failed to delete entry rule for {}: {err}", ep.chain);
                }
            }
        }

        for ep in entry_points() {
            if let Err(err) = self.driver.flush_chain(ep.table, ep.chain) {
                if !self.driver.is_not_found_error(&err) {
                    log::warn!("cleanup: failed to flush chain {}: {err}", ep.chain);
                }
            }
            if let Err(err) = self.driver.delete_chain(ep.table, ep.chain) {
                if !self.driver.is_not_found_error(&err) {
                    log::warn!("cleanup: failed to delete chain {}: {err}", ep.chain);
                }
            }
        }
    }
}

pub fn unspecified_proxy_ip() -> IpAddr {
    UNSPECIFIED_IPV4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingDriver {
        pub calls: Mutex<Vec<String>>,
    }

    impl IptablesDriver for RecordingDriver {
        fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool, DriverError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("ensure_chain {} {chain}", table.name()));
            Ok(false)
        }

        fn ensure_rule(
            &self,
            position: Position,
            table: Table,
            chain: &str,
            args: &[String],
        ) -> Result<bool, DriverError> {
            self.calls.lock().unwrap().push(format!(
                "ensure_rule {:?} {} {chain} {}",
                position,
                table.name(),
                args.join(" ")
            ));
            Ok(false)
        }

        fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<(), DriverError> {
            self.calls.lock().unwrap().push(format!(
                "delete_rule {} {chain} {}",
                table.name(),
                args.join(" ")
            ));
            Ok(())
        }

        fn flush_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("flush_chain {} {chain}", table.name()));
            Ok(())
        }

        fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete_chain {} {chain}", table.name()));
            Ok(())
        }

        fn is_not_found_error(&self, _err: &DriverError) -> bool {
            false
        }
    }

    #[test]
    fn init_installs_five_chains_portals_before_nodeport() {
        let driver = RecordingDriver::default();
        let program = FilterProgram::new(driver);
        program.init().unwrap();

        let calls = program.driver().calls.lock().unwrap();
        let portals_container = calls
            .iter()
            .position(|c| c.contains(CHAIN_PORTALS_CONTAINER) && c.contains("PREROUTING"))
            .unwrap();
        let nodeport_container = calls
            .iter()
            .position(|c| c.contains(CHAIN_NODEPORT_CONTAINER) && c.contains("PREROUTING"))
            .unwrap();
        assert!(portals_container < nodeport_container);
        assert_eq!(calls.iter().filter(|c| c.starts_with("ensure_chain")).count(), 5);
    }

    #[test]
    fn cleanup_deletes_rules_before_flushing_and_deleting_chains() {
        let driver = RecordingDriver::default();
        let program = FilterProgram::new(driver);
        program.cleanup_leftovers();

        let calls = program.driver().calls.lock().unwrap();
        let last_delete_rule = calls.iter().rposition(|c| c.starts_with("delete_rule")).unwrap();
        let first_flush = calls.iter().position(|c| c.starts_with("flush_chain")).unwrap();
        assert!(last_delete_rule < first_flush);
        assert_eq!(calls.iter().filter(|c| c.starts_with("delete_chain")).count(), 5);
    }
}
