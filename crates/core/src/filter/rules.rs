//! Rule-argument construction for portals and node ports.
//!
//! Argument order matters: a driver that matches existing rules by parsing
//! `iptables-save` output needs byte-identical argument sequences to
//! recognize a rule it already installed. See `spec.md` §4.C for the exact
//! sequence this follows.

use std::net::IpAddr;

use super::{
    Table, CHAIN_NODEPORT_CONTAINER, CHAIN_NODEPORT_HOST, CHAIN_NODEPORT_NON_LOCAL,
    CHAIN_PORTALS_CONTAINER, CHAIN_PORTALS_HOST,
};
use crate::types::{Portal, Protocol, ServicePortName, UNSPECIFIED_IPV4};

pub struct PortalRule {
    pub table: Table,
    pub chain: &'static str,
    pub args: Vec<String>,
}

fn comment(service: &ServicePortName) -> Vec<String> {
    vec!["--comment".into(), service.to_string()]
}

fn proto_match(protocol: Protocol) -> Vec<String> {
    vec![
        "-p".into(),
        protocol.as_str().into(),
        "-m".into(),
        protocol.as_str().into(),
    ]
}

fn jump_args(proxy_ip: IpAddr, proxy_port: u16, host_side: bool, host_ip: IpAddr) -> Vec<String> {
    if proxy_ip == UNSPECIFIED_IPV4 {
        if host_side {
            vec![
                "-j".into(),
                "DNAT".into(),
                "--to-destination".into(),
                format!("{host_ip}:{proxy_port}"),
            ]
        } else {
            vec!["-j".into(), "REDIRECT".into(), "--to-ports".into(), proxy_port.to_string()]
        }
    } else {
        vec![
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            format!("{proxy_ip}:{proxy_port}"),
        ]
    }
}

/// Builds the rule set for one portal (cluster IP, external IP, or
/// load-balancer ingress IP). External portals get 3 rules; the cluster IP
/// (non-external) portal gets 2, since nothing but in-cluster traffic can
/// reach it and there's no need for the physdev split.
pub fn build_portal_rules(
    service: &ServicePortName,
    protocol: Protocol,
    portal: Portal,
    proxy_ip: IpAddr,
    proxy_port: u16,
    host_ip: IpAddr,
) -> Vec<PortalRule> {
    let dport = vec!["--dport".into(), portal.port.to_string()];
    let dst = vec!["-d".into(), format!("{}/32", portal.ip)];

    let mut rules = Vec::new();

    if portal.is_external {
        // Container-facing, off-host traffic: not yet categorized LOCAL.
        let mut args = comment(service);
        args.extend(proto_match(protocol));
        args.extend(dport.clone());
        args.extend(dst.clone());
        args.extend(["-m".into(), "physdev".into(), "!".into(), "--physdev-is-in".into()]);
        args.extend(jump_args(proxy_ip, proxy_port, false, host_ip));
        rules.push(PortalRule {
            table: Table::Nat,
            chain: CHAIN_PORTALS_CONTAINER,
            args,
        });

        // Container-facing, traffic already categorized LOCAL (originated
        // on-host but destined for the external address).
        let mut args = comment(service);
        args.extend(proto_match(protocol));
        args.extend(dport.clone());
        args.extend(dst.clone());
        args.extend(["-m".into(), "addrtype".into(), "--dst-type".into(), "LOCAL".into()]);
        args.extend(jump_args(proxy_ip, proxy_port, false, host_ip));
        rules.push(PortalRule {
            table: Table::Nat,
            chain: CHAIN_PORTALS_CONTAINER,
            args,
        });

        // Host-originated traffic.
        let mut args = comment(service);
        args.extend(proto_match(protocol));
        args.extend(dport);
        args.extend(dst);
        args.extend(["-m".into(), "addrtype".into(), "--dst-type".into(), "LOCAL".into()]);
        args.extend(jump_args(proxy_ip, proxy_port, true, host_ip));
        rules.push(PortalRule {
            table: Table::Nat,
            chain: CHAIN_PORTALS_HOST,
            args,
        });
    } else {
        // Cluster IP: container-facing only, no physdev/addrtype split.
        let mut args = comment(service);
        args.extend(proto_match(protocol));
        args.extend(dport.clone());
        args.extend(dst.clone());
        args.extend(jump_args(proxy_ip, proxy_port, false, host_ip));
        rules.push(PortalRule {
            table: Table::Nat,
            chain: CHAIN_PORTALS_CONTAINER,
            args,
        });

        let mut args = comment(service);
        args.extend(proto_match(protocol));
        args.extend(dport);
        args.extend(dst);
        args.extend(jump_args(proxy_ip, proxy_port, true, host_ip));
        rules.push(PortalRule {
            table: Table::Nat,
            chain: CHAIN_PORTALS_HOST,
            args,
        });
    }

    rules
}

/// Builds the node-port rule set: container + host DNAT/REDIRECT, both with
/// a `--dst-type LOCAL` match and no `-d` (a node port has no specific
/// destination, only "this host"), plus the filter-table accept rule. The
/// accept rule matches the proxy port, per `spec.md` §4.C's literal wording.
pub fn build_node_port_rules(
    service: &ServicePortName,
    protocol: Protocol,
    node_port: u16,
    proxy_ip: IpAddr,
    proxy_port: u16,
    host_ip: IpAddr,
) -> Vec<PortalRule> {
    let dport = vec!["--dport".into(), node_port.to_string()];

    let dst_local = vec!["-m".into(), "addrtype".into(), "--dst-type".into(), "LOCAL".into()];

    let mut container_args = comment(service);
    container_args.extend(proto_match(protocol));
    container_args.extend(dport.clone());
    container_args.extend(dst_local.clone());
    container_args.extend(jump_args(proxy_ip, proxy_port, false, host_ip));

    let mut host_args = comment(service);
    host_args.extend(proto_match(protocol));
    host_args.extend(dport);
    host_args.extend(dst_local);
    host_args.extend(jump_args(proxy_ip, proxy_port, true, host_ip));

    let accept_args = vec![
        "-p".into(),
        protocol.as_str().into(),
        "-m".into(),
        protocol.as_str().into(),
        "--dport".into(),
        proxy_port.to_string(),
        "-m".into(),
        "state".into(),
        "--state".into(),
        "NEW".into(),
        "-j".into(),
        "ACCEPT".into(),
    ];

    vec![
        PortalRule {
            table: Table::Nat,
            chain: CHAIN_NODEPORT_CONTAINER,
            args: container_args,
        },
        PortalRule {
            table: Table::Nat,
            chain: CHAIN_NODEPORT_HOST,
            args: host_args,
        },
        PortalRule {
            table: Table::Filter,
            chain: CHAIN_NODEPORT_NON_LOCAL,
            args: accept_args,
        },
    ]
}
