//! 4.H Reconciler and 4.I public event surface.
//!
//! The authoritative map from service identity to installed [`ServiceInfo`].
//! Owns the change tracker (G), the bounded-frequency runner (F), the port
//! allocator (A), the claim registry (B), and the filter program (C), and
//! drives the proxy sockets (D) it creates through the injected
//! [`ProxySocketFunc`].
//!
//! Lock order, per `spec.md` §5, highest to lowest: `serviceChangesLock` →
//! `serviceMapLock` → `portMapLock`. The change tracker and claim registry
//! guard themselves; this module only ever holds `service_map` directly, and
//! never while a change-tracker or claim-registry call is outstanding in a
//! way that could re-enter back into the map lock.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::change_tracker::ChangeTracker;
use crate::claims::PortClaimRegistry;
use crate::error::Error;
use crate::filter::{FilterProgram, IptablesDriver};
use crate::load_balancer::LoadBalancer;
use crate::ports::PortAllocator;
use crate::proxy_socket::{ProxySocket, ProxySocketFunc};
use crate::runner::BoundedFrequencyRunner;
use crate::types::{
    EndpointsDescriptor, LifecycleFlags, Portal, Protocol, ServiceDescriptor, ServiceInfo,
    ServicePortName, ServicePortSpec,
};

/// Emits a conntrack eviction for one stale virtual IP after a UDP service
/// port is unmerged. `spec.md` §9 calls out that the source dropped this on
/// the floor (no conntrack driver) and that a faithful implementation
/// should reinstate it; the driver itself — like the iptables driver — is a
/// collaborator, not part of the core.
pub trait ConntrackEvictor: Send + Sync {
    fn evict(&self, ip: IpAddr, port: u16, protocol: Protocol);
}

/// A no-op evictor for configurations that have no conntrack driver wired
/// in (e.g. platforms without `conntrack-tools`, or tests).
pub struct NullConntrackEvictor;

impl ConntrackEvictor for NullConntrackEvictor {
    fn evict(&self, _ip: IpAddr, _port: u16, _protocol: Protocol) {}
}

/// Discovers the node's local addresses, used by `ensure_portals` to decide
/// which claims are all-local node-port claims. Glue-owned per `spec.md`
/// §4.J — the core only calls through this.
pub type LocalAddressesFunc = Arc<dyn Fn() -> HashSet<IpAddr> + Send + Sync>;

struct InstalledService {
    info: ServiceInfo,
    socket: Arc<dyn ProxySocket>,
}

/// Everything the reconciler needs handed to it at construction: the
/// collaborators from `spec.md` §6, plus the two addresses it needs for
/// filter-rule jump targets (the IP the proxy listens on, and the host's
/// primary IP used for host-side DNAT targets when the listen IP is
/// unspecified).
pub struct ReconcilerConfig<D> {
    pub listen_ip: IpAddr,
    pub host_ip: IpAddr,
    pub udp_idle_timeout: Duration,
    pub min_sync_period: Duration,
    pub sync_period: Duration,
    pub sync_burst: u32,
    pub port_allocator: PortAllocator,
    pub filter: FilterProgram<D>,
    pub proxy_socket_func: ProxySocketFunc,
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub conntrack: Arc<dyn ConntrackEvictor>,
    pub local_addresses: LocalAddressesFunc,
}

pub struct Reconciler<D> {
    listen_ip: IpAddr,
    host_ip: IpAddr,
    udp_idle_timeout: Duration,
    service_map: Mutex<AHashMap<ServicePortName, Arc<InstalledService>>>,
    changes: ChangeTracker,
    claims: PortClaimRegistry,
    port_allocator: PortAllocator,
    filter: FilterProgram<D>,
    load_balancer: Arc<dyn LoadBalancer>,
    proxy_socket_func: ProxySocketFunc,
    conntrack: Arc<dyn ConntrackEvictor>,
    local_addresses_func: LocalAddressesFunc,
    local_addresses: Mutex<HashSet<IpAddr>>,
    runner: BoundedFrequencyRunner,
    stop: Arc<AtomicBool>,
    services_synced: AtomicBool,
    endpoints_synced: AtomicBool,
    initialized: AtomicBool,
}

impl<D: IptablesDriver> Reconciler<D> {
    /// Installs the fixed filter topology (fatal here, per the resolved
    /// Open Question in DESIGN.md — steady-state drift is tolerated, but a
    /// proxy that can't even install its chains at boot has nothing useful
    /// to do).
    pub fn new(config: ReconcilerConfig<D>) -> Result<Self, crate::filter::DriverError> {
        config.filter.init()?;

        Ok(Self {
            listen_ip: config.listen_ip,
            host_ip: config.host_ip,
            udp_idle_timeout: config.udp_idle_timeout,
            service_map: Mutex::new(AHashMap::new()),
            changes: ChangeTracker::new(),
            claims: PortClaimRegistry::new(),
            port_allocator: config.port_allocator,
            filter: config.filter,
            load_balancer: config.load_balancer,
            proxy_socket_func: config.proxy_socket_func,
            conntrack: config.conntrack,
            local_addresses_func: config.local_addresses,
            local_addresses: Mutex::new(HashSet::new()),
            runner: BoundedFrequencyRunner::new(
                "service-reconciler",
                config.min_sync_period,
                config.sync_period,
                config.sync_burst,
            ),
            stop: Arc::new(AtomicBool::new(false)),
            services_synced: AtomicBool::new(false),
            endpoints_synced: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        })
    }

    // ---- 4.I public event surface -------------------------------------

    pub fn on_service_add(&self, svc: ServiceDescriptor) {
        self.push_change(None, Some(svc));
    }

    pub fn on_service_update(&self, old: ServiceDescriptor, new: ServiceDescriptor) {
        self.push_change(Some(old), Some(new));
    }

    pub fn on_service_delete(&self, svc: ServiceDescriptor) {
        self.push_change(Some(svc), None);
    }

    fn push_change(&self, previous: Option<ServiceDescriptor>, current: Option<ServiceDescriptor>) {
        self.changes.update(previous, current);
        // `Run()` is a non-blocking coalescing send (see `runner.rs`), so
        // calling it inline here already satisfies "must not block the
        // event caller", without needing a detached thread.
        if self.initialized.load(Ordering::Acquire) {
            self.runner.run();
        }
    }

    pub fn on_service_synced(&self) {
        self.services_synced.store(true, Ordering::Release);
        self.maybe_initialize();
    }

    pub fn on_endpoints_add(&self, endpoints: &EndpointsDescriptor, service: &ServicePortName) {
        self.load_balancer.on_endpoints_add(endpoints, service);
    }

    pub fn on_endpoints_delete(&self, endpoints: &EndpointsDescriptor, service: &ServicePortName) {
        self.load_balancer.on_endpoints_delete(endpoints, service);
    }

    pub fn on_endpoints_synced(&self) {
        self.endpoints_synced.store(true, Ordering::Release);
        self.load_balancer.on_endpoints_synced();
        self.maybe_initialize();
    }

    fn maybe_initialize(&self) {
        if !self.services_synced.load(Ordering::Acquire) || !self.endpoints_synced.load(Ordering::Acquire) {
            return;
        }
        if !self.initialized.swap(true, Ordering::AcqRel) {
            log::info!("reconciler initialized, kicking first reconciliation");
            self.runner.run();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // ---- request / drive -----------------------------------------------

    /// Requests a reconciliation. A no-op before initialization: the runner
    /// itself is always armed, but callers should prefer the event-surface
    /// methods above, which gate on `initialized` for you.
    pub fn sync(&self) {
        self.runner.run();
    }

    /// Runs reconciliations until `stop` observes true. Call from one
    /// dedicated thread (the "sync loop").
    pub fn sync_loop(&self) {
        self.runner.loop_until(&self.stop, || self.reconcile());
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Closes every live service's proxy socket and marks it finished, then
    /// signals the sync loop and runner to stop. Filter rules and claims
    /// are left in place — only `CleanupLeftovers` retracts those.
    pub fn shutdown(&self) {
        let map = self.service_map.lock();
        for installed in map.values() {
            installed.socket.close();
            installed.info.flags.mark_finished();
        }
        drop(map);
        self.stop.store(true, Ordering::Release);
    }

    pub fn service_count(&self) -> usize {
        self.service_map.lock().len()
    }

    // ---- 4.H reconciliation ---------------------------------------------

    fn reconcile(&self) {
        if !self.initialized.load(Ordering::Acquire) {
            log::debug!("reconciliation requested before services/endpoints synced, skipping");
            return;
        }

        let drained = self.changes.drain();
        let mut map = self.service_map.lock();

        for change in drained {
            let covered = self.merge(&mut map, change.current.as_ref());
            self.unmerge(&mut map, change.previous.as_ref(), &covered);
        }

        self.refresh_local_addresses();
        self.ensure_portals(&map);
        self.cleanup_stale_sticky_sessions(&map);
    }

    fn refresh_local_addresses(&self) {
        let addrs = (self.local_addresses_func)();
        *self.local_addresses.lock() = addrs;
    }

    /// Installs everything `current` needs. Returns the set of port names
    /// now covered by it, so the caller can unmerge whatever `previous` had
    /// that isn't in this set.
    fn merge(
        &self,
        map: &mut AHashMap<ServicePortName, Arc<InstalledService>>,
        current: Option<&ServiceDescriptor>,
    ) -> HashSet<ServicePortName> {
        let Some(desc) = current else {
            return HashSet::new();
        };

        if !desc.is_proxyable() {
            return HashSet::new();
        }

        let mut covered = HashSet::with_capacity(desc.ports.len());
        for port in &desc.ports {
            let name = ServicePortName {
                namespace: desc.namespace.clone(),
                name: desc.name.clone(),
                port_name: port.port_name.clone(),
            };
            covered.insert(name.clone());
            self.merge_port(map, &name, desc, port);
        }
        covered
    }

    fn merge_port(
        &self,
        map: &mut AHashMap<ServicePortName, Arc<InstalledService>>,
        name: &ServicePortName,
        desc: &ServiceDescriptor,
        spec: &ServicePortSpec,
    ) {
        if let Some(existing) = map.get(name) {
            if existing.info.same_config(spec, desc) {
                return;
            }

            log::info!("{name}: config changed, recreating");
            let existing = map.remove(name).expect("just matched above");
            self.cleanup_portal_and_proxy(name, &existing);
            self.load_balancer.delete_service(name);
        }

        let Some(cluster_ip) = desc.cluster_ip else {
            return;
        };

        let proxy_port = match self.port_allocator.allocate_next() {
            Some(p) => p,
            None => {
                log::warn!("{}", Error::PortAllocation { service: name.clone() });
                return;
            }
        };

        let socket: Arc<dyn ProxySocket> = match (self.proxy_socket_func)(
            spec.protocol,
            self.listen_ip,
            proxy_port,
            self.udp_idle_timeout,
        ) {
            Ok(s) => Arc::from(s),
            Err(source) => {
                log::warn!(
                    "{}",
                    Error::Bind {
                        service: name.clone(),
                        ip: self.listen_ip,
                        port: proxy_port,
                        source,
                    }
                );
                self.port_allocator.release(proxy_port);
                return;
            }
        };

        if spec.node_port != 0 {
            if let Err(err) = self.claims.claim_node_port(None, spec.node_port, spec.protocol, name) {
                log::warn!("{name}: {err}");
                socket.close();
                self.port_allocator.release(proxy_port);
                return;
            }
        }

        let info = ServiceInfo {
            name: name.clone(),
            protocol: spec.protocol,
            portal: Portal {
                ip: cluster_ip,
                port: spec.port,
                is_external: false,
            },
            external_ips: desc.external_ips.clone(),
            load_balancer_ips: desc.load_balancer_ips.clone(),
            node_port: spec.node_port,
            proxy_port,
            timeout: self.udp_idle_timeout,
            sticky_max_age_seconds: desc
                .session_affinity
                .map(|a| a.sticky_max_age_seconds)
                .unwrap_or(0),
            session_affinity: desc.session_affinity.is_some(),
            flags: Arc::new(LifecycleFlags::new_alive()),
        };

        if let Err(err) = self.install_rules(name, &info) {
            log::warn!(
                "{}",
                Error::FilterRule {
                    service: name.clone(),
                    reason: err.to_string(),
                }
            );
            self.teardown_rules_best_effort(name, &info);
            socket.close();
            self.port_allocator.release(proxy_port);
            if spec.node_port != 0 {
                let _ = self.claims.release_node_port(None, spec.node_port, spec.protocol, name);
            }
            return;
        }

        self.load_balancer
            .new_service(name, desc.session_affinity, info.sticky_max_age_seconds);

        let installed = Arc::new(InstalledService { info, socket: socket.clone() });
        map.insert(name.clone(), installed.clone());

        let flags = installed.info.flags.clone();
        let protocol = installed.info.protocol;
        let loop_name = name.clone();
        let load_balancer = self.load_balancer.clone();
        thread::spawn(move || {
            socket.proxy_loop(&loop_name, &flags, protocol, load_balancer.as_ref());
        });

        log::info!(
            "{name}: merged, proxy_port={proxy_port} protocol={:?}",
            installed.info.protocol
        );
    }

    /// Tears down whatever filter rules might have been partially installed
    /// before a failure, ignoring further errors: this is best-effort
    /// unwinding of a merge that is being abandoned, not the authoritative
    /// retraction path.
    fn teardown_rules_best_effort(&self, name: &ServicePortName, info: &ServiceInfo) {
        for portal in self.all_portals(info) {
            let _ = self
                .filter
                .close_portal(name, info.protocol, portal, self.listen_ip, info.proxy_port, self.host_ip);
        }
        if info.node_port != 0 {
            let _ = self.filter.close_node_port(
                name,
                info.protocol,
                info.node_port,
                self.listen_ip,
                info.proxy_port,
                self.host_ip,
            );
        }
    }

    fn install_rules(&self, name: &ServicePortName, info: &ServiceInfo) -> Result<(), crate::filter::DriverError> {
        for portal in self.all_portals(info) {
            self.filter
                .open_portal(name, info.protocol, portal, self.listen_ip, info.proxy_port, self.host_ip)?;
        }
        if info.node_port != 0 {
            self.filter.open_node_port(
                name,
                info.protocol,
                info.node_port,
                self.listen_ip,
                info.proxy_port,
                self.host_ip,
            )?;
        }
        Ok(())
    }

    fn all_portals(&self, info: &ServiceInfo) -> Vec<Portal> {
        let mut portals = Vec::with_capacity(1 + info.external_ips.len() + info.load_balancer_ips.len());
        portals.push(info.portal);
        for ip in &info.external_ips {
            portals.push(Portal {
                ip: *ip,
                port: info.portal.port,
                is_external: true,
            });
        }
        for ip in &info.load_balancer_ips {
            portals.push(Portal {
                ip: *ip,
                port: info.portal.port,
                is_external: true,
            });
        }
        portals
    }

    /// Removes everything `previous` had that `covered` (the new spec's
    /// ports) doesn't claim.
    fn unmerge(
        &self,
        map: &mut AHashMap<ServicePortName, Arc<InstalledService>>,
        previous: Option<&ServiceDescriptor>,
        covered: &HashSet<ServicePortName>,
    ) {
        let Some(desc) = previous else {
            return;
        };

        for name in desc.service_port_names() {
            if covered.contains(&name) {
                continue;
            }
            self.unmerge_port(map, &name);
        }
    }

    fn unmerge_port(&self, map: &mut AHashMap<ServicePortName, Arc<InstalledService>>, name: &ServicePortName) {
        let Some(installed) = map.remove(name) else {
            log::debug!("{name}: unmerge of unknown service port, skipping");
            return;
        };

        if installed.info.protocol == Protocol::Udp {
            for portal in self.all_portals(&installed.info) {
                self.conntrack.evict(portal.ip, portal.port, Protocol::Udp);
            }
        }

        self.cleanup_portal_and_proxy(name, &installed);
        self.load_balancer.delete_service(name);
        log::info!("{name}: unmerged");
    }

    /// Closes filter rules, closes the socket, releases the proxy port and
    /// any node-port claim, and marks the service finished. Aggregates
    /// filter-retraction failures but always runs every step.
    fn cleanup_portal_and_proxy(&self, name: &ServicePortName, installed: &InstalledService) {
        let info = &installed.info;
        let mut errors = Vec::new();

        for portal in self.all_portals(info) {
            if let Err(err) =
                self.filter
                    .close_portal(name, info.protocol, portal, self.listen_ip, info.proxy_port, self.host_ip)
            {
                errors.push(err.to_string());
            }
        }

        if info.node_port != 0 {
            if let Err(err) = self.filter.close_node_port(
                name,
                info.protocol,
                info.node_port,
                self.listen_ip,
                info.proxy_port,
                self.host_ip,
            ) {
                errors.push(err.to_string());
            }

            if let Err(err) = self.claims.release_node_port(None, info.node_port, info.protocol, name) {
                errors.push(err.to_string());
            }
        }

        installed.socket.close();
        self.port_allocator.release(info.proxy_port);
        info.flags.mark_finished();

        if let Some(first) = errors.first() {
            log::warn!(
                "{}",
                Error::Unmerge {
                    service: name.clone(),
                    count: errors.len(),
                    first: first.clone(),
                }
            );
        }
    }

    /// Re-emits rules for every live service, idempotently. Covers drift
    /// from an external actor (or a tolerated failure earlier in this same
    /// pass) without needing a dedicated "did this fail" bookkeeping pass.
    fn ensure_portals(&self, map: &AHashMap<ServicePortName, Arc<InstalledService>>) {
        self.filter.ensure_topology();

        for (name, installed) in map.iter() {
            if let Err(err) = self.install_rules(name, &installed.info) {
                log::warn!("{name}: ensure_portals drift repair failed, will retry next pass: {err}");
            }
        }
    }

    fn cleanup_stale_sticky_sessions(&self, map: &AHashMap<ServicePortName, Arc<InstalledService>>) {
        for name in map.keys() {
            self.load_balancer.cleanup_stale_sticky_sessions(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{DriverError, Position, Table};
    use crate::load_balancer::RoundRobinStub;
    use crate::ports::PortRange;
    use crate::proxy_socket::default_proxy_socket_func;
    use crate::types::{Protocol, ServicePortSpec};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingDriver {
        calls: StdMutex<Vec<String>>,
    }

    impl IptablesDriver for RecordingDriver {
        fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool, DriverError> {
            self.calls.lock().unwrap().push(format!("ensure_chain {chain} {table:?}"));
            Ok(false)
        }

        fn ensure_rule(&self, _position: Position, table: Table, chain: &str, args: &[String]) -> Result<bool, DriverError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("ensure_rule {table:?} {chain} {}", args.join(" ")));
            Ok(false)
        }

        fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<(), DriverError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete_rule {table:?} {chain} {}", args.join(" ")));
            Ok(())
        }

        fn flush_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
            self.calls.lock().unwrap().push(format!("flush_chain {table:?} {chain}"));
            Ok(())
        }

        fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
            self.calls.lock().unwrap().push(format!("delete_chain {table:?} {chain}"));
            Ok(())
        }

        fn is_not_found_error(&self, _err: &DriverError) -> bool {
            false
        }
    }

    fn build_reconciler() -> Reconciler<RecordingDriver> {
        let driver = RecordingDriver::default();
        let filter = FilterProgram::new(driver);
        Reconciler::new(ReconcilerConfig {
            listen_ip: "127.0.0.1".parse().unwrap(),
            host_ip: "127.0.0.1".parse().unwrap(),
            udp_idle_timeout: Duration::from_secs(1),
            min_sync_period: Duration::from_millis(5),
            sync_period: Duration::from_millis(50),
            sync_burst: 2,
            port_allocator: PortAllocator::new(PortRange::new(41000, 41100)),
            filter,
            proxy_socket_func: default_proxy_socket_func(),
            load_balancer: Arc::new(RoundRobinStub::new()),
            conntrack: Arc::new(NullConntrackEvictor),
            local_addresses: Arc::new(|| HashSet::new()),
        })
        .unwrap()
    }

    fn web_service(port: u16) -> ServiceDescriptor {
        ServiceDescriptor {
            namespace: "default".into(),
            name: "web".into(),
            cluster_ip: Some("10.0.0.5".parse().unwrap()),
            external_ips: vec![],
            load_balancer_ips: vec![],
            ports: vec![ServicePortSpec {
                port_name: "http".into(),
                protocol: Protocol::Tcp,
                port,
                node_port: 0,
            }],
            headless: false,
            session_affinity: None,
        }
    }

    fn run_one_pass(r: &Reconciler<RecordingDriver>) {
        r.on_service_synced();
        r.on_endpoints_synced();
        r.reconcile();
    }

    #[test]
    fn merge_installs_one_service_and_allocates_a_port() {
        let r = build_reconciler();
        r.on_service_add(web_service(80));
        run_one_pass(&r);
        assert_eq!(r.service_count(), 1);
    }

    #[test]
    fn same_config_update_is_a_no_op() {
        let r = build_reconciler();
        r.on_service_add(web_service(80));
        run_one_pass(&r);

        let proxy_port_before = {
            let map = r.service_map.lock();
            map.values().next().unwrap().info.proxy_port
        };

        r.on_service_update(web_service(80), web_service(80));
        r.reconcile();

        let proxy_port_after = {
            let map = r.service_map.lock();
            map.values().next().unwrap().info.proxy_port
        };

        assert_eq!(proxy_port_before, proxy_port_after);
    }

    #[test]
    fn delete_unmerges_and_closes_the_socket() {
        let r = build_reconciler();
        r.on_service_add(web_service(80));
        run_one_pass(&r);
        assert_eq!(r.service_count(), 1);

        r.on_service_delete(web_service(80));
        r.reconcile();
        assert_eq!(r.service_count(), 0);
    }

    #[test]
    fn headless_service_is_never_merged() {
        let r = build_reconciler();
        let mut svc = web_service(80);
        svc.headless = true;
        r.on_service_add(svc);
        run_one_pass(&r);
        assert_eq!(r.service_count(), 0);
    }

    #[test]
    fn reconcile_before_initialized_is_a_no_op() {
        let r = build_reconciler();
        r.on_service_add(web_service(80));
        r.reconcile();
        assert_eq!(r.service_count(), 0);
    }

    #[test]
    fn shutdown_closes_sockets_but_leaves_rules_and_claims() {
        let r = build_reconciler();
        r.on_service_add(web_service(80));
        run_one_pass(&r);
        assert_eq!(r.service_count(), 1);

        r.shutdown();
        assert_eq!(r.service_count(), 1);
        assert!(r.stop.load(Ordering::Acquire));

        let map = r.service_map.lock();
        let installed = map.values().next().unwrap();
        assert!(installed.info.flags.is_finished());
    }

    #[test]
    fn sync_loop_reconciles_after_synced_events() {
        let r = Arc::new(build_reconciler());
        r.on_service_add(web_service(80));

        let loop_r = r.clone();
        let handle = thread::spawn(move || loop_r.sync_loop());

        r.on_service_synced();
        r.on_endpoints_synced();

        let deadline = Instant::now() + Duration::from_secs(2);
        while r.service_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(r.service_count(), 1);

        r.shutdown();
        handle.join().unwrap();
    }
}
