mod config;
mod conntrack;
mod hostaddr;
mod iptables;

use std::sync::Arc;
use std::thread;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use config::Config;
use conntrack::ShellConntrackEvictor;
use iptables::ShellIptablesDriver;
use svcproxy_core::filter::FilterProgram;
use svcproxy_core::load_balancer::RoundRobinStub;
use svcproxy_core::ports::PortAllocator;
use svcproxy_core::proxy_socket::default_proxy_socket_func;
use svcproxy_core::{Reconciler, ReconcilerConfig};

/// Best-effort raises `RLIMIT_NOFILE` to its hard limit, per `spec.md`
/// §1's characterization of this as a "simple wrapper helper" and §7's
/// disposition for forwarding-loop FD exhaustion (not fatal, just logged).
#[cfg(unix)]
fn raise_fd_limit() {
    use rlimit::{getrlimit, setrlimit, Resource};

    match getrlimit(Resource::NOFILE) {
        Ok((soft, hard)) => {
            if let Err(err) = setrlimit(Resource::NOFILE, hard, hard) {
                log::warn!("failed to raise RLIMIT_NOFILE from {soft} to {hard}: {err}");
            } else {
                log::info!("raised RLIMIT_NOFILE to {hard}");
            }
        }
        Err(err) => log::warn!("failed to read RLIMIT_NOFILE: {err}"),
    }
}

#[cfg(not(unix))]
fn raise_fd_limit() {}

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    raise_fd_limit();

    let host_ip = hostaddr::primary_host_ip().unwrap_or(config.net.listen_ip);
    log::info!(
        "starting: listen_ip={} host_ip={} proxy_port_range={}-{}",
        config.net.listen_ip,
        host_ip,
        config.net.proxy_port_range.start,
        config.net.proxy_port_range.end
    );

    let filter = FilterProgram::new(ShellIptablesDriver::ipv4());

    // The load-balancer *policy* (round-robin selection, session-affinity
    // bookkeeping) is an explicit Non-goal of the core (`spec.md` §1); this
    // crate ships only the minimal round-robin fixture, matching that
    // scope. A real deployment wires in its own policy implementation
    // behind the same `LoadBalancer` trait — see DESIGN.md.
    let load_balancer = Arc::new(RoundRobinStub::new());

    let reconciler = Arc::new(Reconciler::new(ReconcilerConfig {
        listen_ip: config.net.listen_ip,
        host_ip,
        udp_idle_timeout: config.udp.idle_timeout(),
        min_sync_period: config.sync.min_period(),
        sync_period: config.sync.period(),
        sync_burst: 2,
        port_allocator: PortAllocator::new(config.net.proxy_port_range.into_range()),
        filter,
        proxy_socket_func: default_proxy_socket_func(),
        load_balancer,
        conntrack: Arc::new(ShellConntrackEvictor),
        local_addresses: Arc::new(hostaddr::local_addresses),
    })?);

    // No control-plane transport is defined by the core (`spec.md` §1) —
    // an external watch/gRPC client wires into `reconciler.on_service_*` /
    // `on_endpoints_*` elsewhere. This binary's job ends at standing the
    // reconciler up and driving its sync loop.
    let sync_loop_reconciler = reconciler.clone();
    let sync_loop = thread::spawn(move || sync_loop_reconciler.sync_loop());

    sync_loop.join().expect("sync loop thread panicked");
    Ok(())
}
