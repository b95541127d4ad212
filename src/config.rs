//! Configuration loading for the glue binary. The core crate never sees a
//! config file or a CLI flag — everything here is translated into
//! `svcproxy_core` types before being handed to the reconciler.

use std::fs::read_to_string;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use svcproxy_core::ports::PortRange;

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_proxy_port_range() -> PortRangeConfig {
    PortRangeConfig {
        start: 32768,
        end: 60999,
    }
}

fn default_min_sync_period_ms() -> u64 {
    1_000
}

fn default_sync_period_ms() -> u64 {
    30_000
}

fn default_udp_timeout_secs() -> u64 {
    60
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct PortRangeConfig {
    pub start: u16,
    pub end: u16,
}

impl PortRangeConfig {
    pub fn into_range(self) -> PortRange {
        PortRange::new(self.start, self.end)
    }
}

#[derive(Deserialize, Debug)]
pub struct Net {
    /// Local address the proxy sockets bind to. Unspecified (the default)
    /// means every proxy socket listens on all local addresses, and the
    /// filter program picks `REDIRECT`/host-DNAT jump targets rather than
    /// DNAT-to-a-fixed-IP everywhere — see `spec.md` §4.C.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    #[serde(default = "default_proxy_port_range")]
    pub proxy_port_range: PortRangeConfig,
}

impl Default for Net {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            proxy_port_range: default_proxy_port_range(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Sync {
    #[serde(default = "default_min_sync_period_ms")]
    pub min_period_ms: u64,
    #[serde(default = "default_sync_period_ms")]
    pub period_ms: u64,
}

impl Default for Sync {
    fn default() -> Self {
        Self {
            min_period_ms: default_min_sync_period_ms(),
            period_ms: default_sync_period_ms(),
        }
    }
}

impl Sync {
    pub fn min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Udp {
    #[serde(default = "default_udp_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Udp {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub net: Net,
    #[serde(default)]
    pub sync: Sync,
    #[serde(default)]
    pub udp: Udp,
}

#[derive(Parser)]
#[command(
    name = "svcproxy",
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path to a TOML configuration file. Defaults are used for anything
    /// the file doesn't set, and an absent file falls back to all
    /// defaults.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let contents = match cli.config {
            Some(path) => read_to_string(&path)
                .map_err(|err| anyhow::anyhow!("failed to read config file {path}: {err}"))?,
            None => String::new(),
        };
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.net.listen_ip, default_listen_ip());
        assert_eq!(config.sync.min_period(), Duration::from_secs(1));
        assert_eq!(config.sync.period(), Duration::from_secs(30));
        assert_eq!(config.udp.idle_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_config_overrides_only_what_it_sets() {
        let toml = r#"
            [net]
            listen_ip = "10.0.0.1"

            [sync]
            min_period_ms = 500
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.net.listen_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.sync.min_period(), Duration::from_millis(500));
        assert_eq!(config.sync.period(), Duration::from_secs(30));
    }
}
