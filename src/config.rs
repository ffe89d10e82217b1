//! Bootstrap configuration (spec §4.I), parsed with `clap` the way `swedishembedded-sven` wires
//! its CLI. Everything here is ambient: arguments, environment, and log setup, never COM state.

use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "causal-chat", about = "Decentralised peer-to-peer group chat with causal message ordering")]
pub struct NodeConfig {
    /// Display name used as this node's identity prefix (e.g. "alice").
    #[arg(long)]
    pub user_name: String,

    /// Local address this node's TCP listener binds to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_ip: IpAddr,

    /// TCP port accepting peer connections.
    #[arg(long, default_value_t = 9000)]
    pub tcp_port: u16,

    /// UDP port used for peer discovery broadcasts.
    #[arg(long, default_value_t = 9001)]
    pub discovery_port: u16,

    /// Skip UDP discovery and connect directly to this comma-separated list of `host:port` peers.
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<String>,
}

impl NodeConfig {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn self_ip(&self) -> IpAddr {
        if self.bind_ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.bind_ip
        }
    }
}

/// Installs the global `tracing` subscriber. Controlled by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
