//! Decentralised group chat entrypoint: wires a TCP transport, a peer roster, the causal-order
//! manager, the controller, and either UDP peer discovery or a statically configured peer list,
//! then hands off to the line-oriented REPL.

use std::net::SocketAddr;

use anyhow::Result;
use causal_chat::cli;
use causal_chat::config::{init_tracing, NodeConfig};
use causal_chat::controller::Controller;
use causal_chat::discovery::Discovery;
use causal_chat::transport::TcpTransport;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = NodeConfig::from_args();

    let listen_addr = SocketAddr::new(config.bind_ip, config.tcp_port);
    let self_peer = SocketAddr::new(config.self_ip(), config.tcp_port).to_string();

    let transport = TcpTransport::new();
    let controller = Controller::bootstrap(config.user_name.clone(), self_peer.clone(), transport.clone());

    info!(peer = %self_peer, "node started");

    let accept_transport = transport.clone();
    let accept_roster = controller.roster().clone();
    let accept_com = controller.com().clone();
    tokio::spawn(async move {
        if let Err(e) = accept_transport.run_accept_loop(listen_addr, accept_roster, accept_com).await {
            warn!(error = %e, "accept loop exited");
        }
    });

    if config.peers.is_empty() {
        let discovery = Discovery::bind(config.discovery_port, config.tcp_port, config.self_ip()).await?;
        let discovery_transport = transport.clone();
        let discovery_roster = controller.roster().clone();
        let discovery_com = controller.com().clone();
        tokio::spawn(async move {
            if let Err(e) = discovery.run(discovery_transport, discovery_roster, discovery_com).await {
                warn!(error = %e, "discovery loop exited");
            }
        });
    } else {
        for peer_addr in &config.peers {
            match peer_addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    let transport = transport.clone();
                    let roster = controller.roster().clone();
                    let com = controller.com().clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.connect(addr, roster, com).await {
                            warn!(%addr, error = %e, "failed to connect to configured peer");
                        }
                    });
                }
                Err(e) => warn!(%peer_addr, error = %e, "ignoring malformed peer address"),
            }
        }
    }

    cli::run(controller).await
}
