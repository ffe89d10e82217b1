//! UDP discovery adapter (spec §4.G), grounded on the source's `DiscoverProtocol`: peers
//! broadcast a `DISC <random f64>` datagram on startup; on receiving one from an address other
//! than ourselves, whichever side holds the smaller random number dials the TCP connection,
//! so exactly one side of every pair initiates — the other just waits to accept.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::causal::CausalOrderManager;
use crate::roster::PeerRoster;
use crate::transport::TcpTransport;

const DISCOVER_PREFIX: &str = "DISC ";

pub struct Discovery {
    socket: UdpSocket,
    discovery_port: u16,
    tcp_port: u16,
    self_ip: std::net::IpAddr,
    random_real: f64,
}

impl Discovery {
    pub async fn bind(discovery_port: u16, tcp_port: u16, self_ip: std::net::IpAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", discovery_port))
            .await
            .with_context(|| format!("binding udp discovery socket on port {discovery_port}"))?;
        socket.set_broadcast(true)?;
        let random_real = rand::thread_rng().gen::<f64>();
        Ok(Arc::new(Self { socket, discovery_port, tcp_port, self_ip, random_real }))
    }

    /// Sends the initial broadcast after a short random delay (spread out simultaneous startups,
    /// as in the source), then loops forever answering and reacting to `DISC` datagrams.
    pub async fn run(
        self: Arc<Self>,
        tcp: Arc<TcpTransport>,
        roster: Arc<PeerRoster<TcpTransport>>,
        com: Arc<CausalOrderManager<TcpTransport>>,
    ) -> Result<()> {
        let initial = self.clone();
        tokio::spawn(async move {
            let delay = Duration::from_millis(rand::thread_rng().gen_range(1_000..5_000));
            tokio::time::sleep(delay).await;
            initial.broadcast_to(("255.255.255.255", initial.discovery_port)).await;
        });

        let mut buf = [0u8; 256];
        loop {
            let (n, addr) = self.socket.recv_from(&mut buf).await?;
            let datagram = String::from_utf8_lossy(&buf[..n]);
            if addr.ip() == self.self_ip {
                continue;
            }
            let Some(rest) = datagram.strip_prefix(DISCOVER_PREFIX) else { continue };
            let Ok(other_random_real) = rest.trim().parse::<f64>() else {
                warn!(%datagram, "malformed discovery datagram, ignoring");
                continue;
            };
            debug!(from = %addr, mine = self.random_real, theirs = other_random_real, "discovery datagram");

            if self.random_real < other_random_real {
                let connect_addr = SocketAddr::new(addr.ip(), self.tcp_port);
                let tcp = tcp.clone();
                let roster = roster.clone();
                let com = com.clone();
                tokio::spawn(async move {
                    if let Err(e) = tcp.connect(connect_addr, roster, com).await {
                        warn!(%connect_addr, error = %e, "discovery-initiated connect failed");
                    }
                });
            } else {
                self.reply_to(addr).await;
            }
        }
    }

    async fn broadcast_to(&self, target: (&str, u16)) {
        let message = format!("{DISCOVER_PREFIX}{}", self.random_real);
        if let Err(e) = self.socket.send_to(message.as_bytes(), target).await {
            warn!(error = %e, "failed to send discovery broadcast");
        }
    }

    async fn reply_to(&self, addr: SocketAddr) {
        let message = format!("{DISCOVER_PREFIX}{}", self.random_real);
        if let Err(e) = self.socket.send_to(message.as_bytes(), addr).await {
            warn!(%addr, error = %e, "failed to reply to discovery datagram");
        }
    }
}
