//! TCP transport adapter (spec §4.F): length-prefixed `bincode` frames over a plain
//! `tokio::net::TcpStream`. Grounded on the teacher's `network.rs` accept-loop / per-connection-
//! task split, adapted from QUIC uni-streams (self-framing) to TCP (a byte stream, so each frame
//! is prefixed with its length).
//!
//! A peer's identity is simply the remote socket's address as a string — no handshake, mirroring
//! the source's `protocols.py`, which keys peers off `transport.getPeer().host`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::causal::CausalOrderManager;
use crate::entry::PeerId;
use crate::roster::{PeerRoster, Transport};

const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

pub struct TcpTransport {
    writers: Mutex<HashMap<PeerId, UnboundedSender<Vec<u8>>>>,
}

impl TcpTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { writers: Mutex::new(HashMap::new()) })
    }

    /// Dials `addr`, registers the connection, and spawns its read/write tasks.
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        roster: Arc<PeerRoster<Self>>,
        com: Arc<CausalOrderManager<Self>>,
    ) -> Result<PeerId> {
        let stream = TcpStream::connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
        let peer = stream.peer_addr()?.to_string();
        self.adopt_connection(peer.clone(), stream, roster, com).await;
        Ok(peer)
    }

    /// Runs the accept loop for as long as the listener stays open, registering each inbound
    /// connection the same way an outbound `connect` does.
    pub async fn run_accept_loop(
        self: Arc<Self>,
        listen_addr: SocketAddr,
        roster: Arc<PeerRoster<Self>>,
        com: Arc<CausalOrderManager<Self>>,
    ) -> Result<()> {
        let listener = TcpListener::bind(listen_addr).await.with_context(|| format!("binding {listen_addr}"))?;
        info!(%listen_addr, "tcp transport listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            info!(%addr, "accepted connection");
            let peer = addr.to_string();
            self.adopt_connection(peer, stream, roster.clone(), com.clone()).await;
        }
    }

    async fn adopt_connection(
        self: &Arc<Self>,
        peer: PeerId,
        stream: TcpStream,
        roster: Arc<PeerRoster<Self>>,
        com: Arc<CausalOrderManager<Self>>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();

        self.writers.lock().await.insert(peer.clone(), tx);
        roster.on_connect(peer.clone(), peer.clone()).await;

        tokio::spawn(write_loop(write_half, rx));

        let this = self.clone();
        let read_peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = read_loop(read_half, &com).await {
                warn!(peer = %read_peer, error = %e, "connection closed");
            }
            this.writers.lock().await.remove(&read_peer);
            roster.on_disconnect(&read_peer).await;
        });
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        let len = bytes.len() as u32;
        if write_half.write_all(&len.to_be_bytes()).await.is_err() {
            return;
        }
        if write_half.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

async fn read_loop(mut read_half: tokio::net::tcp::OwnedReadHalf, com: &Arc<CausalOrderManager<TcpTransport>>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match read_half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            anyhow::bail!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }
        let mut body = vec![0u8; len as usize];
        read_half.read_exact(&mut body).await?;
        com.receive(&body).await?;
    }
}

impl Transport for TcpTransport {
    async fn send_to(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()> {
        let writers = self.writers.lock().await;
        let tx = writers.get(peer).with_context(|| format!("no open connection to {peer}"))?;
        tx.send(bytes).map_err(|_| anyhow::anyhow!("connection to {peer} closed"))?;
        Ok(())
    }
}
