//! Peer roster: tracks known peers, binds each to a transport sink, and propagates membership
//! changes into the [`CausalOrderManager`].
//!
//! The roster is the only place the connection map is mutated (the event-loop task), matching
//! spec §5's single-writer policy. `Transport::send_to` is the seam the ambient TCP adapter
//! (§4.F) plugs into; anything satisfying it — including the in-memory channel transport used in
//! tests — works with the rest of the core unchanged.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

use crate::causal::CausalOrderManager;
use crate::entry::PeerId;

/// Sends already-encoded envelope bytes to a peer. Implementors own whatever connection-lifecycle
/// bookkeeping (dialing, reconnecting, framing) their transport needs; the core never assumes
/// delivery succeeded.
pub trait Transport: Send + Sync + 'static {
    fn send_to(&self, peer: &PeerId, bytes: Vec<u8>) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Notified once per newly-established connection, regardless of which transport path (accept
/// loop, discovery dial, or statically configured peer) established it.
pub trait ConnectHook: Send + Sync + 'static {
    fn on_connect(&self, peer: PeerId);
}

/// Tracks which peers are known and relays connection lifecycle events into the COM.
///
/// `handles` holds whatever address/handle information a concrete transport needs to route a
/// send (e.g. a socket address); it is deliberately opaque to the roster itself.
pub struct PeerRoster<T: Transport> {
    com: Arc<CausalOrderManager<T>>,
    handles: Mutex<HashMap<PeerId, PeerHandle>>,
    connect_hook: OnceLock<Arc<dyn ConnectHook>>,
}

#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub address: String,
}

impl<T: Transport> PeerRoster<T> {
    pub fn new(com: Arc<CausalOrderManager<T>>) -> Self {
        Self { com, handles: Mutex::new(HashMap::new()), connect_hook: OnceLock::new() }
    }

    /// Registers the callback run at the end of every genuinely new `on_connect`. Set once at
    /// bootstrap; later calls are ignored.
    pub fn set_connect_hook(&self, hook: Arc<dyn ConnectHook>) {
        let _ = self.connect_hook.set(hook);
    }

    /// Connection established. Idempotent: a peer already known is left untouched.
    pub async fn on_connect(&self, peer: PeerId, address: String) {
        let mut handles = self.handles.lock().await;
        if handles.contains_key(&peer) {
            return;
        }
        handles.insert(peer.clone(), PeerHandle { address });
        drop(handles);
        debug!(peer = %peer, "roster: peer connected");
        self.com.add_peer(peer.clone()).await;
        if let Some(hook) = self.connect_hook.get() {
            hook.on_connect(peer);
        }
    }

    /// Connection lost (transport reported disconnect, or we're dropping a peer explicitly).
    pub async fn on_disconnect(&self, peer: &PeerId) {
        let mut handles = self.handles.lock().await;
        handles.remove(peer);
        drop(handles);
        debug!(peer = %peer, "roster: peer disconnected");
        self.com.del_peer(peer).await;
    }

    pub async fn is_known(&self, peer: &PeerId) -> bool {
        self.handles.lock().await.contains_key(peer)
    }

    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.handles.lock().await.keys().cloned().collect()
    }

    pub fn com(&self) -> &Arc<CausalOrderManager<T>> {
        &self.com
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::Deliverer;

    struct NoopDeliverer;
    impl Deliverer for NoopDeliverer {
        fn deliver(&self, _payload: Vec<u8>) {}
    }

    struct NoopTransport;
    impl Transport for NoopTransport {
        async fn send_to(&self, _peer: &PeerId, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_connects_are_idempotent() {
        let com = CausalOrderManager::new("a".into(), Arc::new(NoopDeliverer), Arc::new(NoopTransport));
        let roster = PeerRoster::new(com.clone());

        roster.on_connect("b".into(), "127.0.0.1:9000".into()).await;
        let log_len = com.log_len().await;
        roster.on_connect("b".into(), "127.0.0.1:9000".into()).await;

        assert_eq!(com.log_len().await, log_len);
        assert_eq!(roster.known_peers().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_forgets_the_peer() {
        let com = CausalOrderManager::new("a".into(), Arc::new(NoopDeliverer), Arc::new(NoopTransport));
        let roster = PeerRoster::new(com.clone());

        roster.on_connect("b".into(), "127.0.0.1:9000".into()).await;
        assert!(roster.is_known(&"b".to_string()).await);

        roster.on_disconnect(&"b".to_string()).await;
        assert!(!roster.is_known(&"b".to_string()).await);
    }
}
