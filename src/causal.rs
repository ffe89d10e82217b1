//! The Causal Order Manager (COM): the Kshemkalyani-Singhal optimal causal-ordering state
//! machine.
//!
//! State (`clock_j`, `SR_j`, `LOG_j`) lives behind one `tokio::sync::Mutex`, and a
//! `tokio::sync::Notify` stands in for the source's condition variable. `send` never awaits the
//! notify; `receive` awaits it in a spurious-wakeup-safe loop while its delivery condition is
//! unmet, then runs the rest of the KS receive rule without releasing the lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::codec::Envelope;
use crate::entry::{CausalEntry, PeerId};
use crate::error::CausalError;
use crate::roster::Transport;

/// Receives payloads once the COM has established they are safe to deliver in causal order.
///
/// The COM is header-agnostic: it hands `deliver` the same opaque bytes it was given to `send`.
pub trait Deliverer: Send + Sync {
    fn deliver(&self, payload: Vec<u8>);
}

struct ComState {
    clock: u64,
    sr: HashMap<PeerId, u64>,
    log: HashMap<(PeerId, u64), CausalEntry>,
    /// Peers explicitly dropped via `delPeer`. A dependency on one of these is vacuously
    /// satisfied (we will never hear from it again); a dependency on an origin that is simply
    /// absent from `sr` — never `addPeer`'d yet — is the opposite: per spec `SR_j[m] = 0` for an
    /// unknown origin, so it blocks like any other unmet dependency on a slow peer.
    removed_peers: HashSet<PeerId>,
}

impl ComState {
    fn new(j: &PeerId) -> Self {
        let mut sr = HashMap::new();
        sr.insert(j.clone(), 0);
        let mut log = HashMap::new();
        log.insert((j.clone(), 0), CausalEntry::new(j.clone(), 0, HashSet::new()));
        Self { clock: 0, sr, log, removed_peers: HashSet::new() }
    }

    /// purge-null: drop entries with empty `dests` that are shadowed by a strictly newer
    /// same-origin entry.
    fn purge_null(&mut self) {
        let stale: Vec<(PeerId, u64)> = self
            .log
            .values()
            .filter(|l| l.dests_is_empty())
            .filter(|l| newer_entry_exists(&l.origin, l.seq, self.log.values()))
            .map(|l| l.key())
            .collect();
        for key in stale {
            self.log.remove(&key);
        }
    }

    fn unmet_dependencies(&self, j: &PeerId, o_m: &[CausalEntry]) -> Vec<(PeerId, u64)> {
        o_m.iter()
            .filter(|o| o.dests.contains(j))
            .filter(|o| !self.removed_peers.contains(&o.origin))
            .filter(|o| o.seq > *self.sr.get(&o.origin).unwrap_or(&0))
            .map(|o| (o.origin.clone(), o.seq))
            .collect()
    }
}

fn newer_entry_exists<'a>(origin: &PeerId, seq: u64, mut entries: impl Iterator<Item = &'a CausalEntry>) -> bool {
    entries.any(|x| &x.origin == origin && x.seq > seq)
}

pub struct CausalOrderManager<T: Transport> {
    j: PeerId,
    state: Mutex<ComState>,
    notify: Notify,
    stopping: AtomicBool,
    deliverer: Arc<dyn Deliverer>,
    transport: Arc<T>,
}

impl<T: Transport> CausalOrderManager<T> {
    pub fn new(j: PeerId, deliverer: Arc<dyn Deliverer>, transport: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ComState::new(&j)),
            j,
            notify: Notify::new(),
            stopping: AtomicBool::new(false),
            deliverer,
            transport,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.j
    }

    /// Snapshot of `SR_j`, for tests and diagnostics.
    pub async fn received_upto(&self, peer: &PeerId) -> u64 {
        let state = self.state.lock().await;
        *state.sr.get(peer).unwrap_or(&0)
    }

    pub async fn log_len(&self) -> usize {
        self.state.lock().await.log.len()
    }

    /// Shuts the manager down: sets `stopping` and wakes every blocked `receive` so it returns
    /// without delivering.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// KS SEND rule (spec §4.C `send`).
    pub async fn send(&self, payload: Vec<u8>, dests: HashSet<PeerId>, delay: Duration) {
        let mut dests = dests;
        dests.remove(&self.j);
        if dests.is_empty() {
            debug!(peer = %self.j, "send called with empty destination set, no-op");
            return;
        }

        let (clock, envelopes) = {
            let mut state = self.state.lock().await;

            // (1a)
            state.clock += 1;
            let clock = state.clock;

            // (1b): one independently-pruned O_M per destination.
            let mut envelopes = Vec::with_capacity(dests.len());
            for d in &dests {
                let o_m = build_piggyback(&state.log, d, &dests);
                envelopes.push((d.clone(), Envelope::new(self.j.clone(), clock, payload.clone(), &dests, &o_m)));
            }

            // (1c) S-shrink-log: LOG_j entries lose the destinations covered by this send.
            for l in state.log.values_mut() {
                let shrunk = l.dests_minus(&dests);
                l.set_dests(shrunk);
            }
            state.purge_null();

            // (1d)
            let new_entry = CausalEntry::new(self.j.clone(), clock, dests.clone());
            state.log.insert(new_entry.key(), new_entry);

            (clock, envelopes)
        };
        self.notify.notify_waiters();

        for (d, envelope) in envelopes {
            let transport = self.transport.clone();
            let j = self.j.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match envelope.encode() {
                    Ok(bytes) => {
                        if let Err(e) = transport.send_to(&d, bytes).await {
                            warn!(peer = %j, to = %d, error = %e, "send failed, treating as fire-and-forget");
                        }
                    }
                    Err(e) => warn!(peer = %j, to = %d, error = %e, "failed to encode envelope"),
                }
            });
        }
        debug!(peer = %self.j, clock, dests = ?dests, "sent message");
    }

    /// Decodes and applies the KS RECEIVE rule (spec §4.C `receive`). Blocks (via `Notify`)
    /// until the delivery condition is satisfied, then delivers and merges.
    ///
    /// A malformed envelope is a policy-level reason to drop the connection (spec §4.A/§4.F): the
    /// caller is expected to treat `Err` as "tear down this connection", not retry or skip ahead.
    pub async fn receive(&self, bytes: &[u8]) -> Result<(), CausalError> {
        let envelope = Envelope::decode(bytes).map_err(|e| {
            warn!(peer = %self.j, error = %e, "malformed envelope, dropping connection");
            e
        })?;
        let k = envelope.k.clone();
        let t_k = envelope.t_k;
        let dests_m = envelope.dests_set();
        let mut o_m = envelope.o_m_entries();

        // (2a) Delivery condition: wait until every dependency this peer must see is satisfied.
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return Ok(());
            }
            let unmet = {
                let state = self.state.lock().await;
                state.unmet_dependencies(&self.j, &o_m)
            };
            if unmet.is_empty() {
                break;
            }
            debug!(peer = %self.j, from = %k, unmet = ?unmet, "blocking on causal dependency");
            self.notify.notified().await;
        }

        // Steps 2-8 run atomically under the lock.
        let mut state = self.state.lock().await;

        // (2b) Deliver, then record receipt.
        self.deliverer.deliver(envelope.payload.clone());
        state.sr.insert(k.clone(), t_k);

        // (2c) Incorporate this message's own entry, then strip ourselves (we've delivered).
        o_m.push(CausalEntry::new(k.clone(), t_k, dests_m));
        for o in o_m.iter_mut() {
            o.dests.remove(&self.j);
        }

        // (2d) Merge: drop O_M entries whose LOG_j counterpart was purged, and drop LOG_j
        // entries whose O_M counterpart never existed because it was purged at another process.
        let mut drop_from_o_m = Vec::new();
        let mut drop_from_log = Vec::new();
        let o_m_keys: HashSet<(PeerId, u64)> = o_m.iter().map(|o| o.key()).collect();
        for o in &o_m {
            for l in state.log.values() {
                if o.origin != l.origin {
                    continue;
                }
                if o.seq < l.seq && !state.log.contains_key(&(o.origin.clone(), o.seq)) {
                    drop_from_o_m.push(o.key());
                }
                if l.seq < o.seq && !o_m_keys.contains(&(l.origin.clone(), l.seq)) {
                    drop_from_log.push(l.key());
                }
            }
        }
        o_m.retain(|o| !drop_from_o_m.contains(&o.key()));
        for key in &drop_from_log {
            state.log.remove(key);
        }

        // (2e) Shrink: absorb O_M entries matching an existing LOG_j slot into that slot.
        let mut absorbed = Vec::new();
        for o in &o_m {
            if let Some(l) = state.log.get_mut(&o.key()) {
                let narrowed: HashSet<PeerId> = l.dests.intersection(&o.dests).cloned().collect();
                l.set_dests(narrowed);
                absorbed.push(o.key());
            }
        }
        o_m.retain(|o| !absorbed.contains(&o.key()));

        // (2f) Merge remaining O_M into LOG_j; existing entries win on collision.
        for o in o_m {
            state.log.entry(o.key()).or_insert(o);
        }

        // (2g) purge-null.
        state.purge_null();

        drop(state);
        self.notify.notify_waiters();
        debug!(peer = %self.j, from = %k, t_k, "delivered message");
        Ok(())
    }

    /// Idempotent: tracking a peer already tracked is a no-op.
    pub async fn add_peer(&self, peer: PeerId) {
        let mut state = self.state.lock().await;
        state.removed_peers.remove(&peer);
        if state.sr.contains_key(&peer) {
            return;
        }
        state.sr.insert(peer.clone(), 0);
        state.log.insert((peer.clone(), 0), CausalEntry::new(peer, 0, HashSet::new()));
        drop(state);
        self.notify.notify_waiters();
    }

    /// Stops tracking a peer. Per the resolved Open Question in DESIGN.md, this strips the
    /// departing peer from every entry's `dests` rather than discarding entries whose `dests`
    /// merely contain it, so dependency information still relevant to other peers survives.
    pub async fn del_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock().await;
        state.sr.remove(peer);
        state.removed_peers.insert(peer.clone());
        state.log.retain(|(origin, _), _| origin != peer);
        for l in state.log.values_mut() {
            l.dests.remove(peer);
        }
        state.purge_null();
        if state.log.is_empty() {
            state.log.insert(
                (self.j.clone(), 0),
                CausalEntry::new(self.j.clone(), 0, HashSet::new()),
            );
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Builds the independent, per-destination piggyback copy of `LOG_j` and applies S-prune-d /
/// S-drop-stale (spec §4.C `send` step 2).
fn build_piggyback(log: &HashMap<(PeerId, u64), CausalEntry>, d: &PeerId, dests: &HashSet<PeerId>) -> Vec<CausalEntry> {
    let mut o_m: Vec<CausalEntry> = log.values().cloned().collect();

    for o in o_m.iter_mut() {
        if !o.dests.contains(d) {
            o.set_dests(o.dests_minus(dests));
        } else {
            let mut shrunk = o.dests_minus(dests);
            shrunk.insert(d.clone());
            o.set_dests(shrunk);
        }
    }

    let stale: HashSet<(PeerId, u64)> = o_m
        .iter()
        .filter(|o| o.dests_is_empty())
        .filter(|o| newer_entry_exists(&o.origin, o.seq, o_m.iter()))
        .map(|o| o.key())
        .collect();
    o_m.retain(|o| !stale.contains(&o.key()));
    o_m
}
