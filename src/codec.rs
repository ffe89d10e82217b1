//! Wire envelope and its codec.
//!
//! The envelope is the 5-tuple `(k, t_k, payload, Dests, O_M)` of spec §4.A: sender, sender
//! clock at send time, opaque application payload, the message's full destination set, and the
//! piggy-backed causal dependency set. Encoding follows the same shape as the teacher's
//! `ProtocolMessage`: a `#[derive(Serialize, Deserialize)]` struct pushed through `bincode`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::entry::{CausalEntry, PeerId};
use crate::error::CausalError;

/// Wire form of a [`CausalEntry`] — plain data, no behavior, so it derives serde directly instead
/// of going through `CausalEntry`'s hand-written `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    pub origin: PeerId,
    pub seq: u64,
    pub dests: Vec<PeerId>,
}

impl From<&CausalEntry> for WireEntry {
    fn from(e: &CausalEntry) -> Self {
        Self {
            origin: e.origin.clone(),
            seq: e.seq,
            dests: e.dests.iter().cloned().collect(),
        }
    }
}

impl From<WireEntry> for CausalEntry {
    fn from(w: WireEntry) -> Self {
        CausalEntry::new(w.origin, w.seq, w.dests.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub k: PeerId,
    pub t_k: u64,
    pub payload: Vec<u8>,
    pub dests: Vec<PeerId>,
    pub o_m: Vec<WireEntry>,
}

impl Envelope {
    pub fn new(
        k: PeerId,
        t_k: u64,
        payload: Vec<u8>,
        dests: &HashSet<PeerId>,
        o_m: &[CausalEntry],
    ) -> Self {
        Self {
            k,
            t_k,
            payload,
            dests: dests.iter().cloned().collect(),
            o_m: o_m.iter().map(WireEntry::from).collect(),
        }
    }

    pub fn dests_set(&self) -> HashSet<PeerId> {
        self.dests.iter().cloned().collect()
    }

    pub fn o_m_entries(&self) -> Vec<CausalEntry> {
        self.o_m.iter().cloned().map(CausalEntry::from).collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CausalError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CausalError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<PeerId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_trip_with_empty_sets() {
        let env = Envelope::new("a".into(), 3, b"hi".to_vec(), &HashSet::new(), &[]);
        let bytes = env.encode().expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(decoded.k, "a");
        assert_eq!(decoded.t_k, 3);
        assert_eq!(decoded.payload, b"hi");
        assert!(decoded.dests.is_empty());
        assert!(decoded.o_m.is_empty());
    }

    #[test]
    fn round_trip_with_piggybacked_entries() {
        let dests = set(&["b", "c"]);
        let o_m = vec![CausalEntry::new("a".into(), 1, set(&["b"]))];
        let env = Envelope::new("a".into(), 2, b"hello".to_vec(), &dests, &o_m);

        let bytes = env.encode().expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");

        assert_eq!(decoded.dests_set(), dests);
        let decoded_entries = decoded.o_m_entries();
        assert_eq!(decoded_entries.len(), 1);
        assert_eq!(decoded_entries[0].origin, "a");
        assert_eq!(decoded_entries[0].seq, 1);
        assert_eq!(decoded_entries[0].dests, set(&["b"]));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let err = Envelope::decode(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, CausalError::MalformedEnvelope(_)));
    }
}
