//! Causal log entries.
//!
//! A [`CausalEntry`] records that some message `m`, originally sent by `origin` with sender
//! clock `seq`, still has destinations in `dests` for which causal delivery is not yet known to
//! be transitively satisfied. Entries are immutable in `origin`/`seq` but mutable in `dests`: the
//! KS send/receive rules narrow `dests` in place as dependency information becomes redundant.
//!
//! Identity is `(origin, seq)` only — two entries with the same origin/seq but different `dests`
//! are the same log slot, mid-mutation. `LOG_j` therefore stores entries in a `HashMap` keyed by
//! `(PeerId, u64)` rather than a `HashSet` of entries, so a `dests` rewrite is a plain lookup
//! instead of a remove/reinsert dance.

use std::collections::HashSet;

pub type PeerId = String;

/// A single record in `LOG_j` or in an envelope's piggy-backed `O_M`.
#[derive(Debug, Clone)]
pub struct CausalEntry {
    pub origin: PeerId,
    pub seq: u64,
    pub dests: HashSet<PeerId>,
}

/// Identity is `(origin, seq)`, not `dests` — mirrors the teacher's `Event::PartialEq`, which
/// also compares only the identity fields of an otherwise-mutable record.
impl PartialEq for CausalEntry {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.seq == other.seq
    }
}

impl Eq for CausalEntry {}

impl std::hash::Hash for CausalEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
        self.seq.hash(state);
    }
}

impl CausalEntry {
    pub fn new(origin: PeerId, seq: u64, dests: HashSet<PeerId>) -> Self {
        Self { origin, seq, dests }
    }

    pub fn key(&self) -> (PeerId, u64) {
        (self.origin.clone(), self.seq)
    }

    pub fn dests_is_empty(&self) -> bool {
        self.dests.is_empty()
    }

    /// Returns `self.dests \ other`, without mutating `self`.
    pub fn dests_minus(&self, other: &HashSet<PeerId>) -> HashSet<PeerId> {
        self.dests.difference(other).cloned().collect()
    }

    /// Returns `self.dests ∪ {peer}`, without mutating `self`.
    pub fn dests_union_with(&self, peer: &PeerId) -> HashSet<PeerId> {
        let mut dests = self.dests.clone();
        dests.insert(peer.clone());
        dests
    }

    pub fn set_dests(&mut self, dests: HashSet<PeerId>) {
        self.dests = dests;
    }

    pub fn retain_dests(&mut self, keep: impl Fn(&PeerId) -> bool) {
        self.dests.retain(|p| keep(p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<PeerId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identity_ignores_dests() {
        let a = CausalEntry::new("a".into(), 1, set(&["b", "c"]));
        let b = CausalEntry::new("a".into(), 1, set(&["d"]));
        assert_eq!(a.key(), b.key());
        assert_eq!(a, b, "equality is (origin, seq) only, dests differing notwithstanding");
    }

    #[test]
    fn differing_seq_is_not_equal() {
        let a = CausalEntry::new("a".into(), 1, set(&["b"]));
        let b = CausalEntry::new("a".into(), 2, set(&["b"]));
        assert_ne!(a, b);
    }

    #[test]
    fn dests_minus_does_not_mutate() {
        let e = CausalEntry::new("a".into(), 1, set(&["b", "c"]));
        let shrunk = e.dests_minus(&set(&["b"]));
        assert_eq!(shrunk, set(&["c"]));
        assert_eq!(e.dests, set(&["b", "c"]));
    }

    #[test]
    fn dests_union_with_does_not_mutate() {
        let e = CausalEntry::new("a".into(), 1, set(&["b"]));
        let grown = e.dests_union_with(&"c".to_string());
        assert_eq!(grown, set(&["b", "c"]));
        assert_eq!(e.dests, set(&["b"]));
    }
}
