//! Merkle clock: a hash DAG of events used to order cross-peer reports
//! without synchronized wall clocks.
//!
//! Each event commits to its parents' hashes, the peer that produced it and
//! a label. Event `a` happened before `b` iff `a` is an ancestor of `b`.
//! Events whose ancestry is not known locally compare as concurrent.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use cogwheel_core::PeerId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MeshError;

/// Events retained per unit of shared history.
const RETENTION_FACTOR: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockHash(pub [u8; 32]);

impl ClockHash {
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ClockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ClockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClockHash({})", self.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEvent {
    pub hash: ClockHash,
    /// Sorted.
    pub parents: Vec<ClockHash>,
    pub peer: PeerId,
    pub label: String,
    /// 1 + max parent height.
    pub height: u64,
}

impl ClockEvent {
    fn digest(parents: &[ClockHash], peer: &PeerId, label: &str, height: u64) -> ClockHash {
        let mut hasher = Sha256::new();
        hasher.update(height.to_be_bytes());
        hasher.update((parents.len() as u64).to_be_bytes());
        for p in parents {
            hasher.update(p.0);
        }
        for field in [peer.as_str(), label] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        ClockHash(hasher.finalize().into())
    }

    pub fn verify(&self) -> bool {
        Self::digest(&self.parents, &self.peer, &self.label, self.height) == self.hash
    }
}

/// A clock head plus the recent events needed to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    pub head: ClockHash,
    pub events: Vec<ClockEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

pub struct MerkleClock {
    peer: PeerId,
    events: HashMap<ClockHash, ClockEvent>,
    heads: BTreeSet<ClockHash>,
    /// Insertion order, for pruning and snapshots.
    order: VecDeque<ClockHash>,
    history: usize,
}

impl MerkleClock {
    /// `history` is how many recent events each snapshot carries.
    pub fn new(peer: PeerId, history: usize) -> Self {
        Self {
            peer,
            events: HashMap::new(),
            heads: BTreeSet::new(),
            order: VecDeque::new(),
            history: history.max(1),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn heads(&self) -> impl Iterator<Item = &ClockHash> {
        self.heads.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, hash: &ClockHash) -> Option<&ClockEvent> {
        self.events.get(hash)
    }

    /// Record a local event on top of every current head.
    pub fn tick(&mut self, label: impl Into<String>) -> ClockHash {
        let parents: Vec<ClockHash> = self.heads.iter().copied().collect();
        let height = parents
            .iter()
            .filter_map(|p| self.events.get(p))
            .map(|e| e.height)
            .max()
            .map_or(0, |h| h + 1);
        let label = label.into();
        let hash = ClockEvent::digest(&parents, &self.peer, &label, height);
        self.insert(ClockEvent {
            hash,
            parents,
            peer: self.peer.clone(),
            label,
            height,
        });
        self.heads.clear();
        self.heads.insert(hash);
        hash
    }

    /// Tick and package the result for an outgoing message.
    pub fn stamp(&mut self, label: impl Into<String>) -> ClockSnapshot {
        let head = self.tick(label);
        let events = self
            .order
            .iter()
            .rev()
            .take(self.history)
            .filter_map(|h| self.events.get(h).cloned())
            .collect();
        ClockSnapshot { head, events }
    }

    /// Fold a peer's snapshot into this clock.
    ///
    /// Every carried event is verified before anything is inserted.
    pub fn merge(&mut self, snapshot: &ClockSnapshot) -> Result<(), MeshError> {
        if let Some(bad) = snapshot.events.iter().find(|e| !e.verify()) {
            return Err(MeshError::InvalidClock(bad.hash.short()));
        }
        for event in &snapshot.events {
            if !self.events.contains_key(&event.hash) {
                self.insert(event.clone());
            }
        }

        let mut candidates = self.heads.clone();
        candidates.insert(snapshot.head);
        let heads: BTreeSet<ClockHash> = candidates
            .iter()
            .filter(|h| {
                !candidates
                    .iter()
                    .any(|other| other != *h && self.is_ancestor(h, other))
            })
            .copied()
            .collect();
        self.heads = heads;
        Ok(())
    }

    /// Causal relation of `a` to `b`.
    pub fn compare(&self, a: &ClockHash, b: &ClockHash) -> CausalOrder {
        if a == b {
            CausalOrder::Equal
        } else if self.is_ancestor(a, b) {
            CausalOrder::Before
        } else if self.is_ancestor(b, a) {
            CausalOrder::After
        } else {
            CausalOrder::Concurrent
        }
    }

    /// Whether `a` is a strict ancestor of `b` among known events.
    fn is_ancestor(&self, a: &ClockHash, b: &ClockHash) -> bool {
        let floor = match self.events.get(a) {
            Some(e) => e.height,
            None => return false,
        };
        let mut stack = vec![*b];
        let mut seen = BTreeSet::new();
        while let Some(h) = stack.pop() {
            let Some(event) = self.events.get(&h) else {
                continue;
            };
            for p in &event.parents {
                if p == a {
                    return true;
                }
                let deeper = self.events.get(p).is_some_and(|e| e.height > floor);
                if deeper && seen.insert(*p) {
                    stack.push(*p);
                }
            }
        }
        false
    }

    fn insert(&mut self, event: ClockEvent) {
        self.order.push_back(event.hash);
        self.events.insert(event.hash, event);
        let cap = self.history * RETENTION_FACTOR;
        while self.order.len() > cap {
            if let Some(old) = self.order.pop_front() {
                if !self.heads.contains(&old) {
                    self.events.remove(&old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(name: &str) -> MerkleClock {
        MerkleClock::new(PeerId::from(name), 16)
    }

    #[test]
    fn local_ticks_are_ordered() {
        let mut c = clock("a");
        let first = c.tick("one");
        let second = c.tick("two");
        assert_eq!(c.compare(&first, &second), CausalOrder::Before);
        assert_eq!(c.compare(&second, &first), CausalOrder::After);
        assert_eq!(c.compare(&first, &first), CausalOrder::Equal);
        assert_eq!(c.get(&second).unwrap().height, 1);
    }

    #[test]
    fn independent_peers_are_concurrent_until_merged() {
        let (mut a, mut b) = (clock("a"), clock("b"));
        let a1 = a.stamp("a1");
        let b1 = b.stamp("b1");

        a.merge(&b1).unwrap();
        assert_eq!(a.compare(&a1.head, &b1.head), CausalOrder::Concurrent);
        assert_eq!(a.heads().count(), 2);

        // The next local event sees both.
        let joined = a.tick("join");
        assert_eq!(a.compare(&a1.head, &joined), CausalOrder::Before);
        assert_eq!(a.compare(&b1.head, &joined), CausalOrder::Before);
        assert_eq!(a.heads().count(), 1);
    }

    #[test]
    fn happened_before_across_peers() {
        let (mut a, mut b) = (clock("a"), clock("b"));
        let reassign = a.stamp("reassign");
        b.merge(&reassign).unwrap();
        let report = b.stamp("result");

        a.merge(&report).unwrap();
        assert_eq!(a.compare(&reassign.head, &report.head), CausalOrder::Before);
        assert_eq!(a.compare(&report.head, &reassign.head), CausalOrder::After);
    }

    #[test]
    fn unseen_report_is_concurrent() {
        let (mut a, mut b) = (clock("a"), clock("b"));
        let stale = b.stamp("result");
        let reassign = a.stamp("reassign");
        a.merge(&stale).unwrap();
        assert_eq!(a.compare(&stale.head, &reassign.head), CausalOrder::Concurrent);
    }

    #[test]
    fn unknown_ancestry_is_concurrent() {
        let a = clock("a");
        let x = ClockHash([1; 32]);
        let y = ClockHash([2; 32]);
        assert_eq!(a.compare(&x, &y), CausalOrder::Concurrent);
    }

    #[test]
    fn hashes_print_as_lowercase_hex() {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let hash = ClockHash(bytes);
        assert_eq!(hash.short(), "deadbeef");
        assert_eq!(hash.to_string(), format!("deadbeef{}", "00".repeat(28)));
        assert_eq!(format!("{hash:?}"), "ClockHash(deadbeef)");
    }

    #[test]
    fn tampered_event_is_rejected() {
        let mut b = clock("b");
        let mut snap = b.stamp("result");
        snap.events[0].label = "forged".into();

        let mut a = clock("a");
        let before = a.len();
        assert!(matches!(a.merge(&snap), Err(MeshError::InvalidClock(_))));
        assert_eq!(a.len(), before);
    }

    #[test]
    fn snapshots_are_bounded() {
        let mut a = MerkleClock::new(PeerId::from("a"), 4);
        for i in 0..10 {
            a.tick(format!("e{i}"));
        }
        let snap = a.stamp("last");
        assert_eq!(snap.events.len(), 4);
        assert_eq!(snap.events[0].hash, snap.head);
    }

    #[test]
    fn merge_is_idempotent() {
        let (mut a, mut b) = (clock("a"), clock("b"));
        let snap = b.stamp("x");
        a.merge(&snap).unwrap();
        let size = a.len();
        a.merge(&snap).unwrap();
        assert_eq!(a.len(), size);
        assert_eq!(a.heads().count(), 1);
    }
}
