//! Peer trust scoring. Every chunk digest mismatch from a peer lowers its
//! score; a clean chunk transfer recovers it slowly. This is the decision
//! for the spec's open question on trust decay/recovery: a multiplicative
//! penalty on mismatch (fast to react to a misbehaving or corrupt peer)
//! and a small additive recovery per successful transfer (slow enough that
//! a peer can't "wash" a bad reputation with one good transfer), floored
//! and capped to `[0.0, 1.0]`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use nimbus_core::ids::NodeId;

/// Multiplicative penalty applied to a peer's score on each digest
/// mismatch: three consecutive mismatches roughly halve trust.
const MISMATCH_PENALTY: f64 = 0.8;
/// Additive recovery per successful chunk transfer; this implies roughly
/// 50 clean transfers to fully recover from one mismatch-heavy incident.
const SUCCESS_RECOVERY: f64 = 0.02;
/// Below this score, the fabric stops selecting a peer as a chunk source
/// even if it's the only known holder, surfacing `ChunkNotFound` instead
/// of risking another corrupt transfer.
pub const MIN_TRUSTED_SCORE: f64 = 0.2;

fn to_bits(score: f64) -> u64 {
    score.to_bits()
}

fn from_bits(bits: u64) -> f64 {
    f64::from_bits(bits)
}

struct ScoreCell(AtomicU64);

impl ScoreCell {
    fn new(initial: f64) -> Self {
        Self(AtomicU64::new(to_bits(initial)))
    }

    fn get(&self) -> f64 {
        from_bits(self.0.load(Ordering::Relaxed))
    }

    fn update(&self, f: impl Fn(f64) -> f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let new_score = f(from_bits(current)).clamp(0.0, 1.0);
            match self.0.compare_exchange_weak(current, to_bits(new_score), Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return new_score,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Tracks every peer's trust score, starting new peers at full trust.
pub struct TrustTable {
    scores: DashMap<NodeId, ScoreCell>,
}

impl TrustTable {
    pub fn new() -> Self {
        Self { scores: DashMap::new() }
    }

    pub fn score(&self, peer: &NodeId) -> f64 {
        self.scores.entry(peer.clone()).or_insert_with(|| ScoreCell::new(1.0)).get()
    }

    pub fn record_mismatch(&self, peer: &NodeId) -> f64 {
        self.scores
            .entry(peer.clone())
            .or_insert_with(|| ScoreCell::new(1.0))
            .update(|s| s * MISMATCH_PENALTY)
    }

    pub fn record_success(&self, peer: &NodeId) -> f64 {
        self.scores
            .entry(peer.clone())
            .or_insert_with(|| ScoreCell::new(1.0))
            .update(|s| s + SUCCESS_RECOVERY)
    }

    pub fn is_trusted(&self, peer: &NodeId) -> bool {
        self.score(peer) >= MIN_TRUSTED_SCORE
    }
}

impl Default for TrustTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peer_starts_fully_trusted() {
        let table = TrustTable::new();
        assert_eq!(table.score(&NodeId::new("a")), 1.0);
    }

    #[test]
    fn repeated_mismatches_eventually_untrust_a_peer() {
        let table = TrustTable::new();
        let peer = NodeId::new("bad-peer");
        for _ in 0..20 {
            table.record_mismatch(&peer);
        }
        assert!(!table.is_trusted(&peer));
    }

    #[test]
    fn success_recovers_score_without_overshooting_one() {
        let table = TrustTable::new();
        let peer = NodeId::new("a");
        table.record_mismatch(&peer);
        let before = table.score(&peer);
        table.record_success(&peer);
        assert!(table.score(&peer) > before);
        for _ in 0..1000 {
            table.record_success(&peer);
        }
        assert_eq!(table.score(&peer), 1.0);
    }
}
