// PROOF-OF-COMPUTATION ADMISSION GATE
// Periodic hash puzzles and a decaying per-node eligibility score.
//
// SAFETY INVARIANTS:
// 1. A score never exceeds `max_score` and decays toward zero without new solutions
// 2. A (node, challenge) pair is rewarded at most once
// 3. Decay is applied lazily on access from (score, last update) pairs, so
//    out-of-order verifications accumulate instead of overwriting each other
// 4. Solutions are bound to the solver's node id and cannot be replayed by others

use crate::clock::Clock;
use crate::config::ComputationParams;
use crate::crypto::sha256;
use crate::types::{Digest, NodeId};
use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One round's puzzle. Every node derives the same challenge for the same
/// round and network size, so a solution verifies on any replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationChallenge {
    /// `poc:<round>:<difficulty>`
    pub id: String,
    pub seed: Digest,

    /// Required leading zero bits
    pub difficulty: u32,

    /// Milliseconds since the Unix epoch
    pub issued_at: u64,
    pub expires_at: u64,
}

impl ComputationChallenge {
    fn derive(round: u64, difficulty: u32, interval_ms: u64, ttl_ms: u64) -> Self {
        let mut material = b"aegis-poc:".to_vec();
        material.extend_from_slice(&round.to_le_bytes());
        material.extend_from_slice(&difficulty.to_le_bytes());
        let issued_at = round.saturating_mul(interval_ms);
        ComputationChallenge {
            id: format!("poc:{}:{}", round, difficulty),
            seed: sha256(&material),
            difficulty,
            issued_at,
            expires_at: issued_at.saturating_add(ttl_ms),
        }
    }

    fn parse_id(id: &str) -> Option<(u64, u32)> {
        let mut parts = id.split(':');
        if parts.next()? != "poc" {
            return None;
        }
        let round = parts.next()?.parse().ok()?;
        let difficulty = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((round, difficulty))
    }

    /// Hash a candidate nonce for `node_id`.
    pub fn work_hash(&self, node_id: &str, nonce: u64) -> Digest {
        let mut material = Vec::with_capacity(32 + node_id.len() + 8);
        material.extend_from_slice(self.seed.as_bytes());
        material.extend_from_slice(node_id.as_bytes());
        material.extend_from_slice(&nonce.to_le_bytes());
        sha256(&material)
    }

    pub fn is_solved_by(&self, node_id: &str, nonce: u64) -> bool {
        leading_zero_bits(&self.work_hash(node_id, nonce)) >= self.difficulty
    }
}

fn leading_zero_bits(digest: &Digest) -> u32 {
    let mut bits = 0;
    for byte in digest.as_bytes() {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Brute-force a nonce for `challenge` on behalf of `node_id`.
pub fn solve_challenge(challenge: &ComputationChallenge, node_id: &str) -> u64 {
    let mut nonce = 0u64;
    while !challenge.is_solved_by(node_id, nonce) {
        nonce = nonce.wrapping_add(1);
    }
    nonce
}

/// Score ledger row. `score` is the value at `updated_at`, before decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub node_id: NodeId,
    pub score: f64,
    pub updated_at: u64,
}

/// Anti-Sybil gate: issues challenges and owns the score ledger.
pub struct ComputationGate {
    params: ComputationParams,
    poc_interval_ms: u64,
    min_score: f64,
    clock: Arc<dyn Clock>,
    network_size: usize,
    scores: DashMap<NodeId, ScoreEntry>,
    rewarded: DashSet<(String, NodeId)>,
}

impl ComputationGate {
    pub fn new(
        params: ComputationParams,
        poc_interval_secs: f64,
        min_score: f64,
        network_size: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ComputationGate {
            params,
            poc_interval_ms: ((poc_interval_secs * 1000.0).round() as u64).max(1),
            min_score,
            clock,
            network_size: network_size.max(1),
            scores: DashMap::new(),
            rewarded: DashSet::new(),
        }
    }

    /// base + floor(log2 n), capped at `max_difficulty`.
    pub fn current_difficulty(&self) -> u32 {
        let n = self.network_size;
        let scaled = self.params.base_difficulty + (usize::BITS - 1 - n.leading_zeros());
        scaled.min(self.params.max_difficulty)
    }

    fn ttl_ms(&self) -> u64 {
        (self.params.challenge_ttl * 1000.0).round() as u64
    }

    /// The challenge of the current round.
    pub fn issue_challenge(&self) -> ComputationChallenge {
        let round = self.clock.now_millis() / self.poc_interval_ms;
        let challenge = ComputationChallenge::derive(
            round,
            self.current_difficulty(),
            self.poc_interval_ms,
            self.ttl_ms(),
        );
        debug!(
            "Issued computation challenge {} (difficulty {})",
            challenge.id, challenge.difficulty
        );
        challenge
    }

    /// Check `solution` against the challenge and reward the node once.
    ///
    /// Unknown ids, expired or under-difficulty challenges, bad work and
    /// repeated submissions all return false and leave the ledger unchanged.
    pub fn verify_solution(&self, node_id: &str, challenge_id: &str, solution: u64) -> bool {
        let Some((round, difficulty)) = ComputationChallenge::parse_id(challenge_id) else {
            warn!("Rejected solution from {}: unknown challenge {}", node_id, challenge_id);
            return false;
        };
        if difficulty < self.current_difficulty() {
            warn!(
                "Rejected solution from {}: challenge {} is below current difficulty {}",
                node_id,
                challenge_id,
                self.current_difficulty()
            );
            return false;
        }

        let challenge =
            ComputationChallenge::derive(round, difficulty, self.poc_interval_ms, self.ttl_ms());
        let now = self.clock.now_millis();
        if now < challenge.issued_at || now > challenge.expires_at {
            debug!("Rejected solution from {}: challenge {} not live", node_id, challenge_id);
            return false;
        }
        if !challenge.is_solved_by(node_id, solution) {
            warn!("Rejected solution from {}: insufficient work for {}", node_id, challenge_id);
            return false;
        }
        if !self
            .rewarded
            .insert((challenge_id.to_string(), node_id.to_string()))
        {
            debug!("Ignored repeated solution from {} for {}", node_id, challenge_id);
            return false;
        }

        let score = self.credit(node_id, self.params.solution_reward, now);
        info!(
            "Verified computation from {} for {}: score now {:.3}",
            node_id, challenge_id, score
        );
        true
    }

    fn decayed(&self, entry: &ScoreEntry, now: u64) -> f64 {
        let elapsed = now.saturating_sub(entry.updated_at) as f64;
        let intervals = elapsed / self.poc_interval_ms as f64;
        entry.score * (1.0 - self.params.decay_per_interval).powf(intervals)
    }

    fn credit(&self, node_id: &str, amount: f64, now: u64) -> f64 {
        let mut entry = self
            .scores
            .entry(node_id.to_string())
            .or_insert_with(|| ScoreEntry {
                node_id: node_id.to_string(),
                score: 0.0,
                updated_at: now,
            });
        // Decay is never re-applied backwards when a stale timestamp races in.
        let at = now.max(entry.updated_at);
        let current = self.decayed(&entry, at);
        entry.score = (current + amount).min(self.params.max_score);
        entry.updated_at = at;
        entry.score
    }

    /// Current score with decay applied.
    pub fn score_of(&self, node_id: &str) -> f64 {
        let now = self.clock.now_millis();
        self.scores
            .get(node_id)
            .map(|entry| self.decayed(&entry, now))
            .unwrap_or(0.0)
    }

    pub fn is_eligible_leader(&self, node_id: &str) -> bool {
        self.score_of(node_id) >= self.min_score
    }

    pub fn min_score(&self) -> f64 {
        self.min_score
    }

    /// Set a node's score directly, e.g. from genesis configuration.
    pub fn seed_score(&self, node_id: &str, score: f64) {
        let now = self.clock.now_millis();
        self.scores.insert(
            node_id.to_string(),
            ScoreEntry {
                node_id: node_id.to_string(),
                score: score.clamp(0.0, self.params.max_score),
                updated_at: now,
            },
        );
    }

    /// Decayed scores of every node seen so far.
    pub fn scores_snapshot(&self) -> BTreeMap<NodeId, f64> {
        let now = self.clock.now_millis();
        self.scores
            .iter()
            .map(|entry| (entry.key().clone(), self.decayed(entry.value(), now)))
            .collect()
    }

    /// Forget reward records for expired challenges.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl = self.ttl_ms();
        let interval = self.poc_interval_ms;
        let before = self.rewarded.len();
        self.rewarded.retain(|(challenge_id, _)| {
            ComputationChallenge::parse_id(challenge_id)
                .map(|(round, _)| round.saturating_mul(interval).saturating_add(ttl) >= now)
                .unwrap_or(false)
        });
        before - self.rewarded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn params() -> ComputationParams {
        ComputationParams {
            base_difficulty: 4,
            max_difficulty: 6,
            ..ComputationParams::default()
        }
    }

    fn gate(clock: Arc<ManualClock>) -> ComputationGate {
        ComputationGate::new(params(), 30.0, 1.0, 4, clock)
    }

    #[test]
    fn test_difficulty_scales_with_network_size() {
        let difficulty = |n| {
            ComputationGate::new(params(), 30.0, 1.0, n, Arc::new(ManualClock::new(0)))
                .current_difficulty()
        };
        assert_eq!(difficulty(4), 6);
        assert_eq!(difficulty(1), 4);
        assert_eq!(difficulty(0), 4);
        assert_eq!(difficulty(3), 5);
        assert_eq!(difficulty(1024), 6);
    }

    #[test]
    fn test_leading_zero_bits() {
        let mut bytes = [0xffu8; 32];
        assert_eq!(leading_zero_bits(&Digest(bytes)), 0);
        bytes[0] = 0;
        bytes[1] = 0x10;
        assert_eq!(leading_zero_bits(&Digest(bytes)), 11);
        assert_eq!(leading_zero_bits(&Digest::ZERO), 256);
    }

    #[test]
    fn test_solution_is_bound_to_node() {
        let clock = Arc::new(ManualClock::new(90_000));
        let g = gate(clock);
        let challenge = g.issue_challenge();
        let nonce = solve_challenge(&challenge, "node-a");
        assert!(challenge.is_solved_by("node-a", nonce));
        assert!(g.verify_solution("node-a", &challenge.id, nonce));
        assert!(g.score_of("node-a") > 0.0);
    }

    #[test]
    fn test_repeat_and_expired_solutions_are_rejected() {
        let clock = Arc::new(ManualClock::new(90_000));
        let g = gate(clock.clone());
        let challenge = g.issue_challenge();
        let nonce = solve_challenge(&challenge, "node-a");
        assert!(g.verify_solution("node-a", &challenge.id, nonce));
        assert!(!g.verify_solution("node-a", &challenge.id, nonce));

        let stale = g.issue_challenge();
        clock.advance_secs(120.0);
        let nonce = solve_challenge(&stale, "node-b");
        assert!(!g.verify_solution("node-b", &stale.id, nonce));
        assert_eq!(g.score_of("node-b"), 0.0);
    }

    #[test]
    fn test_score_decays_per_interval() {
        let clock = Arc::new(ManualClock::new(0));
        let g = gate(clock.clone());
        g.seed_score("node-a", 2.0);
        clock.advance_secs(30.0);
        assert!((g.score_of("node-a") - 1.8).abs() < 1e-9);
        clock.advance_secs(60.0);
        assert!((g.score_of("node-a") - 2.0 * 0.9f64.powi(3)).abs() < 1e-9);
        assert!(g.is_eligible_leader("node-a"));
        clock.advance_secs(300.0);
        assert!(!g.is_eligible_leader("node-a"));
    }

    #[test]
    fn test_rewards_accumulate_up_to_cap() {
        let clock = Arc::new(ManualClock::new(0));
        let g = gate(clock.clone());
        g.seed_score("node-a", 9.5);
        let challenge = g.issue_challenge();
        let nonce = solve_challenge(&challenge, "node-a");
        assert!(g.verify_solution("node-a", &challenge.id, nonce));
        assert_eq!(g.score_of("node-a"), 10.0);
        assert_eq!(g.prune_expired(), 0);
        clock.advance_secs(61.0);
        assert_eq!(g.prune_expired(), 1);
    }

    #[test]
    fn test_malformed_challenge_id_is_rejected() {
        let g = gate(Arc::new(ManualClock::new(90_000)));
        assert!(!g.verify_solution("node-a", "bogus", 0));
        assert!(!g.verify_solution("node-a", "poc:3", 0));
        assert!(!g.verify_solution("node-a", "poc:3:6:1", 0));
        assert_eq!(g.score_of("node-a"), 0.0);
    }

    #[test]
    fn test_seeded_score_is_capped() {
        let g = gate(Arc::new(ManualClock::new(0)));
        g.seed_score("node-a", 50.0);
        assert_eq!(g.score_of("node-a"), 10.0);
        g.seed_score("node-b", -3.0);
        assert_eq!(g.score_of("node-b"), 0.0);
        assert!(g.is_eligible_leader("node-a"));
        assert!(!g.is_eligible_leader("node-b"));
    }
}
