// CHECKPOINTS
// Periodic agreement on executed state, used to truncate the slot log.
//
// SAFETY INVARIANTS:
// 1. The state digest is a hash chain over every executed decision in order
// 2. A checkpoint is stable only with quorum matching CHECKPOINT messages
// 3. The stable checkpoint never moves backwards
// 4. Each sender holds one vote per boundary inside the window and one vote
//    beyond it, so memory stays bounded under a flood

use crate::collaborators::Crypto;
use crate::message::{MessageBody, SignedMessage};
use crate::types::{Decision, Digest, NodeId};
use log::{debug, info};
use std::collections::BTreeMap;

pub struct CheckpointTracker {
    interval: u64,
    quorum: usize,
    window: u64,

    /// Running state digest after `chain_sequence`
    chain: Digest,
    chain_sequence: u64,

    /// Digests this node produced at checkpoint boundaries above the stable one
    own: BTreeMap<u64, Digest>,

    /// Boundary -> sender -> CHECKPOINT, for boundaries inside the window
    votes: BTreeMap<u64, BTreeMap<NodeId, SignedMessage>>,

    /// Each sender's highest CHECKPOINT beyond the window
    ahead: BTreeMap<NodeId, SignedMessage>,

    stable_sequence: u64,
    stable_digest: Digest,
    stable_proof: Vec<SignedMessage>,
}

impl CheckpointTracker {
    pub fn new(interval: u64, quorum: usize, window: u64) -> Self {
        CheckpointTracker {
            interval: interval.max(1),
            quorum,
            window,
            chain: Digest::ZERO,
            chain_sequence: 0,
            own: BTreeMap::new(),
            votes: BTreeMap::new(),
            ahead: BTreeMap::new(),
            stable_sequence: 0,
            stable_digest: Digest::ZERO,
            stable_proof: Vec::new(),
        }
    }

    pub fn stable_sequence(&self) -> u64 {
        self.stable_sequence
    }

    pub fn stable_digest(&self) -> Digest {
        self.stable_digest
    }

    /// The quorum of CHECKPOINTs behind the stable checkpoint.
    pub fn stable_proof(&self) -> &[SignedMessage] {
        &self.stable_proof
    }

    pub fn state_digest(&self) -> Digest {
        self.chain
    }

    pub fn high_watermark(&self) -> u64 {
        self.stable_sequence.saturating_add(self.window)
    }

    /// CHECKPOINT votes currently held.
    pub fn pending_votes(&self) -> usize {
        self.votes.values().map(BTreeMap::len).sum::<usize>() + self.ahead.len()
    }

    /// Fold an executed decision into the state digest. Returns the
    /// checkpoint to announce when `decision` lands on a boundary.
    pub fn record_execution(&mut self, decision: &Decision, crypto: &dyn Crypto) -> Option<(u64, Digest)> {
        if decision.sequence != self.chain_sequence + 1 {
            debug!(
                "Checkpoint chain at {} ignores decision {}",
                self.chain_sequence, decision.sequence
            );
            return None;
        }
        let mut material = Vec::with_capacity(72);
        material.extend_from_slice(self.chain.as_bytes());
        material.extend_from_slice(&decision.sequence.to_le_bytes());
        material.extend_from_slice(decision.digest.as_bytes());
        self.chain = crypto.digest(&material);
        self.chain_sequence = decision.sequence;

        if decision.sequence % self.interval != 0 || decision.sequence < self.stable_sequence {
            return None;
        }
        self.own.insert(decision.sequence, self.chain);
        if decision.sequence == self.stable_sequence {
            // Caught up to a checkpoint that already became stable elsewhere.
            return None;
        }
        Some((decision.sequence, self.chain))
    }

    /// Count a CHECKPOINT vote whose signature the caller verified. Returns
    /// the new stable sequence when this vote completes a quorum.
    pub fn on_checkpoint(&mut self, signed: &SignedMessage) -> Option<u64> {
        let message = &signed.message;
        let sequence = message.sequence;
        if !matches!(message.body, MessageBody::Checkpoint)
            || sequence <= self.stable_sequence
            || sequence % self.interval != 0
        {
            return None;
        }

        let held: Vec<&SignedMessage> = if sequence > self.high_watermark() {
            let newer = self
                .ahead
                .get(&message.sender)
                .map_or(true, |held| held.message.sequence < sequence);
            if !newer {
                return None;
            }
            self.ahead.insert(message.sender.clone(), signed.clone());
            self.ahead
                .values()
                .filter(|held| held.message.sequence == sequence)
                .collect()
        } else {
            let senders = self.votes.entry(sequence).or_default();
            if senders.contains_key(&message.sender) {
                return None;
            }
            senders.insert(message.sender.clone(), signed.clone());
            senders.values().collect()
        };

        let proof: Vec<SignedMessage> = held
            .into_iter()
            .filter(|held| held.message.digest == message.digest)
            .cloned()
            .collect();
        if proof.len() < self.quorum {
            return None;
        }
        self.make_stable(sequence, message.digest, proof);
        Some(sequence)
    }

    /// Take a stable checkpoint proven elsewhere, e.g. in a NEW_VIEW.
    pub fn adopt(&mut self, sequence: u64, proof: &[SignedMessage]) -> bool {
        let Some(first) = proof.first() else {
            return false;
        };
        if sequence <= self.stable_sequence {
            return false;
        }
        self.make_stable(sequence, first.message.digest, proof.to_vec());
        true
    }

    fn make_stable(&mut self, sequence: u64, digest: Digest, proof: Vec<SignedMessage>) {
        self.stable_sequence = sequence;
        self.stable_digest = digest;
        self.stable_proof = proof;
        self.votes = self.votes.split_off(&sequence.saturating_add(1));
        self.own = self.own.split_off(&sequence);
        self.ahead.retain(|_, held| held.message.sequence > sequence);

        // Votes that were ahead may now fall inside the window.
        let high = self.high_watermark();
        let inside: Vec<NodeId> = self
            .ahead
            .iter()
            .filter(|(_, held)| held.message.sequence <= high)
            .map(|(sender, _)| sender.clone())
            .collect();
        for sender in inside {
            if let Some(held) = self.ahead.remove(&sender) {
                self.votes
                    .entry(held.message.sequence)
                    .or_default()
                    .entry(sender)
                    .or_insert(held);
            }
        }
        info!(
            "Checkpoint {} is stable (state digest {})",
            sequence,
            digest.short()
        );
    }

    /// True if this node's own state at the stable checkpoint disagrees with it.
    pub fn diverges_from_stable(&self) -> bool {
        match self.own.get(&self.stable_sequence) {
            Some(own) => self.stable_sequence > 0 && *own != self.stable_digest,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyRing;
    use crate::message::ConsensusMessage;
    use crate::types::Proposal;

    const IDS: [&str; 5] = ["a", "b", "c", "d", "e"];

    fn decision(sequence: u64) -> Decision {
        Decision {
            sequence,
            view: 0,
            digest: Digest([sequence as u8; 32]),
            proposal: Proposal::noop(&"node-0".to_string(), 0, sequence),
            committed_at: 0,
        }
    }

    fn checkpoint(ring: &KeyRing, sender: &str, sequence: u64, digest: Digest) -> SignedMessage {
        let crypto = ring.crypto_for(sender).unwrap();
        let message = ConsensusMessage::new(
            0,
            sequence,
            digest,
            sender.to_string(),
            0,
            MessageBody::Checkpoint,
        );
        SignedMessage::seal(message, crypto.as_ref())
    }

    #[test]
    fn test_boundaries_produce_checkpoints() {
        let ring = KeyRing::deterministic(&["node-0"]);
        let crypto = ring.crypto_for("node-0").unwrap();
        let mut tracker = CheckpointTracker::new(2, 3, 100);

        assert_eq!(tracker.record_execution(&decision(1), crypto.as_ref()), None);
        let (sequence, digest) = tracker.record_execution(&decision(2), crypto.as_ref()).unwrap();
        assert_eq!(sequence, 2);
        assert_eq!(digest, tracker.state_digest());

        // Out-of-order decisions do not touch the chain.
        assert_eq!(tracker.record_execution(&decision(5), crypto.as_ref()), None);
        assert_eq!(tracker.state_digest(), digest);
    }

    #[test]
    fn test_state_digest_is_deterministic() {
        let ring = KeyRing::deterministic(&["a", "b"]);
        let a = ring.crypto_for("a").unwrap();
        let b = ring.crypto_for("b").unwrap();
        let mut left = CheckpointTracker::new(3, 3, 100);
        let mut right = CheckpointTracker::new(3, 3, 100);
        for sequence in 1..=3 {
            left.record_execution(&decision(sequence), a.as_ref());
            right.record_execution(&decision(sequence), b.as_ref());
        }
        assert_eq!(left.state_digest(), right.state_digest());
    }

    #[test]
    fn test_stable_at_quorum() {
        let ring = KeyRing::deterministic(&IDS);
        let mut tracker = CheckpointTracker::new(10, 3, 100);
        let digest = Digest([7u8; 32]);
        let other = Digest([8u8; 32]);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "a", 10, digest)), None);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "b", 10, other)), None);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "a", 10, digest)), None);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "c", 10, digest)), None);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "d", 10, digest)), Some(10));
        assert_eq!(tracker.stable_sequence(), 10);
        assert_eq!(tracker.stable_digest(), digest);

        let proof = tracker.stable_proof();
        assert_eq!(proof.len(), 3);
        assert!(proof.iter().all(|vote| vote.message.digest == digest));

        // Old or off-boundary checkpoints are ignored.
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "e", 10, digest)), None);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "e", 15, digest)), None);
    }

    #[test]
    fn test_flooding_sender_holds_bounded_votes() {
        let ring = KeyRing::deterministic(&IDS);
        let mut tracker = CheckpointTracker::new(4, 3, 32);
        let digest = Digest([9u8; 32]);

        let mut sequence = 4;
        while sequence <= 40_000 {
            assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "e", sequence, digest)), None);
            sequence += 4;
        }
        // Eight boundaries fit in the window, plus one vote beyond it.
        assert_eq!(tracker.pending_votes(), 9);
        assert_eq!(tracker.stable_sequence(), 0);

        for sender in ["a", "b", "c"] {
            tracker.on_checkpoint(&checkpoint(&ring, sender, 8, digest));
        }
        assert_eq!(tracker.stable_sequence(), 8);
        assert!(tracker.pending_votes() <= 7);
    }

    #[test]
    fn test_quorum_beyond_window_still_stabilizes() {
        let ring = KeyRing::deterministic(&IDS);
        let mut tracker = CheckpointTracker::new(4, 3, 8);
        let digest = Digest([5u8; 32]);

        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "a", 40, digest)), None);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "b", 40, digest)), None);
        assert_eq!(tracker.on_checkpoint(&checkpoint(&ring, "c", 40, digest)), Some(40));
        assert_eq!(tracker.high_watermark(), 48);
        assert_eq!(tracker.pending_votes(), 0);
    }

    #[test]
    fn test_adopt_moves_stable_forward_only() {
        let ring = KeyRing::deterministic(&IDS);
        let mut tracker = CheckpointTracker::new(4, 3, 32);
        let digest = Digest([6u8; 32]);
        let proof: Vec<SignedMessage> = ["a", "b", "c"]
            .iter()
            .map(|sender| checkpoint(&ring, sender, 12, digest))
            .collect();

        assert!(!tracker.adopt(12, &[]));
        assert!(tracker.adopt(12, &proof));
        assert_eq!(tracker.stable_sequence(), 12);
        assert_eq!(tracker.stable_digest(), digest);
        assert!(!tracker.adopt(8, &proof));
    }
}
