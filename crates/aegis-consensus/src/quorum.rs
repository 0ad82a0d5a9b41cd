// QUORUM CERTIFICATES
// Vote tallies for one (view, sequence) slot, per phase and digest.
//
// SAFETY INVARIANTS:
// 1. A sender counts at most once per phase
// 2. Once a digest reaches quorum in a phase, other digests are audit-only
// 3. Two digests backed by quorum-many distinct signers in one phase is fatal
//    and is never resolved by picking one
// 4. Audit evidence holds at most one extra digest per sender and phase

use crate::message::{Phase, VoteRecord};
use crate::types::{Digest, NodeId};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// Quorum arithmetic for a roster of `n` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumParams {
    pub n: usize,

    /// Tolerated faults, floor((n - 1) / 3)
    pub f: usize,

    /// Matching votes needed for a certificate
    pub quorum: usize,

    /// f + 1: at least one honest node among them
    pub weak_quorum: usize,
}

impl QuorumParams {
    /// 2f+1 when n = 3f+1. For other roster sizes the quorum is raised to
    /// ceil((n + f + 1) / 2) so that any two quorums share f+1 nodes.
    pub fn for_nodes(n: usize) -> Self {
        let f = n.saturating_sub(1) / 3;
        let intersecting = (n + f + 2) / 2;
        let quorum = (2 * f + 1).max(intersecting).min(n.max(1));
        QuorumParams {
            n,
            f,
            quorum,
            weak_quorum: f + 1,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuorumError {
    #[error("duplicate {phase} vote from {sender}")]
    DuplicateVote { sender: NodeId, phase: Phase },

    /// Same sender voted for two digests in one phase
    #[error("{sender} equivocated in {phase}")]
    Equivocation { sender: NodeId, phase: Phase },

    /// Vote for a digest other than the one that already has quorum; kept for audit
    #[error("{phase} vote from {sender} conflicts with quorum digest {quorum_digest}")]
    ConflictingDigest {
        sender: NodeId,
        phase: Phase,
        quorum_digest: Digest,
    },

    #[error("conflicting {phase} quorums for {first} and {second}")]
    ConflictingQuorum {
        phase: Phase,
        first: Digest,
        second: Digest,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded { count: usize },

    /// This vote completed the quorum for its digest
    QuorumReached { count: usize },
}

/// Vote that was not counted toward any certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub sender: NodeId,
    pub phase: Phase,
    pub digest: Digest,
    pub reason: QuorumError,
}

#[derive(Debug, Clone)]
pub struct QuorumCertificate {
    view: u64,
    sequence: u64,
    quorum_size: usize,
    ballots: HashMap<(NodeId, Phase), Digest>,
    tallies: BTreeMap<(Phase, Digest), Vec<VoteRecord>>,
    quorum_digest: HashMap<Phase, Digest>,

    /// Distinct signers per digest, counting audited votes
    signers: BTreeMap<(Phase, Digest), BTreeSet<NodeId>>,
    equivocated: HashSet<(NodeId, Phase)>,
    audit: Vec<AuditEntry>,
}

impl QuorumCertificate {
    pub fn new(view: u64, sequence: u64, quorum_size: usize) -> Self {
        QuorumCertificate {
            view,
            sequence,
            quorum_size,
            ballots: HashMap::new(),
            tallies: BTreeMap::new(),
            quorum_digest: HashMap::new(),
            signers: BTreeMap::new(),
            equivocated: HashSet::new(),
            audit: Vec::new(),
        }
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Record a vote whose signature the caller has already verified.
    pub fn add_vote(
        &mut self,
        phase: Phase,
        digest: Digest,
        vote: VoteRecord,
    ) -> Result<VoteOutcome, QuorumError> {
        let sender = &vote.sender;
        if let Some(previous) = self.ballots.get(&(sender.clone(), phase)) {
            if *previous == digest {
                return Err(QuorumError::DuplicateVote {
                    sender: sender.clone(),
                    phase,
                });
            }
            let reason = QuorumError::Equivocation {
                sender: sender.clone(),
                phase,
            };
            if !self.equivocated.insert((sender.clone(), phase)) {
                return Err(reason);
            }
            warn!(
                "{} in slot ({}, {}): {} vs {}",
                reason, self.view, self.sequence, previous, digest
            );
            self.audit(sender, phase, digest, reason.clone());
            let sender = sender.clone();
            self.check_conflict(&sender, phase, digest)?;
            return Err(reason);
        }

        if let Some(quorum_digest) = self.quorum_digest.get(&phase).copied() {
            if quorum_digest != digest {
                self.ballots.insert((sender.clone(), phase), digest);
                let reason = QuorumError::ConflictingDigest {
                    sender: sender.clone(),
                    phase,
                    quorum_digest,
                };
                debug!("Slot ({}, {}): {}", self.view, self.sequence, reason);
                self.audit(sender, phase, digest, reason.clone());
                let sender = sender.clone();
                self.check_conflict(&sender, phase, digest)?;
                return Err(reason);
            }
        }

        let sender = sender.clone();
        self.ballots.insert((sender.clone(), phase), digest);
        let votes = self.tallies.entry((phase, digest)).or_default();
        votes.push(vote);
        let count = votes.len();

        let reached = count >= self.quorum_size && !self.quorum_digest.contains_key(&phase);
        if reached {
            self.quorum_digest.insert(phase, digest);
        }
        self.check_conflict(&sender, phase, digest)?;
        if reached {
            return Ok(VoteOutcome::QuorumReached { count });
        }
        Ok(VoteOutcome::Recorded { count })
    }

    /// Count `sender` as a signer of `digest` and fail if a digest other
    /// than the quorum digest is now signed by a quorum of distinct nodes.
    fn check_conflict(&mut self, sender: &NodeId, phase: Phase, digest: Digest) -> Result<(), QuorumError> {
        self.signers
            .entry((phase, digest))
            .or_default()
            .insert(sender.clone());
        let Some(first) = self.quorum_digest.get(&phase).copied() else {
            return Ok(());
        };
        let second = self
            .signers
            .range((phase, Digest::ZERO)..)
            .take_while(|((p, _), _)| *p == phase)
            .find(|((_, d), signers)| *d != first && signers.len() >= self.quorum_size)
            .map(|((_, d), _)| *d);
        match second {
            Some(second) => {
                let err = QuorumError::ConflictingQuorum { phase, first, second };
                error!("Slot ({}, {}): {}", self.view, self.sequence, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn audit(&mut self, sender: &NodeId, phase: Phase, digest: Digest, reason: QuorumError) {
        self.audit.push(AuditEntry {
            sender: sender.clone(),
            phase,
            digest,
            reason,
        });
    }

    pub fn has_quorum(&self, phase: Phase, digest: &Digest) -> bool {
        self.quorum_digest.get(&phase) == Some(digest)
    }

    pub fn quorum_digest(&self, phase: Phase) -> Option<Digest> {
        self.quorum_digest.get(&phase).copied()
    }

    pub fn vote_count(&self, phase: Phase, digest: &Digest) -> usize {
        self.tallies
            .get(&(phase, *digest))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn has_voted(&self, sender: &NodeId, phase: Phase) -> bool {
        self.ballots.contains_key(&(sender.clone(), phase))
    }

    /// Signed votes backing the quorum for `digest`, if it has one.
    pub fn certificate(&self, phase: Phase, digest: &Digest) -> Option<Vec<VoteRecord>> {
        if !self.has_quorum(phase, digest) {
            return None;
        }
        self.tallies.get(&(phase, *digest)).cloned()
    }

    /// Every vote received for `digest` in `phase`, quorum or not.
    pub fn votes(&self, phase: Phase, digest: &Digest) -> Vec<VoteRecord> {
        self.tallies
            .get(&(phase, *digest))
            .cloned()
            .unwrap_or_default()
    }

    pub fn audit_log(&self) -> &[AuditEntry] {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> NodeId {
        format!("node-{}", n)
    }

    fn vote(n: usize) -> VoteRecord {
        VoteRecord {
            sender: id(n),
            timestamp: 0,
            signature: vec![n as u8],
        }
    }

    #[test]
    fn test_quorum_params() {
        let p = QuorumParams::for_nodes(4);
        assert_eq!((p.f, p.quorum, p.weak_quorum), (1, 3, 2));
        let p = QuorumParams::for_nodes(7);
        assert_eq!((p.f, p.quorum), (2, 5));
        // n = 6: f = 1, but two quorums of 3 would not intersect in an honest node
        let p = QuorumParams::for_nodes(6);
        assert_eq!((p.f, p.quorum), (1, 4));
        let p = QuorumParams::for_nodes(1);
        assert_eq!((p.f, p.quorum), (0, 1));
        let p = QuorumParams::for_nodes(3);
        assert_eq!((p.f, p.quorum), (0, 2));
    }

    #[test]
    fn test_quorum_reached_once() {
        let d = Digest([1u8; 32]);
        let mut qc = QuorumCertificate::new(0, 1, 3);
        assert_eq!(
            qc.add_vote(Phase::Prepare, d, vote(0)),
            Ok(VoteOutcome::Recorded { count: 1 })
        );
        qc.add_vote(Phase::Prepare, d, vote(1)).unwrap();
        assert!(!qc.has_quorum(Phase::Prepare, &d));
        assert_eq!(
            qc.add_vote(Phase::Prepare, d, vote(2)),
            Ok(VoteOutcome::QuorumReached { count: 3 })
        );
        assert_eq!(
            qc.add_vote(Phase::Prepare, d, vote(3)),
            Ok(VoteOutcome::Recorded { count: 4 })
        );
        assert!(qc.has_quorum(Phase::Prepare, &d));
        assert!(!qc.has_quorum(Phase::Commit, &d));
        assert_eq!(qc.certificate(Phase::Prepare, &d).unwrap().len(), 4);
    }

    #[test]
    fn test_duplicate_and_equivocating_votes() {
        let a = Digest([1u8; 32]);
        let b = Digest([2u8; 32]);
        let mut qc = QuorumCertificate::new(0, 1, 3);
        qc.add_vote(Phase::Prepare, a, vote(0)).unwrap();

        assert!(matches!(
            qc.add_vote(Phase::Prepare, a, vote(0)),
            Err(QuorumError::DuplicateVote { .. })
        ));
        assert!(matches!(
            qc.add_vote(Phase::Prepare, b, vote(0)),
            Err(QuorumError::Equivocation { .. })
        ));
        assert_eq!(qc.vote_count(Phase::Prepare, &a), 1);
        assert_eq!(qc.vote_count(Phase::Prepare, &b), 0);
        assert_eq!(qc.audit_log().len(), 1);

        // A commit vote from the same sender is a different phase.
        assert!(qc.add_vote(Phase::Commit, a, vote(0)).is_ok());
    }

    #[test]
    fn test_minority_digest_after_quorum_is_audited() {
        let a = Digest([1u8; 32]);
        let b = Digest([2u8; 32]);
        let mut qc = QuorumCertificate::new(0, 1, 3);
        for i in 0..3 {
            qc.add_vote(Phase::Commit, a, vote(i)).unwrap();
        }
        let err = qc.add_vote(Phase::Commit, b, vote(3)).unwrap_err();
        assert!(matches!(err, QuorumError::ConflictingDigest { .. }));
        assert_eq!(qc.vote_count(Phase::Commit, &b), 0);
        assert_eq!(qc.audit_log()[0].digest, b);
        assert!(qc.has_voted(&id(3), Phase::Commit));
    }

    #[test]
    fn test_second_digest_signed_by_quorum_is_fatal() {
        let a = Digest([1u8; 32]);
        let b = Digest([2u8; 32]);
        let mut qc = QuorumCertificate::new(0, 1, 3);
        for i in 0..3 {
            qc.add_vote(Phase::Prepare, a, vote(i)).unwrap();
        }
        assert!(matches!(
            qc.add_vote(Phase::Prepare, b, vote(0)),
            Err(QuorumError::Equivocation { .. })
        ));
        assert!(matches!(
            qc.add_vote(Phase::Prepare, b, vote(1)),
            Err(QuorumError::Equivocation { .. })
        ));
        assert_eq!(
            qc.add_vote(Phase::Prepare, b, vote(2)),
            Err(QuorumError::ConflictingQuorum {
                phase: Phase::Prepare,
                first: a,
                second: b,
            })
        );
        assert!(matches!(
            qc.add_vote(Phase::Prepare, b, vote(3)),
            Err(QuorumError::ConflictingQuorum { .. })
        ));
        // The first quorum is never replaced.
        assert_eq!(qc.quorum_digest(Phase::Prepare), Some(a));
        assert_eq!(qc.vote_count(Phase::Prepare, &b), 0);
    }

    #[test]
    fn test_repeated_equivocation_is_audited_once() {
        let mut qc = QuorumCertificate::new(0, 1, 3);
        qc.add_vote(Phase::Commit, Digest([0u8; 32]), vote(3)).unwrap();
        for n in 1..=200u8 {
            assert!(matches!(
                qc.add_vote(Phase::Commit, Digest([n; 32]), vote(3)),
                Err(QuorumError::Equivocation { .. })
            ));
        }
        assert_eq!(qc.audit_log().len(), 1);
    }
}
