// DECISION LOG
// Archive of committed decisions in sequence order.
//
// SAFETY: Appends are strictly sequential; a sequence is archived once and
// never rewritten.

use crate::types::{Decision, ProposalId};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct DecisionLog {
    decisions: BTreeMap<u64, Decision>,
    by_proposal: HashMap<ProposalId, u64>,
    last_committed: u64,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive `decision` if it is the next sequence. Returns false for
    /// replays and out-of-order decisions.
    pub fn append(&mut self, decision: Decision) -> bool {
        if decision.sequence != self.last_committed + 1 {
            return false;
        }
        self.last_committed = decision.sequence;
        self.by_proposal
            .insert(decision.proposal.id.clone(), decision.sequence);
        self.decisions.insert(decision.sequence, decision);
        true
    }

    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }

    pub fn get(&self, sequence: u64) -> Option<&Decision> {
        self.decisions.get(&sequence)
    }

    pub fn sequence_of(&self, proposal: &ProposalId) -> Option<u64> {
        self.by_proposal.get(proposal).copied()
    }

    /// Decisions in [from, to], for serving state transfer.
    pub fn range(&self, from: u64, to: u64) -> Vec<Decision> {
        if from > to {
            return Vec::new();
        }
        self.decisions
            .range(from..=to)
            .map(|(_, decision)| decision.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Digest, Proposal};

    fn decision(sequence: u64) -> Decision {
        Decision {
            sequence,
            view: 0,
            digest: Digest([sequence as u8; 32]),
            proposal: Proposal::new("node-0".to_string(), vec![sequence as u8], 0),
            committed_at: 0,
        }
    }

    #[test]
    fn test_append_is_sequential_and_idempotent() {
        let mut log = DecisionLog::new();
        assert!(!log.append(decision(2)));
        assert!(log.append(decision(1)));
        assert!(!log.append(decision(1)));
        assert!(log.append(decision(2)));
        assert_eq!(log.last_committed(), 2);
        assert_eq!(log.len(), 2);

        let id = log.get(2).unwrap().proposal.id.clone();
        assert_eq!(log.sequence_of(&id), Some(2));
        assert_eq!(log.range(1, 5).len(), 2);
        assert!(log.range(3, 1).is_empty());
    }
}
