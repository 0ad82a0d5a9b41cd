// STATUS AND METRICS
// Snapshot published by the engine actor for monitoring collaborators.

use crate::types::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Inbound frames dropped before reaching the state machine.
#[derive(Debug, Default)]
pub struct BoundaryCounters {
    pub malformed: AtomicU64,
    pub unknown_sender: AtomicU64,
    pub invalid_signature: AtomicU64,
    pub queue_full: AtomicU64,
    pub engine_stopped: AtomicU64,
}

impl BoundaryCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RejectionStats {
        RejectionStats {
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown_sender: self.unknown_sender.load(Ordering::Relaxed),
            invalid_signature: self.invalid_signature.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            engine_stopped: self.engine_stopped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionStats {
    pub malformed: u64,
    pub unknown_sender: u64,
    pub invalid_signature: u64,
    pub queue_full: u64,
    pub engine_stopped: u64,
}

impl RejectionStats {
    pub fn total(&self) -> u64 {
        self.malformed + self.unknown_sender + self.invalid_signature + self.queue_full + self.engine_stopped
    }
}

/// Progress of a proposal submitted through this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalOutcome {
    Pending,

    /// Executed locally at `sequence`
    Committed { sequence: u64 },

    /// f+1 nodes replied, so at least one honest node executed it
    Confirmed { sequence: u64, replies: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub running: bool,
    pub view: u64,
    pub leader: NodeId,
    pub view_state: String,

    /// Phase of the oldest unfinished slot
    pub phase: String,

    pub last_committed_sequence: u64,
    pub stable_checkpoint: u64,
    pub known_nodes: Vec<Node>,
    pub phase_histogram: BTreeMap<String, usize>,
    pub quorum_size: usize,
    pub fault_tolerance: usize,
    pub pending_requests: usize,
    pub timeouts: u64,
    pub view_changes: u64,
    pub rejections: RejectionStats,
    pub consistency_violations: Vec<String>,
}

impl EngineStatus {
    pub fn initial(node_id: NodeId, leader: NodeId, known_nodes: Vec<Node>, quorum_size: usize, fault_tolerance: usize) -> Self {
        EngineStatus {
            node_id,
            running: false,
            view: 0,
            leader,
            view_state: "STABLE(0)".to_string(),
            phase: "IDLE".to_string(),
            last_committed_sequence: 0,
            stable_checkpoint: 0,
            known_nodes,
            phase_histogram: BTreeMap::new(),
            quorum_size,
            fault_tolerance,
            pending_requests: 0,
            timeouts: 0,
            view_changes: 0,
            rejections: RejectionStats::default(),
            consistency_violations: Vec::new(),
        }
    }

    pub fn score_of(&self, node: &str) -> Option<f64> {
        self.known_nodes
            .iter()
            .find(|n| n.id == node)
            .map(|n| n.computation_score)
    }
}
