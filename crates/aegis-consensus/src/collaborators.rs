// EXTERNAL COLLABORATORS
// Narrow interfaces to transport, cryptography, the node roster and state transfer.
//
// The consensus core never opens sockets or touches key material directly;
// everything crosses one of these traits.

use crate::types::{Digest, NodeId, Signature};
use log::info;

/// Message transport. Sends are fire-and-forget; delivery is eventual at best.
pub trait Transport: Send + Sync {
    fn send(&self, to: &NodeId, bytes: Vec<u8>);

    /// Deliver to every known node except the local one.
    fn broadcast(&self, bytes: Vec<u8>);
}

/// Signing, verification and hashing.
pub trait Crypto: Send + Sync {
    /// Sign with the local node's key.
    fn sign(&self, payload: &[u8]) -> Signature;

    fn verify(&self, node: &NodeId, payload: &[u8], signature: &[u8]) -> bool;

    fn digest(&self, payload: &[u8]) -> Digest;

    /// Opaque public key reference, if the implementation exposes one.
    fn public_key(&self, _node: &NodeId) -> Option<Vec<u8>> {
        None
    }
}

/// Source of the canonical node ordering used for leader selection.
pub trait NodeRoster: Send + Sync {
    /// Ordered list of node ids. Every honest node must see the same order.
    fn known_nodes(&self) -> Vec<NodeId>;
}

/// Hook used when this node falls behind and must fetch committed decisions.
///
/// Implementations fetch the range from peers and hand verified decisions
/// back through `ConsensusEngine::install_decisions`.
pub trait StateTransfer: Send + Sync {
    fn request_range(&self, from_sequence: u64, to_sequence: u64);
}

/// Fixed roster, sorted and de-duplicated.
#[derive(Debug, Clone)]
pub struct StaticRoster {
    nodes: Vec<NodeId>,
}

impl StaticRoster {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut nodes: Vec<NodeId> = nodes.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();
        StaticRoster { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeRoster for StaticRoster {
    fn known_nodes(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }
}

/// State transfer stand-in that only records the request in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStateTransfer;

impl StateTransfer for LoggingStateTransfer {
    fn request_range(&self, from_sequence: u64, to_sequence: u64) {
        info!(
            "State transfer requested for sequences [{}, {}] (no provider configured)",
            from_sequence, to_sequence
        );
    }
}
