// CORE DATA MODEL
// Node identities, proposal digests, proposals and committed decisions.
//
// SAFETY INVARIANTS:
// 1. A proposal is immutable once submitted (its digest covers every field)
// 2. A decision is bound to exactly one sequence number
// 3. Suspected-faulty flags are local observations, never authoritative

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable node identity.
pub type NodeId = String;

/// Opaque signature bytes produced by the crypto collaborator.
pub type Signature = Vec<u8>;

/// 32-byte digest of a proposal or of replicated state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Digest used by messages that do not refer to a proposal (view changes).
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Build a digest from arbitrary bytes, truncating or zero-padding to 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        let len = bytes.len().min(32);
        out[..len].copy_from_slice(&bytes[..len]);
        Digest(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Unique proposal identifier handed back by `submit_proposal`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProposalId(pub String);

impl ProposalId {
    pub fn generate() -> Self {
        ProposalId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client proposal. Immutable once submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,

    /// Node that submitted the proposal
    pub proposer: NodeId,

    /// Opaque application payload
    pub payload: Vec<u8>,

    /// Creation time in milliseconds since the Unix epoch
    pub created_at: u64,

    /// Gap filler created by a new leader for sequences nobody prepared
    pub noop: bool,
}

impl Proposal {
    pub fn new(proposer: NodeId, payload: Vec<u8>, created_at: u64) -> Self {
        Proposal {
            id: ProposalId::generate(),
            proposer,
            payload,
            created_at,
            noop: false,
        }
    }

    /// Deterministic no-op proposal for `sequence` in `view`.
    ///
    /// Every honest node recomputes the same no-op when validating NEW_VIEW,
    /// so nothing in it may depend on local state or randomness.
    pub fn noop(leader: &NodeId, view: u64, sequence: u64) -> Self {
        Proposal {
            id: ProposalId(format!("noop:{}:{}", view, sequence)),
            proposer: leader.clone(),
            payload: Vec::new(),
            created_at: 0,
            noop: true,
        }
    }

    /// Canonical bytes fed to the digest function.
    pub fn digest_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

/// A committed proposal, archived in the decision log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub sequence: u64,

    /// View in which the commit quorum formed
    pub view: u64,

    pub digest: Digest,
    pub proposal: Proposal,

    /// Local commit time in milliseconds
    pub committed_at: u64,
}

impl Decision {
    pub fn payload(&self) -> &[u8] {
        &self.proposal.payload
    }

    pub fn is_noop(&self) -> bool {
        self.proposal.noop
    }
}

/// Node as seen by this replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    /// Hex-encoded public key reference, when the crypto collaborator exposes one
    pub public_key: Option<String>,

    /// Current (decayed) computation score
    pub computation_score: f64,

    /// Locally inferred; never globally authoritative
    pub suspected_faulty: bool,
}
