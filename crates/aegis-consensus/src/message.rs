// PROTOCOL MESSAGES
// Closed set of consensus message kinds and their signed wire envelope.
//
// SAFETY INVARIANTS:
// 1. The signature covers every header and body field of the message
// 2. Undecodable frames and unknown tags are rejected before dispatch
// 3. New message kinds are added by extending `MessageBody`, nothing else

use crate::collaborators::Crypto;
use crate::error::ConsensusError;
use crate::types::{Digest, NodeId, Proposal, ProposalId, Signature};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

/// Vote phases tallied by quorum certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Prepare,
    Commit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "PREPARE",
            Phase::Commit => "COMMIT",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message tag, used for dispatch logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    PrePrepare,
    Prepare,
    Commit,
    Reply,
    Checkpoint,
    ViewChange,
    NewView,
    Solution,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "REQUEST",
            MessageKind::PrePrepare => "PRE_PREPARE",
            MessageKind::Prepare => "PREPARE",
            MessageKind::Commit => "COMMIT",
            MessageKind::Reply => "REPLY",
            MessageKind::Checkpoint => "CHECKPOINT",
            MessageKind::ViewChange => "VIEW_CHANGE",
            MessageKind::NewView => "NEW_VIEW",
            MessageKind::Solution => "SOLUTION",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signed vote inside a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub sender: NodeId,

    /// Timestamp of the original vote message, needed to re-verify the signature
    pub timestamp: u64,
    pub signature: Signature,
}

impl VoteRecord {
    pub fn from_signed(message: &SignedMessage) -> Self {
        VoteRecord {
            sender: message.message.sender.clone(),
            timestamp: message.message.timestamp,
            signature: message.signature.clone(),
        }
    }
}

/// Proof that a slot reached prepare quorum in `view`.
///
/// `votes` holds the prepare votes, or the commit votes when the slot was
/// committed without this node observing prepare quorum itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub proposal: Proposal,
    pub phase: Phase,
    pub votes: Vec<VoteRecord>,
}

impl PreparedCertificate {
    /// True when the proposal matches the digest and at least `quorum`
    /// distinct roster members signed a vote for it.
    pub fn verify(&self, crypto: &dyn Crypto, roster: &[NodeId], quorum: usize) -> bool {
        if crypto.digest(&self.proposal.digest_bytes()) != self.digest {
            return false;
        }
        let body = match self.phase {
            Phase::Prepare => MessageBody::Prepare,
            Phase::Commit => MessageBody::Commit,
        };

        let mut signers = BTreeSet::new();
        for vote in &self.votes {
            if !roster.contains(&vote.sender) || signers.contains(&vote.sender) {
                continue;
            }
            let message = ConsensusMessage::new(
                self.view,
                self.sequence,
                self.digest,
                vote.sender.clone(),
                vote.timestamp,
                body.clone(),
            );
            if crypto.verify(&vote.sender, &message.signing_bytes(), &vote.signature) {
                signers.insert(vote.sender.clone());
            }
        }
        signers.len() >= quorum
    }
}

/// Body of a VIEW_CHANGE vote. The header view is the candidate view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeVote {
    pub last_committed: u64,
    pub stable_checkpoint: u64,

    /// Signed CHECKPOINT messages backing `stable_checkpoint`; empty at 0
    pub checkpoint_proof: Vec<SignedMessage>,
    pub prepared: Vec<PreparedCertificate>,
}

impl ViewChangeVote {
    /// True when `checkpoint_proof` holds `quorum` distinct roster members'
    /// signed CHECKPOINTs for `stable_checkpoint`, all with one state digest.
    pub fn checkpoint_is_proven(&self, crypto: &dyn Crypto, roster: &[NodeId], quorum: usize) -> bool {
        if self.stable_checkpoint == 0 {
            return true;
        }
        let Some(first) = self.checkpoint_proof.first() else {
            return false;
        };
        let state = first.message.digest;

        let mut signers = BTreeSet::new();
        for checkpoint in &self.checkpoint_proof {
            let message = &checkpoint.message;
            let matches = matches!(message.body, MessageBody::Checkpoint)
                && message.sequence == self.stable_checkpoint
                && message.digest == state;
            if !matches || !roster.contains(&message.sender) || signers.contains(&message.sender) {
                continue;
            }
            if checkpoint.verify(crypto) {
                signers.insert(message.sender.clone());
            }
        }
        signers.len() >= quorum
    }

    /// Structural check against the sender's own watermark window: the
    /// checkpoint is proven and every claim lies in
    /// (stable_checkpoint, stable_checkpoint + window].
    pub fn is_sound(&self, crypto: &dyn Crypto, roster: &[NodeId], quorum: usize, window: u64) -> bool {
        let high = self.stable_checkpoint.saturating_add(window);
        self.last_committed <= high
            && self
                .prepared
                .iter()
                .all(|cert| cert.sequence > self.stable_checkpoint && cert.sequence <= high)
            && self.checkpoint_is_proven(crypto, roster, quorum)
    }
}

/// A slot the new leader re-proposes in the new view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reproposal {
    pub sequence: u64,
    pub digest: Digest,
    pub proposal: Proposal,
}

/// Body of NEW_VIEW: the quorum of view-change votes and the derived re-proposals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewViewProof {
    pub view_changes: Vec<SignedMessage>,
    pub reproposals: Vec<Reproposal>,
    pub next_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Client proposal forwarded to the leader and every replica
    Request { proposal: Proposal },
    PrePrepare { proposal: Proposal },
    Prepare,
    Commit,
    /// Execution acknowledgement sent to the proposer
    Reply { proposal_id: ProposalId },
    /// Header sequence and digest carry the checkpoint position and state digest
    Checkpoint,
    ViewChange(ViewChangeVote),
    NewView(NewViewProof),
    /// Work for a computation challenge, credited to the signed sender
    Solution { challenge_id: String, nonce: u64 },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Request { .. } => MessageKind::Request,
            MessageBody::PrePrepare { .. } => MessageKind::PrePrepare,
            MessageBody::Prepare => MessageKind::Prepare,
            MessageBody::Commit => MessageKind::Commit,
            MessageBody::Reply { .. } => MessageKind::Reply,
            MessageBody::Checkpoint => MessageKind::Checkpoint,
            MessageBody::ViewChange(_) => MessageKind::ViewChange,
            MessageBody::NewView(_) => MessageKind::NewView,
            MessageBody::Solution { .. } => MessageKind::Solution,
        }
    }
}

/// Unsigned protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub sender: NodeId,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub body: MessageBody,
}

impl ConsensusMessage {
    pub fn new(
        view: u64,
        sequence: u64,
        digest: Digest,
        sender: NodeId,
        timestamp: u64,
        body: MessageBody,
    ) -> Self {
        ConsensusMessage {
            view,
            sequence,
            digest,
            sender,
            timestamp,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        wire_options().serialize(self).unwrap_or_default()
    }
}

/// Message plus the sender's signature over `signing_bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: ConsensusMessage,
    pub signature: Signature,
}

impl SignedMessage {
    /// Sign `message` with the local key held by `crypto`.
    pub fn seal(message: ConsensusMessage, crypto: &dyn Crypto) -> Self {
        let signature = crypto.sign(&message.signing_bytes());
        SignedMessage { message, signature }
    }

    pub fn verify(&self, crypto: &dyn Crypto) -> bool {
        crypto.verify(
            &self.message.sender,
            &self.message.signing_bytes(),
            &self.signature,
        )
    }

    pub fn sender(&self) -> &NodeId {
        &self.message.sender
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        wire_options()
            .serialize(self)
            .map_err(|e| ConsensusError::InvalidMessage(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        wire_options()
            .deserialize(bytes)
            .map_err(|e| ConsensusError::InvalidMessage(e.to_string()))
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_BYTES)
}
