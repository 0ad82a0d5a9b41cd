// STATE MACHINE OUTPUTS
// Side effects requested by the PBFT core and the view manager. Both are
// synchronous; the engine actor performs the actions in order.

use crate::message::{Reproposal, SignedMessage};
use crate::types::{Decision, NodeId};

/// A view the node moves into, with the slots the new leader re-proposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledView {
    pub view: u64,
    pub leader: NodeId,
    pub reproposals: Vec<Reproposal>,

    /// First sequence the new leader assigns
    pub next_sequence: u64,

    /// Highest proven stable checkpoint in the view-change quorum
    pub stable_checkpoint: u64,
    pub checkpoint_proof: Vec<SignedMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Broadcast(SignedMessage),

    /// Start the phase timer for a slot that accepted a pre-prepare
    ArmSlotTimer { view: u64, sequence: u64 },

    /// Start the timer for NEW_VIEW of the candidate view
    ArmViewChangeTimer { view: u64 },

    /// Deliver a committed decision; emitted in sequence order exactly once
    Execute(Decision),

    /// The leader of `view` missed a deadline for `sequence`
    SuspectLeader { view: u64, sequence: u64 },

    /// Stop normal-case processing until the next view is installed
    SuspendProcessing,

    InstallView(InstalledView),

    RequestStateTransfer { from: u64, to: u64 },

    /// More than f nodes misbehaved; surfaced to the operator
    ConsistencyViolation(String),
}
