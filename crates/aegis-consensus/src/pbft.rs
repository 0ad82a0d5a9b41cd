// PBFT THREE-PHASE COMMIT
// Per-slot state machine: pre-prepare -> prepare -> commit -> execute.
//
// SAFETY INVARIANTS:
// 1. At most one pre-prepare digest is accepted per (view, sequence)
// 2. Pre-prepares are accepted only from the current leader, and only if the
//    leader passes the computation gate
// 3. Decisions execute in strict sequence order, exactly once per sequence
// 4. A slot that timed out is never retried in the same view
// 5. Nothing outside (low watermark, low watermark + window] is accepted

use crate::action::{Action, InstalledView};
use crate::clock::Clock;
use crate::collaborators::Crypto;
use crate::computation_gate::ComputationGate;
use crate::message::{
    ConsensusMessage, MessageBody, MessageKind, Phase, PreparedCertificate, SignedMessage,
    ViewChangeVote, VoteRecord,
};
use crate::quorum::{QuorumCertificate, QuorumError, QuorumParams};
use crate::types::{Decision, Digest, NodeId, Proposal};
use crate::view_manager::leader_for;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PbftError {
    #[error("message for stale view {got} (current view {current})")]
    StaleView { current: u64, got: u64 },

    #[error("message for future view {got} (current view {current})")]
    FutureView { current: u64, got: u64 },

    #[error("normal-case processing is suspended pending a view change")]
    Suspended,

    #[error("local node is not the leader (leader: {leader})")]
    NotLeader { leader: NodeId },

    #[error("pre-prepare from {sender}, but the leader is {leader}")]
    UnauthorizedSender { sender: NodeId, leader: NodeId },

    #[error("leader {leader} is below the computation score floor")]
    IneligibleLeader { leader: NodeId },

    #[error("digest does not match proposal for sequence {sequence}")]
    DigestMismatch { sequence: u64 },

    #[error("sequence {sequence} outside watermarks ({low}, {high}]")]
    OutsideWatermarks { sequence: u64, low: u64, high: u64 },

    #[error("conflicting pre-prepare for sequence {sequence}")]
    ConflictingPrePrepare { sequence: u64 },

    #[error("proposal already assigned to sequence {sequence}")]
    DuplicateProposal { sequence: u64 },

    #[error("slot {sequence} was aborted in this view")]
    SlotAborted { sequence: u64 },

    #[error("slot {sequence} is halted")]
    SlotHalted { sequence: u64 },

    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageKind),

    #[error(transparent)]
    Quorum(#[from] QuorumError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlotPhase {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
}

impl SlotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotPhase::Idle => "IDLE",
            SlotPhase::PrePrepared => "PRE_PREPARED",
            SlotPhase::Prepared => "PREPARED",
            SlotPhase::Committed => "COMMITTED",
        }
    }
}

/// One sequence slot. Votes may arrive before the pre-prepare, in which
/// case the slot stays `Idle` with no digest.
#[derive(Debug, Clone)]
pub struct Slot {
    pub view: u64,
    pub sequence: u64,
    pub phase: SlotPhase,
    pub digest: Option<Digest>,
    pub proposal: Option<Proposal>,
    pub executed: bool,
    pub aborted: bool,
    pub halted: bool,
    qc: QuorumCertificate,
}

impl Slot {
    fn new(view: u64, sequence: u64, quorum: usize) -> Self {
        Slot {
            view,
            sequence,
            phase: SlotPhase::Idle,
            digest: None,
            proposal: None,
            executed: false,
            aborted: false,
            halted: false,
            qc: QuorumCertificate::new(view, sequence, quorum),
        }
    }

    pub fn certificate(&self) -> &QuorumCertificate {
        &self.qc
    }
}

pub struct PbftCore {
    node_id: NodeId,
    roster: Vec<NodeId>,
    params: QuorumParams,
    crypto: Arc<dyn Crypto>,
    gate: Arc<ComputationGate>,
    clock: Arc<dyn Clock>,

    view: u64,
    leader: NodeId,
    active: bool,

    slots: BTreeMap<u64, Slot>,

    /// Next sequence the leader assigns and replicas accept
    next_sequence: u64,
    last_executed: u64,
    low_watermark: u64,
    watermark_window: u64,

    /// Signed CHECKPOINTs behind `low_watermark`
    stable_proof: Vec<SignedMessage>,

    /// Pre-prepares above `next_sequence`, waiting for the gap to close
    buffered: BTreeMap<u64, SignedMessage>,

    /// Digest -> sequence for every live pre-prepare
    assigned: HashMap<Digest, u64>,

    /// Highest sequence already requested from state transfer
    transfer_requested: u64,
}

impl PbftCore {
    pub fn new(
        node_id: NodeId,
        roster: Vec<NodeId>,
        crypto: Arc<dyn Crypto>,
        gate: Arc<ComputationGate>,
        clock: Arc<dyn Clock>,
        watermark_window: u64,
    ) -> Self {
        let params = QuorumParams::for_nodes(roster.len());
        let leader = leader_for(0, &roster);
        PbftCore {
            node_id,
            roster,
            params,
            crypto,
            gate,
            clock,
            view: 0,
            leader,
            active: true,
            slots: BTreeMap::new(),
            next_sequence: 1,
            last_executed: 0,
            low_watermark: 0,
            watermark_window,
            stable_proof: Vec::new(),
            buffered: BTreeMap::new(),
            assigned: HashMap::new(),
            transfer_requested: 0,
        }
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn leader(&self) -> &NodeId {
        &self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.node_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn params(&self) -> QuorumParams {
        self.params
    }

    pub fn last_executed(&self) -> u64 {
        self.last_executed
    }

    pub fn low_watermark(&self) -> u64 {
        self.low_watermark
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn slot(&self, sequence: u64) -> Option<&Slot> {
        self.slots.get(&sequence)
    }

    /// True if the digest is bound to a live slot.
    pub fn knows_digest(&self, digest: &Digest) -> bool {
        self.assigned.contains_key(digest)
    }

    pub fn suspend(&mut self) {
        self.active = false;
    }

    fn seal(&self, sequence: u64, digest: Digest, body: MessageBody) -> SignedMessage {
        let message = ConsensusMessage::new(
            self.view,
            sequence,
            digest,
            self.node_id.clone(),
            self.clock.now_millis(),
            body,
        );
        SignedMessage::seal(message, self.crypto.as_ref())
    }

    fn check_view(&self, view: u64) -> Result<(), PbftError> {
        if view < self.view {
            return Err(PbftError::StaleView {
                current: self.view,
                got: view,
            });
        }
        if view > self.view {
            return Err(PbftError::FutureView {
                current: self.view,
                got: view,
            });
        }
        Ok(())
    }

    fn check_watermarks(&self, sequence: u64) -> Result<(), PbftError> {
        let high = self.low_watermark.saturating_add(self.watermark_window);
        if sequence <= self.low_watermark || sequence > high {
            return Err(PbftError::OutsideWatermarks {
                sequence,
                low: self.low_watermark,
                high,
            });
        }
        Ok(())
    }

    /// Leader only: assign the next sequence to `proposal` and pre-prepare it.
    ///
    /// A proposal whose digest is already bound to a slot is ignored.
    pub fn propose(&mut self, proposal: Proposal) -> Result<Vec<Action>, PbftError> {
        if !self.active {
            return Err(PbftError::Suspended);
        }
        if !self.is_leader() {
            return Err(PbftError::NotLeader {
                leader: self.leader.clone(),
            });
        }
        if !self.gate.is_eligible_leader(&self.node_id) {
            return Err(PbftError::IneligibleLeader {
                leader: self.node_id.clone(),
            });
        }

        let digest = self.crypto.digest(&proposal.digest_bytes());
        if let Some(sequence) = self.assigned.get(&digest) {
            debug!("Proposal {} already assigned to sequence {}", proposal.id, sequence);
            return Ok(Vec::new());
        }
        let sequence = self.next_sequence;
        self.check_watermarks(sequence)?;
        self.next_sequence += 1;

        info!(
            "PBFT: proposing {} at view {} sequence {}",
            digest.short(),
            self.view,
            sequence
        );
        let pre_prepare = self.seal(
            sequence,
            digest,
            MessageBody::PrePrepare {
                proposal: proposal.clone(),
            },
        );
        let mut actions = vec![Action::Broadcast(pre_prepare)];
        actions.extend(self.accept_pre_prepare(sequence, digest, proposal, false));
        Ok(actions)
    }

    /// Handle a PRE_PREPARE, then any buffered successors it unblocks.
    pub fn on_pre_prepare(&mut self, message: &SignedMessage) -> Result<Vec<Action>, PbftError> {
        let mut actions = self.process_pre_prepare(message)?;
        while let Some(next) = self.buffered.remove(&self.next_sequence) {
            match self.process_pre_prepare(&next) {
                Ok(more) => actions.extend(more),
                Err(e) => warn!("Dropped buffered pre-prepare {}: {}", next.message.sequence, e),
            }
        }
        Ok(actions)
    }

    fn process_pre_prepare(&mut self, signed: &SignedMessage) -> Result<Vec<Action>, PbftError> {
        let message = &signed.message;
        let MessageBody::PrePrepare { proposal } = &message.body else {
            return Err(PbftError::UnexpectedMessage(message.kind()));
        };
        self.check_view(message.view)?;
        if !self.active {
            return Err(PbftError::Suspended);
        }
        if message.sender != self.leader {
            return Err(PbftError::UnauthorizedSender {
                sender: message.sender.clone(),
                leader: self.leader.clone(),
            });
        }
        if !self.gate.is_eligible_leader(&message.sender) {
            return Err(PbftError::IneligibleLeader {
                leader: message.sender.clone(),
            });
        }

        let sequence = message.sequence;
        let digest = self.crypto.digest(&proposal.digest_bytes());
        if digest != message.digest {
            return Err(PbftError::DigestMismatch { sequence });
        }

        if let Some(slot) = self.slots.get(&sequence) {
            if slot.view == self.view && slot.digest.is_some() {
                if slot.digest == Some(digest) {
                    return Ok(Vec::new());
                }
                warn!(
                    "PBFT: leader {} sent conflicting pre-prepare for sequence {}",
                    message.sender, sequence
                );
                return Err(PbftError::ConflictingPrePrepare { sequence });
            }
            if slot.aborted {
                return Err(PbftError::SlotAborted { sequence });
            }
        }
        if sequence < self.next_sequence {
            debug!("Ignoring pre-prepare for settled sequence {}", sequence);
            return Ok(Vec::new());
        }
        self.check_watermarks(sequence)?;
        if let Some(existing) = self.assigned.get(&digest) {
            return Err(PbftError::DuplicateProposal {
                sequence: *existing,
            });
        }
        if sequence > self.next_sequence {
            debug!(
                "Buffering pre-prepare {} until {} arrives",
                sequence, self.next_sequence
            );
            self.buffered.insert(sequence, signed.clone());
            return Ok(Vec::new());
        }

        self.next_sequence += 1;
        Ok(self.accept_pre_prepare(sequence, digest, proposal.clone(), false))
    }

    fn accept_pre_prepare(
        &mut self,
        sequence: u64,
        digest: Digest,
        proposal: Proposal,
        already_executed: bool,
    ) -> Vec<Action> {
        let view = self.view;
        let quorum = self.params.quorum;
        self.assigned.insert(digest, sequence);

        let slot = self
            .slots
            .entry(sequence)
            .or_insert_with(|| Slot::new(view, sequence, quorum));
        if slot.view != view || already_executed {
            *slot = Slot::new(view, sequence, quorum);
        }
        slot.phase = SlotPhase::PrePrepared;
        slot.digest = Some(digest);
        slot.proposal = Some(proposal);
        slot.executed = already_executed;
        info!(
            "PBFT: slot ({}, {}) pre-prepared {}",
            view,
            sequence,
            digest.short()
        );

        let prepare = self.seal(sequence, digest, MessageBody::Prepare);
        self.record_own_vote(sequence, Phase::Prepare, &prepare);

        let mut actions = Vec::new();
        if !already_executed {
            actions.push(Action::ArmSlotTimer { view, sequence });
        }
        actions.push(Action::Broadcast(prepare));
        actions.extend(self.advance(sequence));
        actions
    }

    fn record_own_vote(&mut self, sequence: u64, phase: Phase, signed: &SignedMessage) {
        if let Some(slot) = self.slots.get_mut(&sequence) {
            if let Err(e) = slot.qc.add_vote(phase, signed.message.digest, VoteRecord::from_signed(signed)) {
                debug!("Own {} vote for {} not counted: {}", phase, sequence, e);
            }
        }
    }

    /// Handle a PREPARE or COMMIT vote with an already verified signature.
    pub fn on_vote(&mut self, signed: &SignedMessage) -> Result<Vec<Action>, PbftError> {
        let message = &signed.message;
        let phase = match message.body {
            MessageBody::Prepare => Phase::Prepare,
            MessageBody::Commit => Phase::Commit,
            _ => return Err(PbftError::UnexpectedMessage(message.kind())),
        };
        self.check_view(message.view)?;
        if !self.active {
            return Err(PbftError::Suspended);
        }

        let sequence = message.sequence;
        if sequence <= self.low_watermark {
            return Ok(Vec::new());
        }
        self.check_watermarks(sequence)?;

        let view = self.view;
        let quorum = self.params.quorum;
        let slot = self
            .slots
            .entry(sequence)
            .or_insert_with(|| Slot::new(view, sequence, quorum));
        if slot.view != view {
            // Executed in an earlier view and not re-proposed.
            return Ok(Vec::new());
        }
        if slot.halted {
            return Err(PbftError::SlotHalted { sequence });
        }
        if slot.aborted {
            return Err(PbftError::SlotAborted { sequence });
        }

        match slot
            .qc
            .add_vote(phase, message.digest, VoteRecord::from_signed(signed))
        {
            Ok(_) => {}
            Err(QuorumError::DuplicateVote { .. }) => return Ok(Vec::new()),
            Err(conflict @ QuorumError::ConflictingQuorum { .. }) => {
                slot.halted = true;
                let reason = format!("slot ({}, {}): {}", view, sequence, conflict);
                error!("PBFT: consistency violation: {}", reason);
                return Ok(vec![Action::ConsistencyViolation(reason)]);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(self.advance(sequence))
    }

    fn advance(&mut self, sequence: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let view = self.view;

        let Some(slot) = self.slots.get_mut(&sequence) else {
            return actions;
        };
        let Some(digest) = slot.digest else {
            return actions;
        };
        if slot.halted || slot.aborted || slot.view != view {
            return actions;
        }

        if let Some(committed) = slot.qc.quorum_digest(Phase::Commit) {
            if committed != digest {
                // The leader equivocated and this node pre-prepared the losing digest.
                warn!(
                    "PBFT: slot ({}, {}) committed {} but local pre-prepare is {}",
                    view,
                    sequence,
                    committed.short(),
                    digest.short()
                );
                slot.halted = true;
                actions.push(Action::RequestStateTransfer {
                    from: sequence,
                    to: sequence,
                });
                return actions;
            }
        }

        let mut send_commit = false;
        if slot.phase == SlotPhase::PrePrepared && slot.qc.has_quorum(Phase::Prepare, &digest) {
            slot.phase = SlotPhase::Prepared;
            send_commit = true;
            info!("PBFT: slot ({}, {}) prepared", view, sequence);
        }

        if send_commit {
            let commit = self.seal(sequence, digest, MessageBody::Commit);
            self.record_own_vote(sequence, Phase::Commit, &commit);
            actions.push(Action::Broadcast(commit));
        }

        let Some(slot) = self.slots.get_mut(&sequence) else {
            return actions;
        };
        if matches!(slot.phase, SlotPhase::PrePrepared | SlotPhase::Prepared)
            && slot.qc.has_quorum(Phase::Commit, &digest)
        {
            slot.phase = SlotPhase::Committed;
            info!("PBFT: slot ({}, {}) committed", view, sequence);
            actions.extend(self.execute_ready());
        }
        actions
    }

    fn execute_ready(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let next = self.last_executed + 1;
            let Some(slot) = self.slots.get_mut(&next) else {
                break;
            };
            if slot.phase != SlotPhase::Committed || slot.executed {
                break;
            }
            let (Some(digest), Some(proposal)) = (slot.digest, slot.proposal.clone()) else {
                break;
            };
            slot.executed = true;
            self.last_executed = next;
            actions.push(Action::Execute(Decision {
                sequence: next,
                view: slot.view,
                digest,
                proposal,
                committed_at: self.clock.now_millis(),
            }));
        }

        // A committed slot above a hole that will never fill locally.
        let missing = self.last_executed + 1;
        let highest_committed = self
            .slots
            .range(missing..)
            .filter(|(_, slot)| slot.phase == SlotPhase::Committed)
            .map(|(sequence, _)| *sequence)
            .last();
        if let Some(highest) = highest_committed {
            let blocked = match self.slots.get(&missing) {
                None => true,
                Some(slot) => slot.aborted || slot.halted,
            };
            if blocked && highest > self.transfer_requested {
                self.transfer_requested = highest;
                warn!(
                    "PBFT: gap at sequence {} below committed {}, requesting state transfer",
                    missing, highest
                );
                actions.push(Action::RequestStateTransfer {
                    from: missing,
                    to: highest.saturating_sub(1).max(missing),
                });
            }
        }
        actions
    }

    /// Phase timer for (view, sequence) expired.
    pub fn on_timeout(&mut self, view: u64, sequence: u64) -> Vec<Action> {
        if view != self.view || !self.active {
            return Vec::new();
        }
        let Some(slot) = self.slots.get_mut(&sequence) else {
            return Vec::new();
        };
        if slot.view != view || slot.executed || slot.aborted || slot.phase == SlotPhase::Committed {
            return Vec::new();
        }
        slot.aborted = true;
        self.active = false;
        warn!(
            "PBFT: slot ({}, {}) timed out in phase {}",
            view,
            sequence,
            slot.phase.as_str()
        );
        vec![
            Action::SuspendProcessing,
            Action::SuspectLeader { view, sequence },
        ]
    }

    /// Certificates for every slot above the low watermark that reached prepare quorum.
    pub fn prepared_certificates(&self) -> Vec<PreparedCertificate> {
        self.slots
            .range(self.low_watermark.saturating_add(1)..)
            .filter(|(_, slot)| matches!(slot.phase, SlotPhase::Prepared | SlotPhase::Committed))
            .filter_map(|(sequence, slot)| {
                let digest = slot.digest?;
                let proposal = slot.proposal.clone()?;
                let (phase, votes) = match slot.qc.certificate(Phase::Prepare, &digest) {
                    Some(votes) => (Phase::Prepare, votes),
                    None => (Phase::Commit, slot.qc.certificate(Phase::Commit, &digest)?),
                };
                Some(PreparedCertificate {
                    view: slot.view,
                    sequence: *sequence,
                    digest,
                    proposal,
                    phase,
                    votes,
                })
            })
            .collect()
    }

    /// Local state for a VIEW_CHANGE vote. Execution reported past the high
    /// watermark is clamped to it.
    pub fn view_change_snapshot(&self) -> ViewChangeVote {
        let high = self.low_watermark.saturating_add(self.watermark_window);
        ViewChangeVote {
            last_committed: self.last_executed.min(high),
            stable_checkpoint: self.low_watermark,
            checkpoint_proof: self.stable_proof.clone(),
            prepared: self.prepared_certificates(),
        }
    }

    /// Enter a new view: drop unfinished slots and pre-prepare the re-proposals.
    pub fn install_view(&mut self, installed: &InstalledView) -> Vec<Action> {
        self.view = installed.view;
        self.leader = installed.leader.clone();
        self.active = true;
        self.buffered.clear();
        self.discard_unexecuted(|_| true);

        let mut actions = Vec::new();
        if installed.stable_checkpoint > self.low_watermark {
            actions.extend(
                self.garbage_collect(installed.stable_checkpoint, installed.checkpoint_proof.clone()),
            );
        }

        for reproposal in &installed.reproposals {
            let sequence = reproposal.sequence;
            if sequence <= self.low_watermark {
                continue;
            }
            let executed = match self.slots.get(&sequence) {
                Some(slot) if slot.executed => {
                    if slot.digest != Some(reproposal.digest) {
                        let reason = format!(
                            "view {} re-proposes {} at executed sequence {}",
                            installed.view,
                            reproposal.digest.short(),
                            sequence
                        );
                        error!("PBFT: consistency violation: {}", reason);
                        actions.push(Action::ConsistencyViolation(reason));
                        continue;
                    }
                    true
                }
                _ => sequence <= self.last_executed,
            };
            actions.extend(self.accept_pre_prepare(
                sequence,
                reproposal.digest,
                reproposal.proposal.clone(),
                executed,
            ));
        }

        self.next_sequence = installed
            .next_sequence
            .max(self.last_executed.saturating_add(1))
            .max(self.low_watermark.saturating_add(1));
        info!(
            "PBFT: installed view {} (leader {}, {} re-proposals, next sequence {})",
            self.view,
            self.leader,
            installed.reproposals.len(),
            self.next_sequence
        );
        actions
    }

    fn discard_unexecuted<F>(&mut self, mut discard: F)
    where
        F: FnMut(&Slot) -> bool,
    {
        let doomed: Vec<u64> = self
            .slots
            .values()
            .filter(|slot| !slot.executed && discard(slot))
            .map(|slot| slot.sequence)
            .collect();
        for sequence in doomed {
            if let Some(slot) = self.slots.remove(&sequence) {
                self.forget_digest(slot.digest, sequence);
            }
        }
    }

    fn forget_digest(&mut self, digest: Option<Digest>, sequence: u64) {
        if let Some(digest) = digest {
            if self.assigned.get(&digest) == Some(&sequence) {
                self.assigned.remove(&digest);
            }
        }
    }

    /// Drop every slot at or below a stable checkpoint and move the low
    /// watermark. `proof` is the quorum of CHECKPOINTs that made it stable.
    pub fn garbage_collect(&mut self, stable: u64, proof: Vec<SignedMessage>) -> Vec<Action> {
        if stable <= self.low_watermark {
            return Vec::new();
        }
        self.low_watermark = stable;
        self.stable_proof = proof;

        let kept = self.slots.split_off(&stable.saturating_add(1));
        let collected = std::mem::replace(&mut self.slots, kept);
        for (sequence, slot) in &collected {
            self.forget_digest(slot.digest, *sequence);
        }
        self.buffered = self.buffered.split_off(&stable.saturating_add(1));
        self.next_sequence = self.next_sequence.max(stable.saturating_add(1));
        info!(
            "PBFT: garbage-collected {} slots up to stable checkpoint {}",
            collected.len(),
            stable
        );

        if stable > self.last_executed && stable > self.transfer_requested {
            self.transfer_requested = stable;
            return vec![Action::RequestStateTransfer {
                from: self.last_executed + 1,
                to: stable,
            }];
        }
        Vec::new()
    }

    /// Apply decisions fetched by state transfer. Only the contiguous run
    /// starting at `last_executed + 1` is applied.
    pub fn apply_transferred(&mut self, mut decisions: Vec<Decision>) -> Vec<Action> {
        decisions.sort_by_key(|decision| decision.sequence);
        let mut actions = Vec::new();
        let quorum = self.params.quorum;

        for decision in decisions {
            let sequence = decision.sequence;
            if sequence <= self.last_executed {
                continue;
            }
            if sequence != self.last_executed + 1 {
                warn!(
                    "State transfer skipped from {} to {}; waiting for the gap",
                    self.last_executed, sequence
                );
                break;
            }
            let existing = self.slots.get(&sequence).map(|slot| (slot.phase, slot.digest));
            if let Some((phase, digest)) = existing {
                let conflicting = phase == SlotPhase::Committed
                    && digest.is_some()
                    && digest != Some(decision.digest);
                if conflicting {
                    let reason = format!(
                        "transferred decision {} at sequence {} conflicts with local commit",
                        decision.digest.short(),
                        sequence
                    );
                    error!("PBFT: consistency violation: {}", reason);
                    actions.push(Action::ConsistencyViolation(reason));
                    break;
                }
                self.forget_digest(digest, sequence);
                self.slots.remove(&sequence);
            }

            if sequence > self.low_watermark {
                let mut slot = Slot::new(decision.view, sequence, quorum);
                slot.phase = SlotPhase::Committed;
                slot.digest = Some(decision.digest);
                slot.proposal = Some(decision.proposal.clone());
                slot.executed = true;
                self.slots.insert(sequence, slot);
                self.assigned.insert(decision.digest, sequence);
            }
            self.last_executed = sequence;
            actions.push(Action::Execute(decision));
        }

        self.next_sequence = self.next_sequence.max(self.last_executed + 1);
        actions.extend(self.execute_ready());
        actions
    }

    /// Drop slots below commit quorum, e.g. on engine stop.
    pub fn discard_in_flight(&mut self) {
        self.buffered.clear();
        self.discard_unexecuted(|slot| slot.phase != SlotPhase::Committed);
        let highest = self
            .slots
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(self.last_executed)
            .max(self.low_watermark);
        self.next_sequence = highest + 1;
    }

    /// Phase of the oldest unfinished slot, or `Idle`.
    pub fn active_phase(&self) -> SlotPhase {
        self.slots
            .values()
            .find(|slot| !slot.executed && !slot.aborted && slot.digest.is_some())
            .map(|slot| slot.phase)
            .unwrap_or(SlotPhase::Idle)
    }

    /// Slot counts by phase label.
    pub fn histogram(&self) -> BTreeMap<String, usize> {
        let mut histogram = BTreeMap::new();
        for slot in self.slots.values() {
            let label = if slot.aborted {
                "ABORTED"
            } else if slot.halted {
                "HALTED"
            } else if slot.executed {
                "EXECUTED"
            } else {
                slot.phase.as_str()
            };
            *histogram.entry(label.to_string()).or_insert(0) += 1;
        }
        histogram
    }

    pub fn roster(&self) -> &[NodeId] {
        &self.roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ComputationParams;
    use crate::crypto::KeyRing;
    use std::collections::VecDeque;

    const IDS: [&str; 4] = ["node-0", "node-1", "node-2", "node-3"];

    struct Bus {
        cores: Vec<PbftCore>,
        gate: Arc<ComputationGate>,
        executed: Vec<Vec<Decision>>,
        other: Vec<Action>,
    }

    impl Bus {
        fn new() -> Self {
            let ring = KeyRing::deterministic(&IDS);
            let clock = Arc::new(ManualClock::new(1_000));
            let gate = Arc::new(ComputationGate::new(
                ComputationParams::default(),
                30.0,
                1.0,
                4,
                clock.clone(),
            ));
            for id in IDS {
                gate.seed_score(id, 5.0);
            }
            let roster: Vec<NodeId> = IDS.iter().map(|s| s.to_string()).collect();
            let cores = IDS
                .iter()
                .map(|id| {
                    let crypto = ring.crypto_for(id).unwrap();
                    PbftCore::new(
                        id.to_string(),
                        roster.clone(),
                        crypto,
                        gate.clone(),
                        clock.clone(),
                        100,
                    )
                })
                .collect();
            Bus {
                cores,
                gate,
                executed: vec![Vec::new(); 4],
                other: Vec::new(),
            }
        }

        fn deliver(&mut self, to: usize, message: &SignedMessage) -> Result<Vec<Action>, PbftError> {
            match message.kind() {
                MessageKind::PrePrepare => self.cores[to].on_pre_prepare(message),
                _ => self.cores[to].on_vote(message),
            }
        }

        /// Run actions from `origin` to quiescence, delivering broadcasts to
        /// every node in `reachable`.
        fn run(&mut self, origin: usize, actions: Vec<Action>, reachable: &[usize]) {
            let mut queue: VecDeque<(usize, Action)> =
                actions.into_iter().map(|a| (origin, a)).collect();
            while let Some((from, action)) = queue.pop_front() {
                match action {
                    Action::Broadcast(message) => {
                        for &to in reachable {
                            if to == from {
                                continue;
                            }
                            if let Ok(more) = self.deliver(to, &message) {
                                queue.extend(more.into_iter().map(|a| (to, a)));
                            }
                        }
                    }
                    Action::Execute(decision) => self.executed[from].push(decision),
                    Action::ArmSlotTimer { .. } => {}
                    other => self.other.push(other),
                }
            }
        }
    }

    fn proposal(payload: &[u8]) -> Proposal {
        Proposal::new("node-0".to_string(), payload.to_vec(), 1)
    }

    #[test]
    fn test_four_nodes_commit_same_proposal() {
        let mut bus = Bus::new();
        let actions = bus.cores[0].propose(proposal(b"P")).unwrap();
        bus.run(0, actions, &[0, 1, 2, 3]);

        for executed in &bus.executed {
            assert_eq!(executed.len(), 1);
            assert_eq!(executed[0].sequence, 1);
            assert_eq!(executed[0].payload(), b"P");
        }
        assert!(bus.cores.iter().all(|core| core.last_executed() == 1));
    }

    #[test]
    fn test_commits_with_one_silent_replica() {
        let mut bus = Bus::new();
        let actions = bus.cores[0].propose(proposal(b"P")).unwrap();
        bus.run(0, actions, &[0, 1, 2]);

        for node in 0..3 {
            assert_eq!(bus.executed[node].len(), 1);
        }
        assert!(bus.executed[3].is_empty());
        assert_eq!(bus.cores[3].slot(1).map(|s| s.phase), None);
    }

    #[test]
    fn test_ineligible_leader_pre_prepare_is_rejected() {
        let mut bus = Bus::new();
        bus.gate.seed_score("node-0", 0.0);

        assert!(matches!(
            bus.cores[0].propose(proposal(b"P")),
            Err(PbftError::IneligibleLeader { .. })
        ));

        // Hand-craft the pre-prepare the leader would have sent.
        let p = proposal(b"P");
        let digest = bus.cores[0].crypto.digest(&p.digest_bytes());
        let forged = bus.cores[0].seal(1, digest, MessageBody::PrePrepare { proposal: p });
        for node in 1..4 {
            assert!(matches!(
                bus.cores[node].on_pre_prepare(&forged),
                Err(PbftError::IneligibleLeader { .. })
            ));
            assert!(bus.cores[node].slot(1).is_none());
        }
    }

    #[test]
    fn test_pre_prepare_from_non_leader_is_rejected() {
        let mut bus = Bus::new();
        let p = proposal(b"P");
        let digest = bus.cores[1].crypto.digest(&p.digest_bytes());
        let forged = bus.cores[1].seal(1, digest, MessageBody::PrePrepare { proposal: p });
        assert!(matches!(
            bus.cores[2].on_pre_prepare(&forged),
            Err(PbftError::UnauthorizedSender { .. })
        ));
    }

    #[test]
    fn test_replayed_commit_is_idempotent() {
        let mut bus = Bus::new();
        let actions = bus.cores[0].propose(proposal(b"P")).unwrap();

        // Capture node-1's commit on its way out.
        let mut commits = Vec::new();
        let mut queue: VecDeque<(usize, Action)> =
            actions.into_iter().map(|a| (0, a)).collect();
        while let Some((from, action)) = queue.pop_front() {
            if let Action::Broadcast(message) = action {
                if from == 1 && message.kind() == MessageKind::Commit {
                    commits.push(message.clone());
                }
                for to in 0..4 {
                    if to != from {
                        if let Ok(more) = bus.deliver(to, &message) {
                            queue.extend(more.into_iter().map(|a| (to, a)));
                        }
                    }
                }
            } else if let Action::Execute(decision) = action {
                bus.executed[from].push(decision);
            }
        }
        assert_eq!(bus.executed[2].len(), 1);

        let replay = commits.pop().unwrap();
        for _ in 0..3 {
            assert_eq!(bus.cores[2].on_vote(&replay), Ok(Vec::new()));
        }
        assert_eq!(bus.cores[2].last_executed(), 1);
    }

    #[test]
    fn test_out_of_order_pre_prepares_are_buffered() {
        let mut bus = Bus::new();
        let first = bus.cores[0].propose(proposal(b"A")).unwrap();
        let second = bus.cores[0].propose(proposal(b"B")).unwrap();
        let pre_prepare = |actions: &[Action]| {
            actions
                .iter()
                .find_map(|a| match a {
                    Action::Broadcast(m) if m.kind() == MessageKind::PrePrepare => Some(m.clone()),
                    _ => None,
                })
                .unwrap()
        };
        let (pp1, pp2) = (pre_prepare(&first), pre_prepare(&second));

        assert_eq!(bus.cores[1].on_pre_prepare(&pp2), Ok(Vec::new()));
        assert!(bus.cores[1].slot(2).is_none());

        let actions = bus.cores[1].on_pre_prepare(&pp1).unwrap();
        let timers: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::ArmSlotTimer { .. }))
            .collect();
        assert_eq!(timers.len(), 2);
        assert_eq!(bus.cores[1].slot(2).map(|s| s.phase), Some(SlotPhase::PrePrepared));
        assert_eq!(bus.cores[1].next_sequence(), 3);
    }

    #[test]
    fn test_conflicting_pre_prepare_is_rejected() {
        let mut bus = Bus::new();
        let a = proposal(b"A");
        let b = proposal(b"B");
        let leader = &bus.cores[0];
        let pp_a = leader.seal(1, leader.crypto.digest(&a.digest_bytes()), MessageBody::PrePrepare { proposal: a });
        let pp_b = leader.seal(1, leader.crypto.digest(&b.digest_bytes()), MessageBody::PrePrepare { proposal: b });

        assert!(bus.cores[1].on_pre_prepare(&pp_a).is_ok());
        assert_eq!(
            bus.cores[1].on_pre_prepare(&pp_b),
            Err(PbftError::ConflictingPrePrepare { sequence: 1 })
        );
        assert_eq!(bus.cores[1].on_pre_prepare(&pp_a), Ok(Vec::new()));
    }

    #[test]
    fn test_timeout_aborts_slot_and_suspends() {
        let mut bus = Bus::new();
        let actions = bus.cores[0].propose(proposal(b"P")).unwrap();
        bus.run(0, actions, &[0, 1]);

        let actions = bus.cores[1].on_timeout(0, 1);
        assert_eq!(
            actions,
            vec![
                Action::SuspendProcessing,
                Action::SuspectLeader { view: 0, sequence: 1 }
            ]
        );
        assert!(!bus.cores[1].is_active());
        assert!(bus.cores[1].slot(1).unwrap().aborted);
        assert!(bus.cores[1].on_timeout(0, 1).is_empty());
    }

    #[test]
    fn test_pre_prepare_outside_watermarks() {
        let bus = Bus::new();
        let leader = &bus.cores[0];
        let p = proposal(b"far");
        let pp = leader.seal(101, leader.crypto.digest(&p.digest_bytes()), MessageBody::PrePrepare { proposal: p });
        let mut replica = Bus::new().cores.remove(1);
        assert!(matches!(
            replica.on_pre_prepare(&pp),
            Err(PbftError::OutsideWatermarks { sequence: 101, .. })
        ));
    }

    #[test]
    fn test_garbage_collect_and_transfer_request() {
        let mut bus = Bus::new();
        let actions = bus.cores[0].propose(proposal(b"P")).unwrap();
        bus.run(0, actions, &[0, 1, 2, 3]);

        assert!(bus.cores[1].garbage_collect(1, Vec::new()).is_empty());
        assert!(bus.cores[1].slot(1).is_none());
        assert_eq!(bus.cores[1].low_watermark(), 1);

        let actions = bus.cores[1].garbage_collect(5, Vec::new());
        assert_eq!(actions, vec![Action::RequestStateTransfer { from: 2, to: 5 }]);
        assert_eq!(bus.cores[1].next_sequence(), 6);
    }

    #[test]
    fn test_apply_transferred_executes_in_order() {
        let mut bus = Bus::new();
        let decisions: Vec<Decision> = (1..=3)
            .map(|sequence| {
                let p = proposal(format!("d{}", sequence).as_bytes());
                Decision {
                    sequence,
                    view: 0,
                    digest: bus.cores[0].crypto.digest(&p.digest_bytes()),
                    proposal: p,
                    committed_at: 0,
                }
            })
            .collect();

        let mut shuffled = decisions.clone();
        shuffled.reverse();
        let actions = bus.cores[3].apply_transferred(shuffled);
        let executed: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Execute(d) => Some(d.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(executed, vec![1, 2, 3]);
        assert_eq!(bus.cores[3].last_executed(), 3);
        assert_eq!(bus.cores[3].next_sequence(), 4);
        assert!(bus.cores[3].apply_transferred(decisions).is_empty());
    }

    #[test]
    fn test_view_change_snapshot_carries_prepared_certificates() {
        let mut bus = Bus::new();
        let actions = bus.cores[0].propose(proposal(b"P")).unwrap();
        bus.run(0, actions, &[0, 1, 2, 3]);

        let snapshot = bus.cores[2].view_change_snapshot();
        assert_eq!(snapshot.last_committed, 1);
        assert_eq!(snapshot.prepared.len(), 1);
        let cert = &snapshot.prepared[0];
        assert_eq!(cert.phase, Phase::Prepare);
        assert!(cert.verify(bus.cores[2].crypto.as_ref(), bus.cores[2].roster(), 3));
    }

    #[test]
    fn test_second_quorum_halts_slot() {
        let mut bus = Bus::new();
        let a = Digest([1u8; 32]);
        let b = Digest([2u8; 32]);
        for i in 0..3 {
            let vote = bus.cores[i].seal(1, a, MessageBody::Prepare);
            assert!(bus.cores[3].on_vote(&vote).unwrap().is_empty());
        }
        for i in 0..2 {
            let vote = bus.cores[i].seal(1, b, MessageBody::Prepare);
            assert!(matches!(
                bus.cores[3].on_vote(&vote),
                Err(PbftError::Quorum(QuorumError::Equivocation { .. }))
            ));
        }

        let vote = bus.cores[2].seal(1, b, MessageBody::Prepare);
        let actions = bus.cores[3].on_vote(&vote).unwrap();
        assert!(matches!(actions.as_slice(), [Action::ConsistencyViolation(_)]));
        assert!(bus.cores[3].slot(1).unwrap().halted);

        let late = bus.cores[0].seal(1, a, MessageBody::Commit);
        assert_eq!(
            bus.cores[3].on_vote(&late),
            Err(PbftError::SlotHalted { sequence: 1 })
        );
    }
}
