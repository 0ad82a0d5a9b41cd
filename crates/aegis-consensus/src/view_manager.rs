// VIEW MANAGER
// Leader suspicion, view-change voting and NEW_VIEW installation.
//
//   STABLE(v) -> SUSPECT(v) -> VIEW_CHANGING(v+k) -> STABLE(v+k)
//
// SAFETY INVARIANTS:
// 1. The installed view never decreases
// 2. A view is installed only with 2f+1 signed VIEW_CHANGE votes behind it
// 3. Re-proposals are a pure function of the vote set, so every honest node
//    derives the same NEW_VIEW content from the same proof
// 4. When several candidate views reach quorum, the highest one wins
// 5. At most one pending vote per sender; a newer target replaces the older

use crate::action::{Action, InstalledView};
use crate::clock::Clock;
use crate::collaborators::Crypto;
use crate::message::{
    ConsensusMessage, MessageBody, MessageKind, NewViewProof, PreparedCertificate, Reproposal,
    SignedMessage, ViewChangeVote,
};
use crate::quorum::QuorumParams;
use crate::types::{Digest, NodeId, Proposal};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Leader of `view`: round-robin over the canonical roster.
pub fn leader_for(view: u64, roster: &[NodeId]) -> NodeId {
    if roster.is_empty() {
        return NodeId::new();
    }
    roster[(view % roster.len() as u64) as usize].clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewState {
    Stable(u64),

    /// The leader of this view missed a deadline
    Suspect(u64),

    /// Voting for this candidate view
    ViewChanging(u64),
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewState::Stable(v) => write!(f, "STABLE({})", v),
            ViewState::Suspect(v) => write!(f, "SUSPECT({})", v),
            ViewState::ViewChanging(v) => write!(f, "VIEW_CHANGING({})", v),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageKind),

    #[error("NEW_VIEW for view {view} from {sender}, expected leader {expected}")]
    UnauthorizedNewView {
        view: u64,
        sender: NodeId,
        expected: NodeId,
    },

    #[error("invalid NEW_VIEW proof: {0}")]
    InvalidProof(String),

    #[error("NEW_VIEW proof has {got} view-change votes, need {needed}")]
    InsufficientProof { got: usize, needed: usize },

    #[error("NEW_VIEW for view {view} does not match the recomputed re-proposals")]
    ReproposalMismatch { view: u64 },

    #[error("VIEW_CHANGE from {sender} claims state outside its proven checkpoint window")]
    UnsoundVote { sender: NodeId },
}

/// Outcome of recomputing re-proposals from a view-change quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReproposalPlan {
    pub reproposals: Vec<Reproposal>,
    pub next_sequence: u64,
    pub stable_checkpoint: u64,

    /// Signed CHECKPOINTs backing `stable_checkpoint`
    pub checkpoint_proof: Vec<SignedMessage>,
}

/// Derive the slots the leader of `view` must re-propose.
///
/// Only sound votes count: the claimed stable checkpoint carries a quorum of
/// signed CHECKPOINTs and every claim stays inside its watermark window.
/// Sequences in (max proven checkpoint, highest prepared sequence] take the
/// certificate from the highest view; sequences nobody prepared get a no-op.
/// Certificates that fail verification are ignored. The next sequence never
/// exceeds the high watermark of the chosen checkpoint.
pub fn compute_reproposals(
    view: u64,
    leader: &NodeId,
    votes: &[ViewChangeVote],
    crypto: &dyn Crypto,
    roster: &[NodeId],
    quorum: usize,
    watermark_window: u64,
) -> ReproposalPlan {
    let sound: Vec<&ViewChangeVote> = votes
        .iter()
        .filter(|vote| {
            let sound = vote.is_sound(crypto, roster, quorum, watermark_window);
            if !sound {
                debug!(
                    "Ignoring unsound view-change vote (checkpoint {}, last committed {})",
                    vote.stable_checkpoint, vote.last_committed
                );
            }
            sound
        })
        .collect();

    let anchor = sound.iter().max_by_key(|vote| vote.stable_checkpoint);
    let stable_checkpoint = anchor.map_or(0, |vote| vote.stable_checkpoint);
    let checkpoint_proof = anchor
        .map(|vote| vote.checkpoint_proof.clone())
        .unwrap_or_default();
    let high = stable_checkpoint.saturating_add(watermark_window);

    // f+1 reports reach at least one honest node.
    let mut committed: Vec<u64> = sound
        .iter()
        .map(|vote| vote.last_committed.min(high))
        .collect();
    committed.sort_unstable_by(|a, b| b.cmp(a));
    let weak_quorum = QuorumParams::for_nodes(roster.len()).weak_quorum;
    let vouched = committed
        .get(weak_quorum.saturating_sub(1))
        .copied()
        .unwrap_or(0);

    let mut chosen: BTreeMap<u64, &PreparedCertificate> = BTreeMap::new();
    for cert in sound.iter().flat_map(|vote| vote.prepared.iter()) {
        if cert.sequence <= stable_checkpoint || cert.sequence > high {
            continue;
        }
        if chosen
            .get(&cert.sequence)
            .map_or(false, |current| current.view >= cert.view)
        {
            continue;
        }
        if !cert.verify(crypto, roster, quorum) {
            debug!(
                "Ignoring unverifiable certificate for sequence {} in view-change proof",
                cert.sequence
            );
            continue;
        }
        chosen.insert(cert.sequence, cert);
    }

    let max_prepared = chosen.keys().next_back().copied().unwrap_or(stable_checkpoint);
    let reproposals = (stable_checkpoint.saturating_add(1)..=max_prepared)
        .map(|sequence| match chosen.get(&sequence) {
            Some(cert) => Reproposal {
                sequence,
                digest: cert.digest,
                proposal: cert.proposal.clone(),
            },
            None => {
                let proposal = Proposal::noop(leader, view, sequence);
                Reproposal {
                    sequence,
                    digest: crypto.digest(&proposal.digest_bytes()),
                    proposal,
                }
            }
        })
        .collect();

    let next_sequence = max_prepared
        .max(vouched)
        .max(stable_checkpoint)
        .saturating_add(1)
        .min(high.saturating_add(1));

    ReproposalPlan {
        reproposals,
        next_sequence,
        stable_checkpoint,
        checkpoint_proof,
    }
}

pub struct ViewManager {
    node_id: NodeId,
    roster: Vec<NodeId>,
    params: QuorumParams,
    crypto: Arc<dyn Crypto>,
    clock: Arc<dyn Clock>,
    watermark_window: u64,

    view: u64,
    state: ViewState,

    /// Candidate view -> sender -> signed VIEW_CHANGE
    votes: BTreeMap<u64, BTreeMap<NodeId, SignedMessage>>,

    /// Sender -> the candidate view of its one pending vote
    latest: BTreeMap<NodeId, u64>,

    /// Highest candidate view this node voted for
    voted_for: u64,

    /// Highest view this node issued NEW_VIEW for
    new_view_sent: u64,

    completed: u64,
}

impl ViewManager {
    pub fn new(
        node_id: NodeId,
        roster: Vec<NodeId>,
        crypto: Arc<dyn Crypto>,
        clock: Arc<dyn Clock>,
        watermark_window: u64,
    ) -> Self {
        let params = QuorumParams::for_nodes(roster.len());
        ViewManager {
            node_id,
            roster,
            params,
            crypto,
            clock,
            watermark_window,
            view: 0,
            state: ViewState::Stable(0),
            votes: BTreeMap::new(),
            latest: BTreeMap::new(),
            voted_for: 0,
            new_view_sent: 0,
            completed: 0,
        }
    }

    pub fn current_view(&self) -> u64 {
        self.view
    }

    pub fn leader(&self) -> NodeId {
        leader_for(self.view, &self.roster)
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn is_stable(&self) -> bool {
        matches!(self.state, ViewState::Stable(_))
    }

    /// Number of views installed since start.
    pub fn completed_view_changes(&self) -> u64 {
        self.completed
    }

    /// Buffered VIEW_CHANGE votes across all candidate views.
    pub fn pending_votes(&self) -> usize {
        self.votes.values().map(BTreeMap::len).sum()
    }

    /// Keep `signed` as the sender's pending vote unless it already voted
    /// for `target` or higher.
    fn record_vote(&mut self, target: u64, signed: SignedMessage) -> bool {
        let sender = signed.message.sender.clone();
        if let Some(&previous) = self.latest.get(&sender) {
            if previous >= target {
                return false;
            }
            if let Some(senders) = self.votes.get_mut(&previous) {
                senders.remove(&sender);
                if senders.is_empty() {
                    self.votes.remove(&previous);
                }
            }
        }
        self.latest.insert(sender.clone(), target);
        self.votes.entry(target).or_default().insert(sender, signed);
        true
    }

    /// The leader of the current view timed out on `sequence`.
    pub fn suspect<F>(&mut self, view: u64, sequence: u64, snapshot: F) -> Vec<Action>
    where
        F: FnOnce() -> ViewChangeVote,
    {
        if view != self.view || !self.is_stable() {
            return Vec::new();
        }
        self.state = ViewState::Suspect(view);
        warn!(
            "Suspecting leader {} of view {} (sequence {})",
            self.leader(),
            view,
            sequence
        );
        self.start_view_change(view.saturating_add(1), snapshot())
    }

    /// Proactive rotation: vote for the next view while stable.
    pub fn rotate<F>(&mut self, snapshot: F) -> Vec<Action>
    where
        F: FnOnce() -> ViewChangeVote,
    {
        let ViewState::Stable(view) = self.state else {
            return Vec::new();
        };
        info!("Proactive leader rotation away from view {}", view);
        self.start_view_change(view.saturating_add(1), snapshot())
    }

    /// No NEW_VIEW arrived for `target` in time; move on to the next candidate.
    pub fn on_view_change_timeout<F>(&mut self, target: u64, snapshot: F) -> Vec<Action>
    where
        F: FnOnce() -> ViewChangeVote,
    {
        if self.state != ViewState::ViewChanging(target) || self.view >= target {
            return Vec::new();
        }
        let next = target.saturating_add(1);
        warn!("View change to {} timed out, trying view {}", target, next);
        self.start_view_change(next, snapshot())
    }

    fn start_view_change(&mut self, target: u64, vote: ViewChangeVote) -> Vec<Action> {
        if target <= self.view {
            return Vec::new();
        }
        if let ViewState::ViewChanging(candidate) = self.state {
            if candidate >= target {
                return Vec::new();
            }
        }
        self.voted_for = self.voted_for.max(target);
        self.state = ViewState::ViewChanging(target);
        info!(
            "Voting for view {} (last committed {}, {} prepared certificates)",
            target,
            vote.last_committed,
            vote.prepared.len()
        );

        let message = ConsensusMessage::new(
            target,
            vote.last_committed,
            Digest::ZERO,
            self.node_id.clone(),
            self.clock.now_millis(),
            MessageBody::ViewChange(vote),
        );
        let signed = SignedMessage::seal(message, self.crypto.as_ref());
        self.record_vote(target, signed.clone());

        let mut actions = vec![
            Action::SuspendProcessing,
            Action::Broadcast(signed),
            Action::ArmViewChangeTimer { view: target },
        ];
        actions.extend(self.check_quorum());
        actions
    }

    /// Handle a VIEW_CHANGE vote with an already verified signature.
    pub fn on_view_change<F>(
        &mut self,
        signed: &SignedMessage,
        snapshot: F,
    ) -> Result<Vec<Action>, ViewError>
    where
        F: FnOnce() -> ViewChangeVote,
    {
        let message = &signed.message;
        let MessageBody::ViewChange(vote) = &message.body else {
            return Err(ViewError::UnexpectedMessage(message.kind()));
        };
        let target = message.view;
        if target <= self.view {
            return Ok(Vec::new());
        }
        if !vote.is_sound(
            self.crypto.as_ref(),
            &self.roster,
            self.params.quorum,
            self.watermark_window,
        ) {
            warn!(
                "Rejecting VIEW_CHANGE for {} from {}: checkpoint {} unproven or claims out of window",
                target, message.sender, vote.stable_checkpoint
            );
            return Err(ViewError::UnsoundVote {
                sender: message.sender.clone(),
            });
        }
        if !self.record_vote(target, signed.clone()) {
            return Ok(Vec::new());
        }
        debug!(
            "VIEW_CHANGE for {} from {} ({} votes)",
            target,
            message.sender,
            self.votes.get(&target).map_or(0, BTreeMap::len)
        );

        let mut actions = Vec::new();

        // f+1 nodes want a view above ours: at least one honest node timed out.
        let floor = self.view.max(self.voted_for);
        let ahead: BTreeSet<&NodeId> = self
            .votes
            .range(floor.saturating_add(1)..)
            .flat_map(|(_, senders)| senders.keys())
            .collect();
        if ahead.len() >= self.params.weak_quorum {
            let join = self
                .votes
                .range(floor.saturating_add(1)..)
                .find(|(_, senders)| !senders.is_empty())
                .map(|(view, _)| *view);
            if let Some(join) = join {
                info!("Joining view change to {} ({} nodes ahead)", join, ahead.len());
                actions.extend(self.start_view_change(join, snapshot()));
            }
        }

        actions.extend(self.check_quorum());
        Ok(actions)
    }

    /// Issue NEW_VIEW if this node leads the highest candidate view with quorum.
    fn check_quorum(&mut self) -> Vec<Action> {
        let quorum = self.params.quorum;
        let Some(target) = self
            .votes
            .range(self.view.saturating_add(1)..)
            .rev()
            .find(|(_, senders)| senders.len() >= quorum)
            .map(|(view, _)| *view)
        else {
            return Vec::new();
        };

        let leader = leader_for(target, &self.roster);
        if leader != self.node_id || self.new_view_sent >= target {
            return Vec::new();
        }

        let proof_votes: Vec<SignedMessage> = self
            .votes
            .get(&target)
            .map(|senders| senders.values().take(quorum).cloned().collect())
            .unwrap_or_default();
        let bodies: Vec<ViewChangeVote> = proof_votes
            .iter()
            .filter_map(|signed| match &signed.message.body {
                MessageBody::ViewChange(vote) => Some(vote.clone()),
                _ => None,
            })
            .collect();
        let plan = compute_reproposals(
            target,
            &leader,
            &bodies,
            self.crypto.as_ref(),
            &self.roster,
            quorum,
            self.watermark_window,
        );

        info!(
            "Issuing NEW_VIEW for view {} with {} re-proposals",
            target,
            plan.reproposals.len()
        );
        let message = ConsensusMessage::new(
            target,
            plan.next_sequence,
            Digest::ZERO,
            self.node_id.clone(),
            self.clock.now_millis(),
            MessageBody::NewView(NewViewProof {
                view_changes: proof_votes,
                reproposals: plan.reproposals.clone(),
                next_sequence: plan.next_sequence,
            }),
        );
        self.new_view_sent = target;

        let mut actions = vec![Action::Broadcast(SignedMessage::seal(
            message,
            self.crypto.as_ref(),
        ))];
        actions.extend(self.install(target, plan));
        actions
    }

    /// Verify a NEW_VIEW and install it.
    pub fn on_new_view(&mut self, signed: &SignedMessage) -> Result<Vec<Action>, ViewError> {
        let message = &signed.message;
        let MessageBody::NewView(proof) = &message.body else {
            return Err(ViewError::UnexpectedMessage(message.kind()));
        };
        let target = message.view;
        if target <= self.view {
            return Ok(Vec::new());
        }
        let expected = leader_for(target, &self.roster);
        if message.sender != expected {
            return Err(ViewError::UnauthorizedNewView {
                view: target,
                sender: message.sender.clone(),
                expected,
            });
        }

        let mut signers = BTreeSet::new();
        let mut bodies = Vec::with_capacity(proof.view_changes.len());
        for vote in &proof.view_changes {
            let MessageBody::ViewChange(body) = &vote.message.body else {
                return Err(ViewError::InvalidProof(format!(
                    "embedded {} message",
                    vote.kind().as_str()
                )));
            };
            if vote.message.view != target {
                return Err(ViewError::InvalidProof(format!(
                    "vote from {} is for view {}",
                    vote.sender(),
                    vote.message.view
                )));
            }
            if !body.is_sound(
                self.crypto.as_ref(),
                &self.roster,
                self.params.quorum,
                self.watermark_window,
            ) {
                return Err(ViewError::InvalidProof(format!(
                    "unsound vote from {}",
                    vote.sender()
                )));
            }
            if !self.roster.contains(vote.sender()) {
                return Err(ViewError::InvalidProof(format!(
                    "vote from unknown node {}",
                    vote.sender()
                )));
            }
            if !signers.insert(vote.sender().clone()) {
                return Err(ViewError::InvalidProof(format!(
                    "duplicate vote from {}",
                    vote.sender()
                )));
            }
            if !vote.verify(self.crypto.as_ref()) {
                return Err(ViewError::InvalidProof(format!(
                    "bad signature from {}",
                    vote.sender()
                )));
            }
            bodies.push(body.clone());
        }
        if signers.len() < self.params.quorum {
            return Err(ViewError::InsufficientProof {
                got: signers.len(),
                needed: self.params.quorum,
            });
        }

        let plan = compute_reproposals(
            target,
            &expected,
            &bodies,
            self.crypto.as_ref(),
            &self.roster,
            self.params.quorum,
            self.watermark_window,
        );
        if plan.reproposals != proof.reproposals || plan.next_sequence != proof.next_sequence {
            warn!("NEW_VIEW for {} from {} failed re-proposal check", target, expected);
            return Err(ViewError::ReproposalMismatch { view: target });
        }
        Ok(self.install(target, plan))
    }

    fn install(&mut self, view: u64, plan: ReproposalPlan) -> Vec<Action> {
        self.view = view;
        self.state = ViewState::Stable(view);
        self.voted_for = self.voted_for.max(view);
        self.completed += 1;
        self.votes = self.votes.split_off(&view.saturating_add(1));
        self.latest.retain(|_, target| *target > view);

        let leader = leader_for(view, &self.roster);
        info!("Installed view {} with leader {}", view, leader);
        vec![Action::InstallView(InstalledView {
            view,
            leader,
            reproposals: plan.reproposals,
            next_sequence: plan.next_sequence,
            stable_checkpoint: plan.stable_checkpoint,
            checkpoint_proof: plan.checkpoint_proof,
        })]
    }
}
