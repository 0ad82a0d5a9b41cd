// CONSENSUS ENGINE
// Per-node orchestration: the public API, the inbound boundary and the actor
// task that owns all protocol state.
//
// SAFETY INVARIANTS:
// 1. Slot, view and checkpoint state are mutated only by the actor task
// 2. Frames that fail decoding, membership or signature checks never reach
//    the actor
// 3. Decision handlers fire once per sequence, in ascending sequence order
// 4. stop() cancels every timer and drops slots below commit quorum

use crate::action::{Action, InstalledView};
use crate::checkpoint::CheckpointTracker;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{Crypto, LoggingStateTransfer, NodeRoster, StateTransfer, Transport};
use crate::computation_gate::{ComputationChallenge, ComputationGate};
use crate::config::ConsensusConfig;
use crate::decision_log::DecisionLog;
use crate::error::{ConfigError, ConsensusError};
use crate::message::{ConsensusMessage, MessageBody, MessageKind, SignedMessage};
use crate::pbft::{PbftCore, PbftError};
use crate::quorum::QuorumParams;
use crate::status::{BoundaryCounters, EngineStatus, ProposalOutcome};
use crate::types::{Decision, Digest, Node, NodeId, Proposal, ProposalId};
use crate::view_manager::{leader_for, ViewManager};
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};

/// Messages for views this node has not installed yet, kept for replay.
const FUTURE_VIEW_BUFFER: usize = 1024;
const FUTURE_VIEW_PER_SENDER: usize = 64;

/// Callback receiving `(sequence, payload)` for every committed decision.
pub type DecisionHandler = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

/// The collaborators an engine is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub crypto: Arc<dyn Crypto>,
    pub roster: Arc<dyn NodeRoster>,
    pub state_transfer: Arc<dyn StateTransfer>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn Crypto>,
        roster: Arc<dyn NodeRoster>,
    ) -> Self {
        Collaborators {
            transport,
            crypto,
            roster,
            state_transfer: Arc::new(LoggingStateTransfer),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_state_transfer(mut self, state_transfer: Arc<dyn StateTransfer>) -> Self {
        self.state_transfer = state_transfer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

enum Event {
    Inbound(SignedMessage),
    Submit(Proposal),
    InstallDecisions(Vec<Decision>),
}

/// State read by API callers and written by the actor.
struct Shared {
    status: RwLock<EngineStatus>,
    log: RwLock<DecisionLog>,
    handlers: RwLock<Vec<DecisionHandler>>,
    outcomes: RwLock<HashMap<ProposalId, ProposalOutcome>>,
    inbox: RwLock<Option<mpsc::Sender<Event>>>,
    counters: BoundaryCounters,
}

/// Cloneable receive path handed to the transport.
#[derive(Clone)]
pub struct InboundHandle {
    shared: Arc<Shared>,
    crypto: Arc<dyn Crypto>,
    members: Arc<HashSet<NodeId>>,
}

impl InboundHandle {
    /// Decode, authenticate and enqueue a raw frame.
    pub fn handle_incoming(&self, bytes: &[u8]) -> Result<(), ConsensusError> {
        let counters = &self.shared.counters;
        let signed = match SignedMessage::decode(bytes) {
            Ok(signed) => signed,
            Err(e) => {
                BoundaryCounters::bump(&counters.malformed);
                debug!("Dropped malformed frame ({} bytes): {}", bytes.len(), e);
                return Err(e);
            }
        };
        if !self.members.contains(signed.sender()) {
            BoundaryCounters::bump(&counters.unknown_sender);
            warn!("Dropped {} from unknown sender {}", signed.kind(), signed.sender());
            return Err(ConsensusError::UnknownSender {
                sender: signed.sender().clone(),
            });
        }
        if !signed.verify(self.crypto.as_ref()) {
            BoundaryCounters::bump(&counters.invalid_signature);
            warn!("Dropped {} with invalid signature from {}", signed.kind(), signed.sender());
            return Err(ConsensusError::InvalidSignature {
                sender: signed.sender().clone(),
            });
        }

        match self.enqueue(Event::Inbound(signed)) {
            Ok(()) => Ok(()),
            Err(ConsensusError::QueueFull) => {
                BoundaryCounters::bump(&counters.queue_full);
                Err(ConsensusError::QueueFull)
            }
            Err(e) => {
                BoundaryCounters::bump(&counters.engine_stopped);
                Err(e)
            }
        }
    }

    fn enqueue(&self, event: Event) -> Result<(), ConsensusError> {
        let inbox = self.shared.inbox.read();
        let Some(sender) = inbox.as_ref() else {
            return Err(ConsensusError::EngineStopped);
        };
        sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConsensusError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConsensusError::EngineStopped,
        })
    }
}

/// Future-view messages in arrival order. A full buffer evicts the oldest
/// message of the sender holding the most, so one peer cannot push out
/// everyone else's.
struct FutureBuffer {
    messages: VecDeque<SignedMessage>,
    capacity: usize,
    per_sender: usize,
}

impl FutureBuffer {
    fn new(capacity: usize, per_sender: usize) -> Self {
        FutureBuffer {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
            per_sender: per_sender.max(1),
        }
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn held_by(&self, sender: &NodeId) -> usize {
        self.messages.iter().filter(|m| m.sender() == sender).count()
    }

    fn push(&mut self, signed: SignedMessage) {
        let victim = if self.held_by(signed.sender()) >= self.per_sender {
            Some(signed.sender().clone())
        } else if self.messages.len() >= self.capacity {
            let mut counts: HashMap<&NodeId, usize> = HashMap::new();
            for held in &self.messages {
                *counts.entry(held.sender()).or_default() += 1;
            }
            counts
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(sender, _)| sender.clone())
        } else {
            None
        };
        if let Some(victim) = victim {
            if let Some(position) = self.messages.iter().position(|m| *m.sender() == victim) {
                self.messages.remove(position);
            }
        }
        self.messages.push_back(signed);
    }

    /// Remove and return every message for `view` or lower.
    fn take_through(&mut self, view: u64) -> Vec<SignedMessage> {
        let (ready, later): (Vec<SignedMessage>, Vec<SignedMessage>) = self
            .messages
            .drain(..)
            .partition(|signed| signed.message.view <= view);
        self.messages = later.into();
        ready
    }

    fn clear(&mut self) {
        self.messages.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    Slot { view: u64, sequence: u64 },
    Request { view: u64, digest: Digest },
    ViewChange { target: u64 },
    Rotation,
}

/// Owns every piece of protocol state. Runs as one task per node.
struct NodeActor {
    node_id: NodeId,
    config: ConsensusConfig,
    params: QuorumParams,
    roster: Vec<NodeId>,

    core: PbftCore,
    views: ViewManager,
    checkpoints: CheckpointTracker,

    gate: Arc<ComputationGate>,
    crypto: Arc<dyn Crypto>,
    transport: Arc<dyn Transport>,
    state_transfer: Arc<dyn StateTransfer>,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,

    timers: DelayQueue<TimerKey>,
    timer_keys: HashMap<TimerKey, delay_queue::Key>,

    /// Requests not yet bound to a slot, in arrival order
    pending: VecDeque<(Digest, Proposal)>,
    future: FutureBuffer,
    replies: HashMap<ProposalId, BTreeSet<NodeId>>,
    suspected: HashSet<NodeId>,

    timeouts: u64,
    violations: Vec<String>,
}

impl NodeActor {
    async fn run(mut self, mut inbox: mpsc::Receiver<Event>, cancel: CancellationToken) -> Self {
        info!("Consensus actor for {} started at view {}", self.node_id, self.views.current_view());
        if let Some(period) = self.config.leader_rotation_duration() {
            self.arm(TimerKey::Rotation, period);
        }
        self.publish_status(true);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                Some(expired) = self.timers.next() => self.on_timer(expired.into_inner()),
            }
            self.publish_status(true);
        }

        self.timers.clear();
        self.timer_keys.clear();
        info!("Consensus actor for {} stopped", self.node_id);
        self
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Inbound(signed) => self.dispatch(signed),
            Event::Submit(proposal) => self.on_submit(proposal),
            Event::InstallDecisions(decisions) => {
                info!("Installing {} transferred decisions", decisions.len());
                let actions = self.core.apply_transferred(decisions);
                self.apply(actions);
            }
        }
    }

    fn dispatch(&mut self, signed: SignedMessage) {
        let kind = signed.kind();
        match kind {
            MessageKind::PrePrepare | MessageKind::Prepare | MessageKind::Commit => {
                self.dispatch_slot_message(signed, kind)
            }
            _ => self.dispatch_control(&signed),
        }
    }

    fn dispatch_slot_message(&mut self, signed: SignedMessage, kind: MessageKind) {
        if signed.message.view > self.core.view() {
            self.buffer_future(signed);
            return;
        }
        let result = if kind == MessageKind::PrePrepare {
            self.core.on_pre_prepare(&signed)
        } else {
            self.core.on_vote(&signed)
        };
        match result {
            Ok(actions) => self.apply(actions),
            Err(e) if matches!(e, PbftError::StaleView { .. } | PbftError::Suspended) => {
                debug!("Ignored {} from {}: {}", kind, signed.sender(), e);
            }
            Err(e) => warn!("Rejected {} from {}: {}", kind, signed.sender(), e),
        }
    }

    fn dispatch_control(&mut self, signed: &SignedMessage) {
        let message = &signed.message;
        match &message.body {
            MessageBody::Request { proposal } => {
                let proposal = proposal.clone();
                self.on_request(signed, proposal);
            }
            MessageBody::PrePrepare { .. } | MessageBody::Prepare | MessageBody::Commit => {
                debug!("Slot message routed as control message");
            }
            MessageBody::Reply { proposal_id } => {
                let (sender, sequence) = (message.sender.clone(), message.sequence);
                let proposal_id = proposal_id.clone();
                self.on_reply(&sender, &proposal_id, sequence);
            }
            MessageBody::Checkpoint => {
                let actions = self.on_checkpoint(signed);
                self.apply(actions);
            }
            MessageBody::Solution { challenge_id, nonce } => {
                if !self.gate.verify_solution(&message.sender, challenge_id, *nonce) {
                    debug!("Solution from {} for {} not credited", message.sender, challenge_id);
                }
            }
            MessageBody::ViewChange(_) => {
                let core = &self.core;
                match self
                    .views
                    .on_view_change(signed, || core.view_change_snapshot())
                {
                    Ok(actions) => self.apply(actions),
                    Err(e) => warn!("Rejected VIEW_CHANGE from {}: {}", signed.sender(), e),
                }
            }
            MessageBody::NewView(_) => match self.views.on_new_view(signed) {
                Ok(actions) => self.apply(actions),
                Err(e) => warn!("Rejected NEW_VIEW from {}: {}", signed.sender(), e),
            },
        }
    }

    fn buffer_future(&mut self, signed: SignedMessage) {
        debug!(
            "Buffering {} for view {} (current view {}, {} buffered)",
            signed.kind(),
            signed.message.view,
            self.core.view(),
            self.future.len()
        );
        self.future.push(signed);
    }

    fn can_propose(&self) -> bool {
        self.core.is_leader() && self.core.is_active() && self.views.is_stable()
    }

    fn on_submit(&mut self, proposal: Proposal) {
        let digest = self.crypto.digest(&proposal.digest_bytes());
        if self.can_propose() {
            match self.core.propose(proposal.clone()) {
                Ok(actions) => {
                    // Kept until executed so a view change can re-forward it.
                    self.pending.push_back((digest, proposal));
                    self.apply(actions);
                    return;
                }
                Err(e) => warn!("Deferring proposal {}: {}", proposal.id, e),
            }
        } else if !self.core.is_leader() {
            let request = self.seal(
                self.core.view(),
                0,
                digest,
                MessageBody::Request {
                    proposal: proposal.clone(),
                },
            );
            debug!("Forwarding proposal {} to leader {}", proposal.id, self.core.leader());
            self.broadcast(&request);
        }
        self.add_pending(digest, proposal);
    }

    fn on_request(&mut self, signed: &SignedMessage, proposal: Proposal) {
        let digest = self.crypto.digest(&proposal.digest_bytes());
        if digest != signed.message.digest || proposal.proposer != *signed.sender() || proposal.noop {
            warn!("Rejected REQUEST from {}: proposal does not match envelope", signed.sender());
            return;
        }
        if self.shared.log.read().sequence_of(&proposal.id).is_some() || self.core.knows_digest(&digest) {
            return;
        }
        if self.can_propose() {
            match self.core.propose(proposal.clone()) {
                Ok(actions) => {
                    self.pending.push_back((digest, proposal));
                    self.apply(actions);
                    return;
                }
                Err(e) => warn!("Deferring request {}: {}", proposal.id, e),
            }
        }
        self.add_pending(digest, proposal);
    }

    fn add_pending(&mut self, digest: Digest, proposal: Proposal) {
        if self.pending.iter().any(|(d, _)| *d == digest) || self.core.knows_digest(&digest) {
            return;
        }
        if !self.core.is_leader() {
            let key = TimerKey::Request {
                view: self.core.view(),
                digest,
            };
            self.arm(key, self.config.pbft_timeout_duration());
        }
        self.pending.push_back((digest, proposal));
    }

    fn on_timer(&mut self, key: TimerKey) {
        self.timer_keys.remove(&key);
        match key {
            TimerKey::Slot { view, sequence } => {
                let actions = self.core.on_timeout(view, sequence);
                if !actions.is_empty() {
                    self.timeouts += 1;
                }
                self.apply(actions);
            }
            TimerKey::Request { view, digest } => {
                if view != self.views.current_view() || !self.views.is_stable() {
                    return;
                }
                if self.core.knows_digest(&digest) || !self.pending.iter().any(|(d, _)| *d == digest) {
                    return;
                }
                self.timeouts += 1;
                warn!(
                    "Request {} was not ordered by leader {} in view {}",
                    digest.short(),
                    self.core.leader(),
                    view
                );
                self.apply(vec![
                    Action::SuspendProcessing,
                    Action::SuspectLeader {
                        view,
                        sequence: self.core.next_sequence(),
                    },
                ]);
            }
            TimerKey::ViewChange { target } => {
                let core = &self.core;
                let actions = self
                    .views
                    .on_view_change_timeout(target, || core.view_change_snapshot());
                if !actions.is_empty() {
                    self.timeouts += 1;
                }
                self.apply(actions);
            }
            TimerKey::Rotation => {
                let core = &self.core;
                let actions = self.views.rotate(|| core.view_change_snapshot());
                self.apply(actions);
                if let Some(period) = self.config.leader_rotation_duration() {
                    self.arm(TimerKey::Rotation, period);
                }
            }
        }
    }

    /// Perform actions in order, including the ones they produce.
    fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Broadcast(message) => self.broadcast(&message),
                Action::ArmSlotTimer { view, sequence } => {
                    self.arm(TimerKey::Slot { view, sequence }, self.config.pbft_timeout_duration());
                }
                Action::ArmViewChangeTimer { view } => {
                    self.arm(
                        TimerKey::ViewChange { target: view },
                        self.config.view_change_timeout_duration(),
                    );
                }
                Action::Execute(decision) => queue.extend(self.execute(decision)),
                Action::SuspectLeader { view, sequence } => {
                    if view == self.views.current_view() {
                        self.suspected.insert(self.views.leader());
                    }
                    let core = &self.core;
                    queue.extend(
                        self.views
                            .suspect(view, sequence, || core.view_change_snapshot()),
                    );
                }
                Action::SuspendProcessing => self.core.suspend(),
                Action::InstallView(installed) => self.install_view(installed),
                Action::RequestStateTransfer { from, to } => {
                    info!("Requesting state transfer for sequences [{}, {}]", from, to);
                    self.state_transfer.request_range(from, to);
                }
                Action::ConsistencyViolation(reason) => self.record_violation(reason),
            }
        }
    }

    fn install_view(&mut self, installed: InstalledView) {
        let view = installed.view;
        self.cancel_timers(|key| match key {
            TimerKey::Slot { .. } | TimerKey::Request { .. } => true,
            TimerKey::ViewChange { target } => *target <= view,
            TimerKey::Rotation => false,
        });

        if self
            .checkpoints
            .adopt(installed.stable_checkpoint, &installed.checkpoint_proof)
        {
            info!("Adopted stable checkpoint {} from view {}", installed.stable_checkpoint, view);
        }
        let actions = self.core.install_view(&installed);
        self.apply(actions);

        {
            let log = self.shared.log.read();
            self.pending
                .retain(|(_, proposal)| log.sequence_of(&proposal.id).is_none());
        }
        let pending: Vec<(Digest, Proposal)> = self.pending.iter().cloned().collect();
        for (digest, proposal) in pending {
            if self.core.knows_digest(&digest) {
                continue;
            }
            if self.can_propose() {
                match self.core.propose(proposal) {
                    Ok(actions) => self.apply(actions),
                    Err(e) => warn!("Could not re-propose pending request {}: {}", digest.short(), e),
                }
            } else {
                if proposal.proposer == self.node_id {
                    let request = self.seal(view, 0, digest, MessageBody::Request { proposal });
                    self.broadcast(&request);
                }
                self.arm(TimerKey::Request { view, digest }, self.config.pbft_timeout_duration());
            }
        }

        for signed in self.future.take_through(view) {
            if signed.message.view == view {
                self.dispatch(signed);
            }
        }
    }

    fn execute(&mut self, decision: Decision) -> Vec<Action> {
        self.cancel_timer(&TimerKey::Slot {
            view: decision.view,
            sequence: decision.sequence,
        });
        let digest = decision.digest;
        self.cancel_timers(|key| matches!(key, TimerKey::Request { digest: d, .. } if *d == digest));
        self.pending.retain(|(d, _)| *d != digest);

        if !self.shared.log.write().append(decision.clone()) {
            debug!("Decision {} already archived", decision.sequence);
            return Vec::new();
        }
        let handlers = self.shared.handlers.read().clone();
        for handler in handlers.iter() {
            handler(decision.sequence, decision.payload());
        }
        if leader_for(decision.view, &self.roster) != self.node_id {
            self.suspected.remove(&leader_for(decision.view, &self.roster));
        }
        info!(
            "Executed sequence {} ({}{})",
            decision.sequence,
            decision.digest.short(),
            if decision.is_noop() { ", no-op" } else { "" }
        );

        let mut actions = Vec::new();
        if let Some((sequence, state)) = self
            .checkpoints
            .record_execution(&decision, self.crypto.as_ref())
        {
            let checkpoint = self.seal(self.core.view(), sequence, state, MessageBody::Checkpoint);
            self.broadcast(&checkpoint);
            actions.extend(self.on_checkpoint(&checkpoint));
        }

        if !decision.is_noop() {
            let proposal_id = decision.proposal.id.clone();
            if decision.proposal.proposer == self.node_id {
                let own = self.node_id.clone();
                self.on_reply(&own, &proposal_id, decision.sequence);
            } else {
                let reply = self.seal(
                    self.core.view(),
                    decision.sequence,
                    decision.digest,
                    MessageBody::Reply { proposal_id },
                );
                match reply.encode() {
                    Ok(bytes) => self.transport.send(&decision.proposal.proposer, bytes),
                    Err(e) => error!("Failed to encode REPLY: {}", e),
                }
            }
        }
        actions
    }

    fn on_checkpoint(&mut self, signed: &SignedMessage) -> Vec<Action> {
        let Some(stable) = self.checkpoints.on_checkpoint(signed) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        if self.checkpoints.diverges_from_stable() {
            actions.push(Action::ConsistencyViolation(format!(
                "local state at checkpoint {} diverges from the stable digest {}",
                stable,
                self.checkpoints.stable_digest().short()
            )));
        }
        let proof = self.checkpoints.stable_proof().to_vec();
        actions.extend(self.core.garbage_collect(stable, proof));
        actions
    }

    fn on_reply(&mut self, sender: &NodeId, proposal_id: &ProposalId, sequence: u64) {
        let mut outcomes = self.shared.outcomes.write();
        let Some(outcome) = outcomes.get_mut(proposal_id) else {
            return;
        };
        if matches!(outcome, ProposalOutcome::Confirmed { .. }) {
            return;
        }
        let replies = self.replies.entry(proposal_id.clone()).or_default();
        replies.insert(sender.clone());
        if replies.len() >= self.params.weak_quorum {
            *outcome = ProposalOutcome::Confirmed {
                sequence,
                replies: replies.len(),
            };
            self.replies.remove(proposal_id);
            info!("Proposal {} confirmed at sequence {}", proposal_id, sequence);
        } else if *sender == self.node_id {
            *outcome = ProposalOutcome::Committed { sequence };
        }
    }

    fn record_violation(&mut self, reason: String) {
        error!("CONSISTENCY VIOLATION on {}: {}", self.node_id, reason);
        self.violations.push(reason);
    }

    fn seal(&self, view: u64, sequence: u64, digest: Digest, body: MessageBody) -> SignedMessage {
        let message = ConsensusMessage::new(
            view,
            sequence,
            digest,
            self.node_id.clone(),
            self.clock.now_millis(),
            body,
        );
        SignedMessage::seal(message, self.crypto.as_ref())
    }

    fn broadcast(&self, message: &SignedMessage) {
        match message.encode() {
            Ok(bytes) => self.transport.broadcast(bytes),
            Err(e) => error!("Failed to encode {}: {}", message.kind(), e),
        }
    }

    fn arm(&mut self, key: TimerKey, after: Duration) {
        if self.timer_keys.contains_key(&key) {
            return;
        }
        let handle = self.timers.insert(key, after);
        self.timer_keys.insert(key, handle);
    }

    fn cancel_timer(&mut self, key: &TimerKey) {
        if let Some(handle) = self.timer_keys.remove(key) {
            self.timers.remove(&handle);
        }
    }

    fn cancel_timers<F>(&mut self, doomed: F)
    where
        F: Fn(&TimerKey) -> bool,
    {
        let keys: Vec<TimerKey> = self.timer_keys.keys().filter(|k| doomed(*k)).copied().collect();
        for key in keys {
            self.cancel_timer(&key);
        }
    }

    fn discard_in_flight(&mut self) {
        self.core.discard_in_flight();
        self.pending.clear();
        self.future.clear();
        self.timers.clear();
        self.timer_keys.clear();
    }

    fn publish_status(&self, running: bool) {
        let scores = self.gate.scores_snapshot();
        let known_nodes = self
            .roster
            .iter()
            .map(|id| Node {
                id: id.clone(),
                public_key: self.crypto.public_key(id).map(hex::encode),
                computation_score: scores.get(id).copied().unwrap_or(0.0),
                suspected_faulty: self.suspected.contains(id),
            })
            .collect();
        let last_committed = self.shared.log.read().last_committed();
        let rejections = self.shared.counters.snapshot();

        let mut status = self.shared.status.write();
        *status = EngineStatus {
            node_id: self.node_id.clone(),
            running,
            view: self.views.current_view(),
            leader: self.views.leader(),
            view_state: self.views.state().to_string(),
            phase: self.core.active_phase().as_str().to_string(),
            last_committed_sequence: last_committed,
            stable_checkpoint: self
                .checkpoints
                .stable_sequence()
                .max(self.core.low_watermark()),
            known_nodes,
            phase_histogram: self.core.histogram(),
            quorum_size: self.params.quorum,
            fault_tolerance: self.params.f,
            pending_requests: self.pending.len(),
            timeouts: self.timeouts,
            view_changes: self.views.completed_view_changes(),
            rejections,
            consistency_violations: self.violations.clone(),
        };
    }
}

#[derive(Default)]
struct Lifecycle {
    actor: Option<NodeActor>,
    task: Option<JoinHandle<NodeActor>>,
    ticker: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

/// One consensus participant.
pub struct ConsensusEngine {
    node_id: NodeId,
    config: ConsensusConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<ComputationGate>,
    crypto: Arc<dyn Crypto>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    inbound: InboundHandle,
    challenges: broadcast::Sender<ComputationChallenge>,
    lifecycle: Mutex<Lifecycle>,
}

impl ConsensusEngine {
    pub fn new(
        node_id: impl Into<NodeId>,
        config: ConsensusConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConsensusError> {
        let node_id = node_id.into();
        config.validate()?;

        let roster = collaborators.roster.known_nodes();
        if roster.is_empty() {
            return Err(ConfigError::EmptyRoster.into());
        }
        if !roster.contains(&node_id) {
            return Err(ConfigError::NodeNotInRoster(node_id).into());
        }
        config.check_roster_size(roster.len());

        let params = QuorumParams::for_nodes(roster.len());
        let Collaborators {
            transport,
            crypto,
            state_transfer,
            clock,
            ..
        } = collaborators;

        let gate = Arc::new(ComputationGate::new(
            config.computation.clone(),
            config.poc_interval,
            config.min_computation_score,
            roster.len(),
            clock.clone(),
        ));
        let core = PbftCore::new(
            node_id.clone(),
            roster.clone(),
            crypto.clone(),
            gate.clone(),
            clock.clone(),
            config.watermark_window,
        );
        let views = ViewManager::new(
            node_id.clone(),
            roster.clone(),
            crypto.clone(),
            clock.clone(),
            config.watermark_window,
        );
        let checkpoints = CheckpointTracker::new(
            config.checkpoint_interval,
            params.quorum,
            config.watermark_window,
        );

        let status = EngineStatus::initial(
            node_id.clone(),
            leader_for(0, &roster),
            Vec::new(),
            params.quorum,
            params.f,
        );
        let shared = Arc::new(Shared {
            status: RwLock::new(status),
            log: RwLock::new(DecisionLog::new()),
            handlers: RwLock::new(Vec::new()),
            outcomes: RwLock::new(HashMap::new()),
            inbox: RwLock::new(None),
            counters: BoundaryCounters::default(),
        });
        let inbound = InboundHandle {
            shared: shared.clone(),
            crypto: crypto.clone(),
            members: Arc::new(roster.iter().cloned().collect()),
        };

        let actor = NodeActor {
            node_id: node_id.clone(),
            config: config.clone(),
            params,
            roster,
            core,
            views,
            checkpoints,
            gate: gate.clone(),
            crypto: crypto.clone(),
            transport: transport.clone(),
            state_transfer,
            clock: clock.clone(),
            shared: shared.clone(),
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            pending: VecDeque::new(),
            future: FutureBuffer::new(FUTURE_VIEW_BUFFER, FUTURE_VIEW_PER_SENDER),
            replies: HashMap::new(),
            suspected: HashSet::new(),
            timeouts: 0,
            violations: Vec::new(),
        };
        actor.publish_status(false);

        let (challenges, _) = broadcast::channel(16);
        info!(
            "Consensus engine {} created (n={}, f={}, quorum={})",
            node_id, params.n, params.f, params.quorum
        );
        Ok(ConsensusEngine {
            node_id,
            config,
            clock,
            gate,
            crypto,
            transport,
            shared,
            inbound,
            challenges,
            lifecycle: Mutex::new(Lifecycle {
                actor: Some(actor),
                ..Lifecycle::default()
            }),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.inbox.read().is_some()
    }

    /// Spawn the actor and the challenge ticker on the current tokio runtime.
    pub fn start(&self) -> Result<(), ConsensusError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConsensusError::TaskFailed(e.to_string()))?;
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.task.is_some() {
            return Err(ConsensusError::EngineAlreadyRunning);
        }
        let Some(actor) = lifecycle.actor.take() else {
            return Err(ConsensusError::TaskFailed(
                "consensus actor was lost by a failed task".to_string(),
            ));
        };

        let (sender, receiver) = mpsc::channel(self.config.inbound_queue_capacity);
        let cancel = CancellationToken::new();
        *self.shared.inbox.write() = Some(sender);

        lifecycle.task = Some(runtime.spawn(actor.run(receiver, cancel.clone())));
        lifecycle.ticker = Some(runtime.spawn(issue_challenges(
            self.gate.clone(),
            self.config.poc_interval_duration(),
            self.challenges.clone(),
            cancel.clone(),
        )));
        lifecycle.cancel = Some(cancel);
        info!("Consensus engine {} started", self.node_id);
        Ok(())
    }

    /// Cancel timers, drop in-flight slots and wait for the actor to exit.
    /// Committed decisions are kept; the engine can be started again.
    pub async fn stop(&self) -> Result<(), ConsensusError> {
        let (task, ticker, cancel) = {
            let mut lifecycle = self.lifecycle.lock();
            (
                lifecycle.task.take(),
                lifecycle.ticker.take(),
                lifecycle.cancel.take(),
            )
        };
        *self.shared.inbox.write() = None;
        let Some(task) = task else {
            return Ok(());
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                warn!("Challenge ticker ended abnormally: {}", e);
            }
        }

        let mut actor = task
            .await
            .map_err(|e| ConsensusError::TaskFailed(e.to_string()))?;
        actor.discard_in_flight();
        actor.publish_status(false);
        self.lifecycle.lock().actor = Some(actor);
        info!("Consensus engine {} stopped", self.node_id);
        Ok(())
    }

    /// Queue a payload for ordering and return its id.
    pub fn submit_proposal(&self, payload: impl Into<Vec<u8>>) -> Result<ProposalId, ConsensusError> {
        if !self.is_running() {
            return Err(ConsensusError::EngineStopped);
        }
        let leader = self.shared.status.read().leader.clone();
        if leader != self.node_id {
            if !self.config.forward_to_leader {
                return Err(ConsensusError::NotLeader {
                    leader: Some(leader),
                });
            }
        } else if !self.gate.is_eligible_leader(&self.node_id) {
            return Err(ConsensusError::LeaderNotEligible { leader });
        }

        let proposal = Proposal::new(self.node_id.clone(), payload.into(), self.clock.now_millis());
        let id = proposal.id.clone();
        self.shared
            .outcomes
            .write()
            .insert(id.clone(), ProposalOutcome::Pending);
        if let Err(e) = self.inbound.enqueue(Event::Submit(proposal)) {
            self.shared.outcomes.write().remove(&id);
            return Err(e);
        }
        debug!("Queued proposal {}", id);
        Ok(id)
    }

    pub fn handle_incoming(&self, bytes: &[u8]) -> Result<(), ConsensusError> {
        self.inbound.handle_incoming(bytes)
    }

    /// Receive path for transports that deliver from other tasks.
    pub fn inbound(&self) -> InboundHandle {
        self.inbound.clone()
    }

    pub fn register_decision_handler<F>(&self, handler: F)
    where
        F: Fn(u64, &[u8]) + Send + Sync + 'static,
    {
        self.shared.handlers.write().push(Arc::new(handler));
    }

    pub fn get_status(&self) -> EngineStatus {
        let mut status = self.shared.status.read().clone();
        // Boundary rejections never reach the actor, so read them live.
        status.rejections = self.shared.counters.snapshot();
        status
    }

    pub fn proposal_outcome(&self, id: &ProposalId) -> Option<ProposalOutcome> {
        self.shared.outcomes.read().get(id).cloned()
    }

    pub fn last_committed(&self) -> u64 {
        self.shared.log.read().last_committed()
    }

    /// Committed decisions in [from, to], for serving state transfer to peers.
    pub fn decisions(&self, from: u64, to: u64) -> Vec<Decision> {
        self.shared.log.read().range(from, to)
    }

    /// Feed decisions fetched from peers back into the actor.
    pub fn install_decisions(&self, decisions: Vec<Decision>) -> Result<(), ConsensusError> {
        self.inbound.enqueue(Event::InstallDecisions(decisions))
    }

    pub fn computation_gate(&self) -> &Arc<ComputationGate> {
        &self.gate
    }

    /// Challenges issued every `poc_interval` while the engine runs.
    pub fn subscribe_challenges(&self) -> broadcast::Receiver<ComputationChallenge> {
        self.challenges.subscribe()
    }

    pub fn submit_solution(&self, node_id: &str, challenge_id: &str, nonce: u64) -> bool {
        self.gate.verify_solution(node_id, challenge_id, nonce)
    }

    /// Credit this node's own solution and announce it as a signed SOLUTION
    /// so every replica's gate credits it too. Returns false if it does not
    /// verify locally.
    pub fn publish_solution(&self, challenge_id: &str, nonce: u64) -> Result<bool, ConsensusError> {
        if !self.gate.verify_solution(&self.node_id, challenge_id, nonce) {
            return Ok(false);
        }
        let view = self.shared.status.read().view;
        let message = ConsensusMessage::new(
            view,
            0,
            Digest::ZERO,
            self.node_id.clone(),
            self.clock.now_millis(),
            MessageBody::Solution {
                challenge_id: challenge_id.to_string(),
                nonce,
            },
        );
        let signed = SignedMessage::seal(message, self.crypto.as_ref());
        self.transport.broadcast(signed.encode()?);
        Ok(true)
    }
}

impl Drop for ConsensusEngine {
    fn drop(&mut self) {
        if let Some(cancel) = self.lifecycle.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

async fn issue_challenges(
    gate: Arc<ComputationGate>,
    period: Duration,
    sender: broadcast::Sender<ComputationChallenge>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let challenge = gate.issue_challenge();
                // No subscribers is fine.
                let _ = sender.send(challenge);
                let pruned = gate.prune_expired();
                if pruned > 0 {
                    debug!("Pruned {} expired reward records", pruned);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticRoster;
    use crate::crypto::KeyRing;

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _to: &NodeId, _bytes: Vec<u8>) {}
        fn broadcast(&self, _bytes: Vec<u8>) {}
    }

    fn engine(node: &str, config: ConsensusConfig) -> Result<ConsensusEngine, ConsensusError> {
        let ids = ["node-0", "node-1", "node-2", "node-3"];
        let ring = KeyRing::deterministic(&ids);
        let crypto = ring.crypto_for(node).unwrap_or_else(|| ring.crypto_for("node-0").unwrap());
        let collaborators = Collaborators::new(
            Arc::new(NullTransport),
            crypto,
            Arc::new(StaticRoster::new(ids)),
        );
        ConsensusEngine::new(node, config, collaborators)
    }

    #[test]
    fn test_rejects_node_outside_roster() {
        let err = engine("node-9", ConsensusConfig::default()).err().unwrap();
        assert_eq!(
            err,
            ConsensusError::Config(ConfigError::NodeNotInRoster("node-9".to_string()))
        );
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = ConsensusConfig {
            pbft_timeout: 0.0,
            ..ConsensusConfig::default()
        };
        assert!(matches!(
            engine("node-0", config),
            Err(ConsensusError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_submit_before_start_fails() {
        let engine = engine("node-0", ConsensusConfig::default()).unwrap();
        assert_eq!(
            engine.submit_proposal(b"early".to_vec()),
            Err(ConsensusError::EngineStopped)
        );
        let status = engine.get_status();
        assert!(!status.running);
        assert_eq!(status.leader, "node-0");
        assert_eq!(status.known_nodes.len(), 4);
        assert_eq!(status.quorum_size, 3);
    }

    #[tokio::test]
    async fn test_lifecycle_and_local_misuse() {
        let config = ConsensusConfig {
            forward_to_leader: false,
            ..ConsensusConfig::default()
        };
        let replica = engine("node-1", config).unwrap();
        replica.start().unwrap();
        assert_eq!(replica.start(), Err(ConsensusError::EngineAlreadyRunning));
        assert!(matches!(
            replica.submit_proposal(b"x".to_vec()),
            Err(ConsensusError::NotLeader { leader: Some(ref l) }) if l == "node-0"
        ));

        let leader = engine("node-0", ConsensusConfig::default()).unwrap();
        leader.start().unwrap();
        assert_eq!(
            leader.submit_proposal(b"x".to_vec()),
            Err(ConsensusError::LeaderNotEligible {
                leader: "node-0".to_string()
            })
        );

        replica.stop().await.unwrap();
        assert!(!replica.is_running());
        assert_eq!(
            replica.submit_proposal(b"x".to_vec()),
            Err(ConsensusError::EngineStopped)
        );
        replica.start().unwrap();
        assert!(replica.is_running());
        replica.stop().await.unwrap();
        leader.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frames_are_counted() {
        let engine = engine("node-1", ConsensusConfig::default()).unwrap();
        engine.start().unwrap();
        assert!(matches!(
            engine.handle_incoming(&[0xff, 0x01, 0x02]),
            Err(ConsensusError::InvalidMessage(_))
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.get_status().rejections.malformed, 1);
        engine.stop().await.unwrap();
    }

    fn future_message(ring: &KeyRing, sender: &str, view: u64, sequence: u64) -> SignedMessage {
        let crypto = ring.crypto_for(sender).unwrap();
        let message = ConsensusMessage::new(
            view,
            sequence,
            Digest::ZERO,
            sender.to_string(),
            0,
            MessageBody::Prepare,
        );
        SignedMessage::seal(message, crypto.as_ref())
    }

    #[test]
    fn test_future_buffer_flood_keeps_honest_messages() {
        let ring = KeyRing::deterministic(&["node-0", "node-1", "node-2", "node-3"]);
        let mut buffer = FutureBuffer::new(16, 4);
        buffer.push(future_message(&ring, "node-1", 1, 1));
        buffer.push(future_message(&ring, "node-2", 1, 1));

        for sequence in 0..5_000 {
            buffer.push(future_message(&ring, "node-3", 1, sequence));
        }
        assert_eq!(buffer.held_by(&"node-3".to_string()), 4);
        assert_eq!(buffer.held_by(&"node-1".to_string()), 1);
        assert_eq!(buffer.held_by(&"node-2".to_string()), 1);
        assert_eq!(buffer.len(), 6);

        let ready = buffer.take_through(1);
        assert_eq!(ready.len(), 6);
        // The flooder keeps only its newest messages.
        assert_eq!(ready.last().unwrap().message.sequence, 4_999);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_full_future_buffer_evicts_the_heaviest_sender() {
        let ring = KeyRing::deterministic(&["node-0", "node-1", "node-2", "node-3"]);
        let mut buffer = FutureBuffer::new(6, 4);
        for sequence in 0..4 {
            buffer.push(future_message(&ring, "node-3", 2, sequence));
        }
        buffer.push(future_message(&ring, "node-1", 3, 1));
        buffer.push(future_message(&ring, "node-2", 2, 1));
        buffer.push(future_message(&ring, "node-0", 2, 1));

        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.held_by(&"node-3".to_string()), 3);
        assert_eq!(buffer.held_by(&"node-0".to_string()), 1);

        // View 3 stays buffered.
        assert_eq!(buffer.take_through(2).len(), 5);
        assert_eq!(buffer.held_by(&"node-1".to_string()), 1);
    }

    #[test]
    fn test_publish_solution_credits_locally_once() {
        let node = engine("node-2", ConsensusConfig::default()).unwrap();
        let challenge = node.computation_gate().issue_challenge();
        let nonce = crate::computation_gate::solve_challenge(&challenge, "node-2");
        let wrong = (0u64..)
            .find(|candidate| !challenge.is_solved_by("node-2", *candidate))
            .unwrap();

        assert_eq!(node.publish_solution(&challenge.id, wrong), Ok(false));
        assert_eq!(node.publish_solution(&challenge.id, nonce), Ok(true));
        assert!(node.computation_gate().score_of("node-2") > 0.0);
        // A second submission of the same work is not rewarded again.
        assert_eq!(node.publish_solution(&challenge.id, nonce), Ok(false));
    }
}
