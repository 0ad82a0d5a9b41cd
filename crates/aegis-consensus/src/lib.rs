pub mod action;
pub mod checkpoint;
pub mod clock;
pub mod collaborators;
pub mod computation_gate;
pub mod config;
pub mod crypto;
pub mod decision_log;
pub mod engine;
pub mod error;
pub mod local_network;
pub mod message;
pub mod pbft;
pub mod quorum;
pub mod status;
pub mod types;
pub mod view_manager;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{Crypto, LoggingStateTransfer, NodeRoster, StateTransfer, StaticRoster, Transport};
pub use computation_gate::{solve_challenge, ComputationChallenge, ComputationGate};
pub use config::{ComputationParams, ConsensusConfig};
pub use crypto::{Ed25519Crypto, KeyRing};
pub use engine::{Collaborators, ConsensusEngine, DecisionHandler, InboundHandle};
pub use error::{ConfigError, ConsensusError};
pub use local_network::{LocalNetwork, LocalTransport};
pub use message::{ConsensusMessage, MessageBody, MessageKind, SignedMessage};
pub use pbft::{PbftCore, PbftError, SlotPhase};
pub use quorum::{QuorumCertificate, QuorumError, QuorumParams};
pub use status::{EngineStatus, ProposalOutcome, RejectionStats};
pub use types::{Decision, Digest, Node, NodeId, Proposal, ProposalId};
pub use view_manager::{ViewManager, ViewState};
