// CONSENSUS ERRORS
// Error taxonomy for the engine surface and its configuration.
//
// SAFETY: Validation errors never reach the state machine. Consistency
// violations are surfaced to the operator and are never silently resolved.

use crate::types::NodeId;
use thiserror::Error;

/// Errors returned by the public engine API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    /// Local node is not the leader of the current view and forwarding is disabled
    #[error("node is not the current leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The local node is the leader but its computation score is below the floor
    #[error("leader {leader} is not eligible: computation score below minimum")]
    LeaderNotEligible { leader: NodeId },

    #[error("consensus engine is stopped")]
    EngineStopped,

    #[error("consensus engine is already running")]
    EngineAlreadyRunning,

    /// Frame could not be decoded or carries an unknown message tag
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid signature from {sender}")]
    InvalidSignature { sender: NodeId },

    #[error("message from unknown sender {sender}")]
    UnknownSender { sender: NodeId },

    /// Inbound queue is saturated; the message was dropped
    #[error("inbound queue is full")]
    QueueFull,

    /// More than f faulty nodes were observed (double quorum, conflicting commit)
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("engine task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read configuration file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("roster is empty")]
    EmptyRoster,

    #[error("local node {0} is not part of the roster")]
    NodeNotInRoster(NodeId),
}
