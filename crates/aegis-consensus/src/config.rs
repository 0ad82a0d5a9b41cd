// ENGINE CONFIGURATION
// Recognized options, defaults and validation.
//
// SAFETY: A config that fails `validate()` is never handed to the engine.

use crate::error::ConfigError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Proof-of-computation gate parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputationParams {
    /// Leading zero bits required at network size 1
    pub base_difficulty: u32,

    /// Upper bound on the scaled difficulty
    pub max_difficulty: u32,

    /// Seconds a challenge stays solvable after issuance
    pub challenge_ttl: f64,

    /// Score added per verified solution
    pub solution_reward: f64,

    /// Hard cap on any node's score
    pub max_score: f64,

    /// Fraction of the score lost per `poc_interval`
    pub decay_per_interval: f64,
}

impl Default for ComputationParams {
    fn default() -> Self {
        ComputationParams {
            base_difficulty: 8,
            max_difficulty: 24,
            challenge_ttl: 60.0,
            solution_reward: 2.0,
            max_score: 10.0,
            decay_per_interval: 0.1,
        }
    }
}

/// Consensus engine configuration. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Phase timeout for pre-prepare, prepare quorum and commit quorum
    pub pbft_timeout: f64,

    /// Challenge issuance cadence
    pub poc_interval: f64,

    /// Tolerated faulty fraction; only used to sanity-check f against the roster
    pub byzantine_threshold: f64,

    /// Leader eligibility floor
    pub min_computation_score: f64,

    /// Proactive rotation cadence, disabled when unset
    pub leader_rotation_interval: Option<f64>,

    /// Time allowed for NEW_VIEW before moving on to the next view.
    /// Defaults to twice `pbft_timeout` when unset.
    pub view_change_timeout: Option<f64>,

    /// Non-leaders forward submitted proposals instead of failing with `NotLeader`
    pub forward_to_leader: bool,

    /// Executed sequences between checkpoints
    pub checkpoint_interval: u64,

    /// Width of the accepted sequence window above the stable checkpoint
    pub watermark_window: u64,

    /// Bounded inbound queue size per node
    pub inbound_queue_capacity: usize,

    pub computation: ComputationParams,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            pbft_timeout: 2.0,
            poc_interval: 30.0,
            byzantine_threshold: 0.33,
            min_computation_score: 1.0,
            leader_rotation_interval: None,
            view_change_timeout: None,
            forward_to_leader: true,
            checkpoint_interval: 100,
            watermark_window: 400,
            inbound_queue_capacity: 4096,
            computation: ComputationParams::default(),
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be a positive number of seconds, got {}", value),
        })
    }
}

impl ConsensusConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ConsensusConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("pbft_timeout", self.pbft_timeout)?;
        positive("poc_interval", self.poc_interval)?;
        if let Some(rotation) = self.leader_rotation_interval {
            positive("leader_rotation_interval", rotation)?;
        }
        if let Some(timeout) = self.view_change_timeout {
            positive("view_change_timeout", timeout)?;
        }
        positive("computation.challenge_ttl", self.computation.challenge_ttl)?;

        if !(self.byzantine_threshold > 0.0 && self.byzantine_threshold <= 1.0 / 3.0) {
            return Err(ConfigError::InvalidValue {
                field: "byzantine_threshold",
                reason: format!("must be in (0, 1/3], got {}", self.byzantine_threshold),
            });
        }
        if !(self.min_computation_score.is_finite() && self.min_computation_score >= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "min_computation_score",
                reason: "must be a non-negative number".to_string(),
            });
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "checkpoint_interval",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.watermark_window <= self.checkpoint_interval {
            return Err(ConfigError::InvalidValue {
                field: "watermark_window",
                reason: format!(
                    "must exceed checkpoint_interval ({}), got {}",
                    self.checkpoint_interval, self.watermark_window
                ),
            });
        }
        if self.inbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inbound_queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        let params = &self.computation;
        if params.base_difficulty > params.max_difficulty || params.max_difficulty > 64 {
            return Err(ConfigError::InvalidValue {
                field: "computation.max_difficulty",
                reason: format!(
                    "must satisfy base_difficulty ({}) <= max_difficulty <= 64, got {}",
                    params.base_difficulty, params.max_difficulty
                ),
            });
        }
        if !(params.max_score.is_finite() && params.max_score > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "computation.max_score",
                reason: "must be positive".to_string(),
            });
        }
        if !(params.solution_reward.is_finite() && params.solution_reward >= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "computation.solution_reward",
                reason: "must be non-negative".to_string(),
            });
        }
        if !(0.0..1.0).contains(&params.decay_per_interval) {
            return Err(ConfigError::InvalidValue {
                field: "computation.decay_per_interval",
                reason: format!("must be in [0, 1), got {}", params.decay_per_interval),
            });
        }
        if self.min_computation_score > params.max_score {
            warn!(
                "min_computation_score {} exceeds max_score {}: no node can ever lead",
                self.min_computation_score, params.max_score
            );
        }

        Ok(())
    }

    /// Warn when the roster cannot tolerate the configured faulty fraction.
    /// Never rejects: quorum arithmetic always uses the roster size.
    pub fn check_roster_size(&self, n: usize) {
        let f = n.saturating_sub(1) / 3;
        let wanted = (self.byzantine_threshold * n as f64).floor() as usize;
        if n < 4 {
            warn!(
                "Roster of {} nodes tolerates no Byzantine faults (need at least 4)",
                n
            );
        } else if f < wanted {
            warn!(
                "Roster of {} nodes tolerates f={} faults, below byzantine_threshold {} ({} nodes)",
                n, f, self.byzantine_threshold, wanted
            );
        }
    }

    pub fn pbft_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.pbft_timeout)
    }

    pub fn poc_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poc_interval)
    }

    pub fn view_change_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.view_change_timeout.unwrap_or(self.pbft_timeout * 2.0))
    }

    pub fn leader_rotation_duration(&self) -> Option<Duration> {
        self.leader_rotation_interval.map(Duration::from_secs_f64)
    }
}
