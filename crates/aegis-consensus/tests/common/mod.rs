#![allow(dead_code)]

use aegis_consensus::{
    Collaborators, ConsensusConfig, ConsensusEngine, KeyRing, LocalNetwork, StateTransfer,
    StaticRoster,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fast timers for in-process clusters.
pub fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        pbft_timeout: 0.3,
        view_change_timeout: Some(0.6),
        checkpoint_interval: 4,
        watermark_window: 32,
        ..ConsensusConfig::default()
    }
}

/// Forwards state-transfer requests to the test body.
struct ChannelStateTransfer {
    node: usize,
    requests: mpsc::UnboundedSender<(usize, u64, u64)>,
}

impl StateTransfer for ChannelStateTransfer {
    fn request_range(&self, from_sequence: u64, to_sequence: u64) {
        let _ = self.requests.send((self.node, from_sequence, to_sequence));
    }
}

pub struct Cluster {
    pub ids: Vec<String>,
    pub ring: KeyRing,
    pub network: LocalNetwork,
    pub engines: Vec<Arc<ConsensusEngine>>,
    pub committed: Vec<Arc<Mutex<Vec<(u64, Vec<u8>)>>>>,
    pub transfer_requests: mpsc::UnboundedReceiver<(usize, u64, u64)>,
}

impl Cluster {
    pub fn new(n: usize, config: ConsensusConfig) -> Self {
        init_logging();
        let ids: Vec<String> = (0..n).map(|i| format!("node-{}", i)).collect();
        let ring = KeyRing::deterministic(&ids);
        let network = LocalNetwork::new();
        let roster = Arc::new(StaticRoster::new(ids.clone()));
        let (requests, transfer_requests) = mpsc::unbounded_channel();

        let mut engines = Vec::new();
        let mut committed = Vec::new();
        for (index, id) in ids.iter().enumerate() {
            let collaborators = Collaborators::new(
                network.transport(id.clone()),
                ring.crypto_for(id).unwrap(),
                roster.clone(),
            )
            .with_state_transfer(Arc::new(ChannelStateTransfer {
                node: index,
                requests: requests.clone(),
            }));
            let engine = Arc::new(ConsensusEngine::new(id.clone(), config.clone(), collaborators).unwrap());
            network.register(id.clone(), engine.inbound());

            let log = Arc::new(Mutex::new(Vec::new()));
            let sink = log.clone();
            engine.register_decision_handler(move |sequence, payload| {
                sink.lock().push((sequence, payload.to_vec()));
            });
            engines.push(engine);
            committed.push(log);
        }

        Cluster {
            ids,
            ring,
            network,
            engines,
            committed,
            transfer_requests,
        }
    }

    /// Give every node the same score in every node's ledger.
    pub fn seed_scores(&self, score: f64) {
        for engine in &self.engines {
            for id in &self.ids {
                engine.computation_gate().seed_score(id, score);
            }
        }
    }

    pub fn start(&self) {
        for engine in &self.engines {
            engine.start().unwrap();
        }
    }

    pub async fn stop(&self) {
        for engine in &self.engines {
            engine.stop().await.unwrap();
        }
    }

    pub fn payloads(&self, node: usize) -> Vec<Vec<u8>> {
        self.committed[node]
            .lock()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn has_committed(&self, node: usize, payload: &[u8]) -> bool {
        self.committed[node]
            .lock()
            .iter()
            .any(|(_, p)| p.as_slice() == payload)
    }

    /// Poll `condition` every 10ms until it holds or `timeout` passes.
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&Cluster) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
