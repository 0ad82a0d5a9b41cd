use aegis_consensus::{
    solve_challenge, Collaborators, ConsensusConfig, ConsensusEngine, EngineStatus, KeyRing,
    LocalNetwork, StaticRoster,
};
use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Cluster size
    #[arg(long, default_value_t = 4)]
    pub nodes: usize,

    /// Proposals to submit
    #[arg(long, default_value_t = 10)]
    pub proposals: usize,

    /// JSON engine configuration; defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Cut the view-0 leader off the network before submitting
    #[arg(long)]
    pub crash_leader: bool,

    /// Seconds to wait for every proposal to commit
    #[arg(long, default_value_t = 30.0)]
    pub timeout: f64,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub nodes: usize,
    pub fault_tolerance: usize,
    pub quorum_size: usize,
    pub proposals_submitted: usize,
    pub crashed: Option<String>,
    pub all_committed: bool,
    pub logs_agree: bool,
    pub elapsed_ms: u128,

    /// Non-empty decisions executed per node
    pub committed: BTreeMap<String, usize>,
    pub statuses: Vec<EngineStatus>,
}

type CommittedLog = Vec<(u64, Vec<u8>)>;

/// True if every log is a prefix of the longest one.
fn logs_agree(logs: &[&CommittedLog]) -> bool {
    let Some(longest) = logs.iter().max_by_key(|log| log.len()) else {
        return true;
    };
    logs.iter()
        .all(|log| log.iter().zip(longest.iter()).all(|(a, b)| a == b))
}

pub async fn run(args: SimulateArgs) -> Result<SimulationReport> {
    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    if args.crash_leader && args.nodes < 4 {
        bail!("--crash-leader needs at least 4 nodes to tolerate the fault");
    }
    if !(args.timeout.is_finite() && args.timeout > 0.0) {
        bail!("--timeout must be a positive number of seconds");
    }
    let config = match &args.config {
        Some(path) => ConsensusConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ConsensusConfig::default(),
    };

    let ids: Vec<String> = (0..args.nodes).map(|i| format!("node-{}", i)).collect();
    let ring = KeyRing::generate(&ids);
    let network = LocalNetwork::new();
    let roster = Arc::new(StaticRoster::new(ids.clone()));
    let (decisions_tx, mut decisions_rx) = mpsc::unbounded_channel::<(usize, u64, Vec<u8>)>();

    let mut engines = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        let crypto = ring
            .crypto_for(id)
            .with_context(|| format!("no key generated for {}", id))?;
        let collaborators = Collaborators::new(network.transport(id.clone()), crypto, roster.clone());
        let engine = ConsensusEngine::new(id.clone(), config.clone(), collaborators)?;
        network.register(id.clone(), engine.inbound());

        let sink = decisions_tx.clone();
        engine.register_decision_handler(move |sequence, payload| {
            let _ = sink.send((index, sequence, payload.to_vec()));
        });
        engines.push(engine);
    }

    // Each node proves work once; every replica verifies and credits it.
    for id in &ids {
        let challenge = engines[0].computation_gate().issue_challenge();
        let nonce = solve_challenge(&challenge, id);
        for engine in &engines {
            if !engine.submit_solution(id, &challenge.id, nonce) {
                warn!("{} rejected the solution of {}", engine.node_id(), id);
            }
        }
    }

    for engine in &engines {
        engine.start()?;
    }

    let crashed = if args.crash_leader {
        let leader = engines[0].get_status().leader;
        network.isolate(&leader);
        info!("Isolated leader {}", leader);
        Some(leader)
    } else {
        None
    };
    let live: Vec<usize> = (0..ids.len())
        .filter(|&i| crashed.as_deref() != Some(ids[i].as_str()))
        .collect();
    let submitter = engines[0].get_status().leader;
    let submitter = match ids.iter().position(|id| *id == submitter) {
        Some(index) if live.contains(&index) => index,
        _ => live[0],
    };

    let started = Instant::now();
    for k in 0..args.proposals {
        engines[submitter]
            .submit_proposal(format!("proposal-{}", k).into_bytes())
            .with_context(|| format!("submitting proposal {} at {}", k, ids[submitter]))?;
    }

    let mut logs: Vec<CommittedLog> = vec![Vec::new(); ids.len()];
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(args.timeout);
    let done = |logs: &[CommittedLog]| {
        live.iter().all(|&i| {
            logs[i].iter().filter(|(_, payload)| !payload.is_empty()).count() >= args.proposals
        })
    };
    while !done(&logs) {
        match tokio::time::timeout_at(deadline, decisions_rx.recv()).await {
            Ok(Some((index, sequence, payload))) => logs[index].push((sequence, payload)),
            Ok(None) => break,
            Err(_) => {
                warn!("Timed out waiting for commits");
                break;
            }
        }
    }
    let elapsed_ms = started.elapsed().as_millis();
    let all_committed = done(&logs);

    let statuses: Vec<EngineStatus> = engines.iter().map(|engine| engine.get_status()).collect();
    for engine in &engines {
        engine.stop().await?;
    }

    let live_logs: Vec<&CommittedLog> = live.iter().map(|&i| &logs[i]).collect();
    let committed = ids
        .iter()
        .zip(logs.iter())
        .map(|(id, log)| {
            let count = log.iter().filter(|(_, payload)| !payload.is_empty()).count();
            (id.clone(), count)
        })
        .collect();
    let (quorum_size, fault_tolerance) = statuses
        .first()
        .map(|s| (s.quorum_size, s.fault_tolerance))
        .unwrap_or_default();

    Ok(SimulationReport {
        nodes: ids.len(),
        fault_tolerance,
        quorum_size,
        proposals_submitted: args.proposals,
        crashed,
        all_committed,
        logs_agree: logs_agree(&live_logs),
        elapsed_ms,
        committed,
        statuses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(nodes: usize, crash_leader: bool) -> SimulateArgs {
        SimulateArgs {
            nodes,
            proposals: 3,
            config: None,
            crash_leader,
            timeout: 20.0,
        }
    }

    #[test]
    fn test_logs_agree_on_prefixes() {
        let a = vec![(1, b"x".to_vec()), (2, b"y".to_vec())];
        let b = vec![(1, b"x".to_vec())];
        let c = vec![(1, b"z".to_vec())];
        assert!(logs_agree(&[&a, &b]));
        assert!(!logs_agree(&[&a, &c]));
        assert!(logs_agree(&[]));
    }

    #[tokio::test]
    async fn test_simulation_commits_everywhere() {
        let report = run(args(4, false)).await.unwrap();
        assert!(report.all_committed);
        assert!(report.logs_agree);
        assert!(report.committed.values().all(|count| *count == 3));
        assert_eq!(report.quorum_size, 3);
    }

    #[tokio::test]
    async fn test_simulation_survives_crashed_leader() {
        let report = run(args(4, true)).await.unwrap();
        assert_eq!(report.crashed.as_deref(), Some("node-0"));
        assert!(report.all_committed);
        assert!(report.logs_agree);
        assert_eq!(report.committed["node-0"], 0);
    }

    #[tokio::test]
    async fn test_crash_needs_four_nodes() {
        assert!(run(args(3, true)).await.is_err());
    }
}
