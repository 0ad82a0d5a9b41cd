mod common;

use aegis_consensus::{solve_challenge, ComputationParams, ConsensusConfig, ConsensusError};
use common::{test_config, Cluster};
use std::time::Duration;

fn cheap_work_config() -> ConsensusConfig {
    ConsensusConfig {
        computation: ComputationParams {
            base_difficulty: 4,
            max_difficulty: 8,
            solution_reward: 2.0,
            ..ComputationParams::default()
        },
        ..test_config()
    }
}

#[tokio::test]
async fn test_solved_challenge_makes_leader_eligible() {
    let cluster = Cluster::new(4, cheap_work_config());
    for engine in &cluster.engines {
        for id in &cluster.ids[1..] {
            engine.computation_gate().seed_score(id, 5.0);
        }
    }
    cluster.start();

    assert_eq!(
        cluster.engines[0].submit_proposal(b"P".to_vec()),
        Err(ConsensusError::LeaderNotEligible {
            leader: "node-0".to_string()
        })
    );

    let challenge = cluster.engines[0].computation_gate().issue_challenge();
    // n = 4 adds floor(log2 4) = 2 bits to the base difficulty.
    assert_eq!(challenge.difficulty, 6);
    let nonce = solve_challenge(&challenge, "node-0");

    for engine in &cluster.engines {
        assert!(engine.submit_solution("node-0", &challenge.id, nonce));
        assert!(!engine.submit_solution("node-0", &challenge.id, nonce));
        assert!(engine.computation_gate().is_eligible_leader("node-0"));
    }

    cluster.engines[0].submit_proposal(b"P".to_vec()).unwrap();
    assert!(
        cluster
            .wait_until(Duration::from_secs(2), |c| (0..4).all(|n| c.has_committed(n, b"P")))
            .await
    );

    let score = cluster.engines[1].get_status().score_of("node-0").unwrap();
    assert!(score > 1.9 && score <= 2.0, "unexpected score {}", score);
    cluster.stop().await;
}

#[tokio::test]
async fn test_published_solution_is_credited_by_every_replica() {
    let cluster = Cluster::new(4, cheap_work_config());
    for engine in &cluster.engines {
        for id in &cluster.ids[1..] {
            engine.computation_gate().seed_score(id, 5.0);
        }
    }
    cluster.start();

    let challenge = cluster.engines[0].computation_gate().issue_challenge();
    let nonce = solve_challenge(&challenge, "node-0");
    assert_eq!(cluster.engines[0].publish_solution(&challenge.id, nonce), Ok(true));

    let credited = cluster
        .wait_until(Duration::from_secs(2), |c| {
            c.engines
                .iter()
                .all(|e| e.computation_gate().is_eligible_leader("node-0"))
        })
        .await;
    assert!(credited);

    // Replaying the SOLUTION frame earns nothing more.
    let before = cluster.engines[2].computation_gate().score_of("node-0");
    assert_eq!(cluster.engines[0].publish_solution(&challenge.id, nonce), Ok(false));
    assert!(cluster.engines[2].computation_gate().score_of("node-0") <= before);

    cluster.engines[0].submit_proposal(b"P".to_vec()).unwrap();
    assert!(
        cluster
            .wait_until(Duration::from_secs(2), |c| (0..4).all(|n| c.has_committed(n, b"P")))
            .await
    );
    cluster.stop().await;
}

#[tokio::test]
async fn test_bad_solutions_leave_scores_unchanged() {
    let cluster = Cluster::new(4, cheap_work_config());
    let gate = cluster.engines[1].computation_gate();
    let challenge = gate.issue_challenge();

    let wrong = (0..u64::MAX)
        .find(|nonce| !challenge.is_solved_by("node-2", *nonce))
        .unwrap();
    assert!(!gate.verify_solution("node-2", &challenge.id, wrong));
    assert!(!gate.verify_solution("node-2", "poc:not-a-round:6", 0));

    // Work is bound to the solver's id.
    let nonce = solve_challenge(&challenge, "node-3");
    if !challenge.is_solved_by("node-2", nonce) {
        assert!(!gate.verify_solution("node-2", &challenge.id, nonce));
    }
    assert_eq!(gate.score_of("node-2"), 0.0);
}

#[tokio::test]
async fn test_challenges_are_published_while_running() {
    let cluster = Cluster::new(1, cheap_work_config());
    let mut challenges = cluster.engines[0].subscribe_challenges();
    cluster.start();

    let challenge = tokio::time::timeout(Duration::from_secs(2), challenges.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(challenge.id.starts_with("poc:"));
    assert!(challenge.expires_at > challenge.issued_at);
    // A single node needs no extra bits.
    assert_eq!(challenge.difficulty, 4);
    cluster.stop().await;
}
