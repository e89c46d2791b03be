//! End-to-end convergence scenarios over the in-memory transport: one
//! driver task per agent, real timers, real message flow.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use concord_core::agreement::AgreementEngine;
use concord_core::driver::{DriverTimeouts, NodeDriver, RunReport};
use concord_core::neighborhood::NeighborhoodDetector;
use concord_core::rap::Rap;
use concord_core::transport::InMemoryHub;

use common::{contended_node_rap, disjoint_pair_rap, orchestrator_for, rap_from_json};

fn test_timeouts() -> DriverTimeouts {
    DriverTimeouts {
        agreement_timeout: Duration::from_millis(400),
        weak_agreement_timeout: Duration::from_secs(3),
        async_timeout: Duration::from_millis(100),
        sample_frequency: Duration::from_secs(1),
    }
}

/// Spawn one driver per (agent, bundle, utility) and join them all.
async fn run_network(
    rap: &Arc<Rap>,
    agents: &[(&str, &[&str], f64)],
) -> BTreeMap<String, RunReport> {
    let hub = Arc::new(InMemoryHub::new());
    let mut handles = Vec::new();

    for (name, services, utility) in agents {
        let orchestrator = orchestrator_for(rap, name, services, *utility);
        let agent = orchestrator.agent();
        let engine = AgreementEngine::new(agent, rap.clone());
        let detector = NeighborhoodDetector::from_hash(rap.clone(), agent, 100, true);
        let driver = NodeDriver::new(
            orchestrator,
            engine,
            detector,
            hub.clone(),
            test_timeouts(),
        );
        handles.push((name.to_string(), tokio::spawn(driver.run())));
    }

    let mut reports = BTreeMap::new();
    for (name, handle) in handles {
        let report = tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .expect("driver must terminate")
            .expect("driver task must not panic")
            .expect("driver must not fail");
        reports.insert(name, report);
    }
    reports
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trivial_non_overlap_converges_strong() {
    // S1: two agents, two nodes, disjoint demands: both win their node
    // after one exchange and exit on the quiescence timer.
    let rap = disjoint_pair_rap();
    let reports = run_network(&rap, &[("alice", &["svc_a"], 10.0), ("bob", &["svc_b"], 10.0)]).await;

    let alice = &reports["alice"];
    let bob = &reports["bob"];
    assert!(alice.strong_agreement);
    assert!(bob.strong_agreement);
    assert_eq!(alice.implementation.len(), 1);
    assert_eq!(bob.implementation.len(), 1);
    assert_eq!(alice.private_utility, 10);
    assert_eq!(bob.private_utility, 10);
    assert!(alice.agreement_after.is_some());
    assert!(bob.agreement_after.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pure_overbid_resolves_to_higher_utility() {
    // S2: one node both agents need in full; the higher-utility agent
    // keeps it, the other ends empty. The loser settles into agreement;
    // the winner's last word may go unacknowledged, in which case it exits
    // on the weak timer with the same allocation.
    let rap = contended_node_rap();
    let reports = run_network(&rap, &[("alice", &["svc"], 10.0), ("bob", &["svc"], 20.0)]).await;

    let alice = &reports["alice"];
    let bob = &reports["bob"];

    assert_eq!(bob.implementation.len(), 1);
    assert_eq!(bob.private_utility, 20);
    assert!(alice.implementation.is_empty());
    assert_eq!(alice.private_utility, 0);
    assert!(alice.strong_agreement);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn test_quiescence_terminates_all_agents() {
    // S5: three agents with disjoint demands all reach identical bidding
    // data and exit on their quiescence timers.
    let rap = rap_from_json(serde_json::json!({
        "sdos": ["alice", "bob", "carol"],
        "services": ["svc_a", "svc_b", "svc_c"],
        "functions": ["fa", "fb", "fc"],
        "resources": ["cpu", "memory", "disk"],
        "nodes": ["n0", "n1", "n2"],
        "consumption": {
            "fa": {"cpu": 4, "memory": 0, "disk": 0},
            "fb": {"cpu": 0, "memory": 4, "disk": 0},
            "fc": {"cpu": 0, "memory": 0, "disk": 4}
        },
        "available_resources": {
            "n0": {"cpu": 4, "memory": 0, "disk": 0},
            "n1": {"cpu": 0, "memory": 4, "disk": 0},
            "n2": {"cpu": 0, "memory": 0, "disk": 4}
        },
        "implementation": {
            "svc_a": ["fa"],
            "svc_b": ["fb"],
            "svc_c": ["fc"]
        }
    }));
    let reports = run_network(
        &rap,
        &[
            ("alice", &["svc_a"], 10.0),
            ("bob", &["svc_b"], 10.0),
            ("carol", &["svc_c"], 10.0),
        ],
    )
    .await;

    for (name, report) in &reports {
        assert!(report.strong_agreement, "{name} must exit strong");
        assert_eq!(report.implementation.len(), 1, "{name} must place its bundle");
        assert!(report.agreement_after.is_some());
        assert!(report.sent_messages > 0);
        assert!(report.received_messages > 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_bundle_agent_converges_immediately() {
    // B2: an agent with nothing to place never bids and still converges
    // with its neighborhood.
    let rap = disjoint_pair_rap();
    let reports = run_network(&rap, &[("alice", &[], 10.0), ("bob", &["svc_b"], 10.0)]).await;

    let alice = &reports["alice"];
    assert!(alice.implementation.is_empty());
    assert_eq!(alice.private_utility, 0);
    assert!(alice.strong_agreement);
    assert!(reports["bob"].strong_agreement);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_agent_exits_on_quiescence() {
    // A one-agent network has an empty neighborhood: agreement is trivially
    // complete and the soft timer ends the run.
    let rap = rap_from_json(serde_json::json!({
        "sdos": ["alice"],
        "services": ["svc"],
        "functions": ["f1"],
        "resources": ["cpu"],
        "nodes": ["n0"],
        "consumption": {"f1": {"cpu": 1}},
        "available_resources": {"n0": {"cpu": 4}},
        "implementation": {"svc": ["f1"]}
    }));
    let reports = run_network(&rap, &[("alice", &["svc"], 10.0)]).await;

    let alice = &reports["alice"];
    assert!(alice.strong_agreement);
    assert_eq!(alice.implementation.len(), 1);
    assert_eq!(alice.sent_messages, 0);
    assert!(!alice.message_rates.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rates_cover_the_whole_run() {
    let rap = disjoint_pair_rap();
    let reports = run_network(&rap, &[("alice", &["svc_a"], 10.0), ("bob", &["svc_b"], 10.0)]).await;

    for report in reports.values() {
        let total: u64 = report.message_rates.iter().map(|r| r.sent).sum();
        assert_eq!(total, report.sent_messages);
        for pair in report.message_rates.windows(2) {
            assert!(pair[0].window_end <= pair[1].window_start + 1e-9);
        }
    }
}
