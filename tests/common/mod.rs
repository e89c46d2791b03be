//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use concord_core::bidding::{BiddingMessage, Timestamp};
use concord_core::orchestrator::Orchestrator;
use concord_core::rap::{FunctionId, NodeId, Rap, RapSpec};
use concord_core::utility::{BundleContext, UtilityOracle};

/// Oracle returning a fixed utility for every implementing pair; keeps the
/// election arithmetic predictable in scenario tests.
pub struct ConstUtility(pub f64);

impl UtilityOracle for ConstUtility {
    fn marginal_utility(
        &self,
        rap: &Rap,
        bundle: &BundleContext<'_>,
        slot: usize,
        function: FunctionId,
        _node: NodeId,
    ) -> f64 {
        if !rap.implements(bundle.services[slot], function) {
            0.0
        } else {
            self.0
        }
    }
}

pub fn rap_from_json(value: serde_json::Value) -> Arc<Rap> {
    let spec: RapSpec = serde_json::from_value(value).expect("valid fixture");
    Arc::new(Rap::from_spec(spec).expect("valid instance"))
}

/// Two agents, two disjoint nodes: each bundle fits exactly one node.
pub fn disjoint_pair_rap() -> Arc<Rap> {
    rap_from_json(serde_json::json!({
        "sdos": ["alice", "bob"],
        "services": ["svc_a", "svc_b"],
        "functions": ["fa", "fb"],
        "resources": ["cpu", "memory"],
        "nodes": ["n0", "n1"],
        "consumption": {
            "fa": {"cpu": 4, "memory": 0},
            "fb": {"cpu": 0, "memory": 4}
        },
        "available_resources": {
            "n0": {"cpu": 4, "memory": 0},
            "n1": {"cpu": 0, "memory": 4}
        },
        "implementation": {
            "svc_a": ["fa"],
            "svc_b": ["fb"]
        }
    }))
}

/// One node both agents need in full.
pub fn contended_node_rap() -> Arc<Rap> {
    rap_from_json(serde_json::json!({
        "sdos": ["alice", "bob"],
        "services": ["svc"],
        "functions": ["f_full"],
        "resources": ["cpu", "memory"],
        "nodes": ["n0"],
        "consumption": {
            "f_full": {"cpu": 4, "memory": 4}
        },
        "available_resources": {
            "n0": {"cpu": 4, "memory": 4}
        },
        "implementation": {
            "svc": ["f_full"]
        }
    }))
}

/// One shared node with small/large function choices per service.
pub fn packed_node_rap(agents: &[&str]) -> Arc<Rap> {
    rap_from_json(serde_json::json!({
        "sdos": agents,
        "services": ["s1", "s2"],
        "functions": ["f_small", "f_big"],
        "resources": ["cpu"],
        "nodes": ["n0"],
        "consumption": {
            "f_small": {"cpu": 1},
            "f_big": {"cpu": 2}
        },
        "available_resources": {
            "n0": {"cpu": 4}
        },
        "implementation": {
            "s1": ["f_small", "f_big"],
            "s2": ["f_small", "f_big"]
        }
    }))
}

pub fn orchestrator_for(
    rap: &Arc<Rap>,
    agent: &str,
    services: &[&str],
    utility: f64,
) -> Orchestrator {
    let agent_id = rap.agent_id(agent).expect("known agent");
    let service_ids: Vec<_> = services
        .iter()
        .map(|s| rap.service_id(s).expect("known service"))
        .collect();
    Orchestrator::new(
        agent_id,
        rap.clone(),
        Arc::new(ConstUtility(utility)),
        &service_ids,
        Duration::from_secs(2),
    )
}

/// Snapshot an orchestrator's state as the message it would broadcast.
pub fn message_of(orchestrator: &Orchestrator) -> BiddingMessage {
    BiddingMessage {
        sender: orchestrator.agent(),
        winners: orchestrator.per_node_winners.clone(),
        bidding_data: orchestrator.bidding_data.clone(),
        timestamp: Timestamp::now(),
    }
}
