//! Per-node elections and the multi-node fixed point.
//!
//! A node election is a greedy 0/1 knapsack over the node's bid cells,
//! ordered by score-to-demand ratio. The multi-node pass then eliminates
//! "false winners": agents that appear among winners somewhere but lost
//! another node against agents that are themselves genuine, and therefore
//! cannot honor their full bundle.

use std::collections::BTreeSet;

use tracing::debug;

use crate::bidding::BiddingData;
use crate::bidding::PerNodeWinners;
use crate::rap::{AgentId, NodeId, Rap, ResourceVector};

/// Result of a multi-node election.
#[derive(Debug, Clone)]
pub struct ElectionOutcome {
    pub winners: PerNodeWinners,

    /// Per-node total demand of the winning cells at election time.
    pub winner_consumption: Vec<ResourceVector>,

    /// Per-agent set of nodes the agent bid on but did not win.
    pub lost_nodes: Vec<BTreeSet<NodeId>>,
}

impl ElectionOutcome {
    pub fn lost_nodes_of(&self, agent: AgentId) -> &BTreeSet<NodeId> {
        &self.lost_nodes[agent.index()]
    }
}

/// Score-to-demand ratio of a cell; `None` when the cell is zero or its
/// demand has zero norm (such candidates are ineligible).
pub fn bid_ratio(rap: &Rap, data: &BiddingData, node: NodeId, agent: AgentId) -> Option<f64> {
    let bid = data.get(node, agent);
    let consumption = bid.consumption()?;
    let norm = rap.norm(node, consumption);
    if norm <= 0.0 {
        return None;
    }
    Some(bid.score() as f64 / norm)
}

/// Greedy knapsack election for one node.
///
/// Candidates are scanned in ascending agent order, so ratio ties resolve
/// to the lowest agent name. Returns the winner set and the total demand of
/// the selected cells.
pub fn election_on_node(
    rap: &Rap,
    data: &BiddingData,
    node: NodeId,
    blacklist: &BTreeSet<AgentId>,
) -> (BTreeSet<AgentId>, ResourceVector) {
    let mut winners: BTreeSet<AgentId> = BTreeSet::new();
    let mut residual = rap.capacity(node).clone();

    loop {
        let mut best: Option<(AgentId, f64)> = None;

        for agent in rap.agents() {
            if blacklist.contains(&agent) || winners.contains(&agent) {
                continue;
            }
            let bid = data.get(node, agent);
            let Some(consumption) = bid.consumption() else {
                continue;
            };
            let norm = rap.norm(node, consumption);
            if norm <= 0.0 {
                continue;
            }
            let ratio = bid.score() as f64 / norm;
            // feasibility gates the update, not the scan
            if best.map_or(true, |(_, best_ratio)| ratio > best_ratio)
                && consumption.fits(&residual)
            {
                best = Some((agent, ratio));
            }
        }

        match best {
            Some((agent, ratio)) => {
                debug!(node = %rap.node_name(node), winner = %rap.agent_name(agent), ratio, "elected");
                if let Some(consumption) = data.get(node, agent).consumption() {
                    residual = residual.sub(consumption);
                }
                winners.insert(agent);
            }
            None => break,
        }
    }

    let consumed = rap.capacity(node).sub(&residual);
    (winners, consumed)
}

/// Elections over every node with false-winner elimination.
///
/// False winners are moved into the blacklist and the whole pass is rerun;
/// the blacklist grows monotonically so the recursion terminates.
pub fn multi_node_election(
    rap: &Rap,
    data: &BiddingData,
    blacklist: &BTreeSet<AgentId>,
) -> ElectionOutcome {
    let mut winners = PerNodeWinners::new(rap.node_count());
    let mut winner_consumption = Vec::with_capacity(rap.node_count());
    for node in rap.nodes() {
        let (node_winners, consumed) = election_on_node(rap, data, node, blacklist);
        winners.set(node, node_winners);
        winner_consumption.push(consumed);
    }

    let mut bid_nodes: Vec<BTreeSet<NodeId>> = Vec::with_capacity(rap.agent_count());
    let mut lost_nodes: Vec<BTreeSet<NodeId>> = Vec::with_capacity(rap.agent_count());
    for agent in rap.agents() {
        let bids = data.agent_bid_nodes(agent);
        let lost = bids
            .iter()
            .copied()
            .filter(|n| !winners.is_winner(*n, agent))
            .collect();
        bid_nodes.push(bids);
        lost_nodes.push(lost);
    }

    let false_winners = compute_false_winners(rap, data, &winners, &bid_nodes, &lost_nodes);
    if !false_winners.is_empty() {
        debug!(count = false_winners.len(), "false winners eliminated, rerunning election");
        let mut extended = blacklist.clone();
        extended.extend(false_winners.iter().copied());
        let rerun = multi_node_election(rap, data, &extended);

        // Agents that survived this round adopt the rerun's lost sets;
        // eliminated and already-blacklisted agents keep this round's view.
        let mut merged_lost = lost_nodes;
        for agent in rap.agents() {
            if !blacklist.contains(&agent) && !false_winners.contains(&agent) {
                merged_lost[agent.index()] = rerun.lost_nodes[agent.index()].clone();
            }
        }
        return ElectionOutcome {
            winners: rerun.winners,
            winner_consumption: rerun.winner_consumption,
            lost_nodes: merged_lost,
        };
    }

    ElectionOutcome {
        winners,
        winner_consumption,
        lost_nodes,
    }
}

/// Identify winners that cannot honor their bundle.
///
/// A winner holding lost nodes is genuine only when each of its losses can
/// be blamed on another (provisionally) false winner; provisional falses
/// are confirmed only when at least one of their own losses was against
/// agents that are not all false themselves. Ambiguities resolve in favor
/// of the higher maximum bid.
fn compute_false_winners(
    rap: &Rap,
    data: &BiddingData,
    winners: &PerNodeWinners,
    bid_nodes: &[BTreeSet<NodeId>],
    lost_nodes: &[BTreeSet<NodeId>],
) -> BTreeSet<AgentId> {
    let mut known: BTreeSet<AgentId> = BTreeSet::new();

    let max_bids: Vec<u64> = rap.agents().map(|a| data.max_score(a)).collect();

    let mut candidates: Vec<AgentId> = winners.all_winners().into_iter().collect();
    candidates.sort_by_key(|a| (std::cmp::Reverse(max_bids[a.index()]), *a));

    for agent in candidates {
        if known.contains(&agent) {
            continue;
        }
        if bid_nodes[agent.index()].is_empty() || lost_nodes[agent.index()].is_empty() {
            continue;
        }

        let mut collected: BTreeSet<AgentId> = BTreeSet::new();
        for node in &lost_nodes[agent.index()] {
            let (blamed, found) = find_false_winner(
                agent,
                *node,
                winners,
                &max_bids,
                bid_nodes,
                lost_nodes,
                &known,
                &[],
            );
            collected.extend(found);
            match blamed {
                Some(f) => {
                    collected.insert(f);
                }
                None => {
                    // the loss stands against genuine winners
                    known.insert(agent);
                    break;
                }
            }
        }

        // a provisional false is confirmed only by a loss against agents
        // that are not all false themselves
        for fake in collected {
            let really_lost = lost_nodes[fake.index()]
                .iter()
                .any(|n| winners.get(*n).iter().any(|w| !known.contains(w)));
            if really_lost {
                known.insert(fake);
            }
        }
    }

    known
}

/// Search the winners of `node` for one that, recursively, lost another
/// node for sure. The `ignore` chain breaks recursion cycles.
#[allow(clippy::too_many_arguments)]
fn find_false_winner(
    agent: AgentId,
    node: NodeId,
    winners: &PerNodeWinners,
    max_bids: &[u64],
    bid_nodes: &[BTreeSet<NodeId>],
    lost_nodes: &[BTreeSet<NodeId>],
    known: &BTreeSet<AgentId>,
    ignore: &[AgentId],
) -> (Option<AgentId>, BTreeSet<AgentId>) {
    let mut found: BTreeSet<AgentId> = BTreeSet::new();

    let mut node_winners: Vec<AgentId> = winners.get(node).iter().copied().collect();
    node_winners.sort_by_key(|a| (max_bids[a.index()], *a));

    for w in node_winners {
        if known.contains(&w) {
            return (Some(w), found);
        }
        if ignore.contains(&w) || bid_nodes[w.index()].is_empty() {
            continue;
        }
        for lost in &lost_nodes[w.index()] {
            let mut merged = known.clone();
            merged.extend(found.iter().copied());
            let mut chain = ignore.to_vec();
            chain.push(agent);
            let (other, others) = find_false_winner(
                w, *lost, winners, max_bids, bid_nodes, lost_nodes, &merged, &chain,
            );
            match other {
                None => {
                    // nothing saves w from this loss: w itself is false
                    return (Some(w), found);
                }
                Some(f) => {
                    found.insert(f);
                    found.extend(others);
                }
            }
        }
    }

    (None, found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidding::{Bid, Timestamp};
    use crate::rap::{Rap, RapSpec};

    fn grid_rap(agents: &[&str], nodes: usize, cpu: i64) -> Rap {
        let node_names: Vec<String> = (0..nodes).map(|i| format!("n{i}")).collect();
        let capacity: serde_json::Map<String, serde_json::Value> = node_names
            .iter()
            .map(|n| (n.clone(), serde_json::json!({"cpu": cpu})))
            .collect();
        let spec: RapSpec = serde_json::from_value(serde_json::json!({
            "sdos": agents,
            "services": ["s1"],
            "functions": ["f1"],
            "resources": ["cpu"],
            "nodes": node_names,
            "consumption": {"f1": {"cpu": 1}},
            "available_resources": capacity,
            "implementation": {"s1": ["f1"]}
        }))
        .unwrap();
        Rap::from_spec(spec).unwrap()
    }

    fn place(data: &mut BiddingData, rap: &Rap, node: &str, agent: &str, score: u64, cpu: i64) {
        data.set(
            rap.node_id(node).unwrap(),
            rap.agent_id(agent).unwrap(),
            Bid::active(
                score,
                ResourceVector::from_vec(vec![cpu]),
                Timestamp::from_secs(1.0),
            ),
        );
    }

    #[test]
    fn test_highest_ratio_wins() {
        let rap = grid_rap(&["a", "b"], 1, 4);
        let mut data = BiddingData::new(&rap);
        // a: ratio 10/4, b: ratio 20/4; both want the whole node
        place(&mut data, &rap, "n0", "a", 10, 4);
        place(&mut data, &rap, "n0", "b", 20, 4);

        let (winners, consumed) =
            election_on_node(&rap, &data, rap.node_id("n0").unwrap(), &BTreeSet::new());
        assert_eq!(winners, [rap.agent_id("b").unwrap()].into_iter().collect());
        assert_eq!(consumed, ResourceVector::from_vec(vec![4]));
    }

    #[test]
    fn test_ratio_tie_breaks_by_name() {
        let rap = grid_rap(&["zed", "alpha"], 1, 4);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "zed", 10, 4);
        place(&mut data, &rap, "n0", "alpha", 10, 4);

        let (winners, _) =
            election_on_node(&rap, &data, rap.node_id("n0").unwrap(), &BTreeSet::new());
        assert_eq!(
            winners,
            [rap.agent_id("alpha").unwrap()].into_iter().collect()
        );
    }

    #[test]
    fn test_packs_multiple_winners_under_capacity() {
        let rap = grid_rap(&["a", "b", "c"], 1, 4);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "a", 10, 2);
        place(&mut data, &rap, "n0", "b", 8, 2);
        place(&mut data, &rap, "n0", "c", 50, 4);

        // c has the best ratio and takes the node alone; nothing else fits
        let (winners, consumed) =
            election_on_node(&rap, &data, rap.node_id("n0").unwrap(), &BTreeSet::new());
        assert_eq!(winners, [rap.agent_id("c").unwrap()].into_iter().collect());
        assert_eq!(consumed, ResourceVector::from_vec(vec![4]));
    }

    #[test]
    fn test_infeasible_best_does_not_block_smaller() {
        let rap = grid_rap(&["a", "b"], 1, 4);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "a", 100, 8); // best ratio but never fits
        place(&mut data, &rap, "n0", "b", 4, 2);

        let (winners, _) =
            election_on_node(&rap, &data, rap.node_id("n0").unwrap(), &BTreeSet::new());
        assert_eq!(winners, [rap.agent_id("b").unwrap()].into_iter().collect());
    }

    #[test]
    fn test_zero_bids_never_win() {
        let rap = grid_rap(&["a", "b"], 1, 4);
        let data = BiddingData::new(&rap);
        let (winners, consumed) =
            election_on_node(&rap, &data, rap.node_id("n0").unwrap(), &BTreeSet::new());
        assert!(winners.is_empty());
        assert!(consumed.is_zero());
    }

    #[test]
    fn test_capacity_invariant_holds() {
        let rap = grid_rap(&["a", "b", "c", "d"], 2, 5);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "a", 9, 3);
        place(&mut data, &rap, "n0", "b", 7, 3);
        place(&mut data, &rap, "n0", "c", 5, 2);
        place(&mut data, &rap, "n1", "d", 4, 5);

        let outcome = multi_node_election(&rap, &data, &BTreeSet::new());
        for node in rap.nodes() {
            let mut total = ResourceVector::zeros(rap.resource_count());
            for agent in outcome.winners.get(node) {
                data.get(node, *agent).add_consumption_into(&mut total);
            }
            assert!(total.fits(rap.capacity(node)));
        }
    }

    #[test]
    fn test_winners_subset_of_bidders() {
        let rap = grid_rap(&["a", "b"], 2, 4);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "a", 10, 2);

        let outcome = multi_node_election(&rap, &data, &BTreeSet::new());
        for node in rap.nodes() {
            for agent in outcome.winners.get(node) {
                assert!(!data.get(node, *agent).is_zero());
            }
        }
        // b never bid, so it has no lost nodes either
        assert!(outcome
            .lost_nodes_of(rap.agent_id("b").unwrap())
            .is_empty());
    }

    #[test]
    fn test_false_winner_cascade() {
        // a wins n0 but loses n1 to b; b wins n1 but loses n2 to c;
        // c wins n2 outright. b is saved by nothing: its n2 loss stands
        // against genuine c, so b is false; after elimination a takes n1.
        let rap = grid_rap(&["a", "b", "c"], 3, 4);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "a", 10, 4);
        place(&mut data, &rap, "n1", "a", 10, 4);
        place(&mut data, &rap, "n1", "b", 20, 4);
        place(&mut data, &rap, "n2", "b", 20, 4);
        place(&mut data, &rap, "n2", "c", 30, 4);

        let outcome = multi_node_election(&rap, &data, &BTreeSet::new());
        let a = rap.agent_id("a").unwrap();
        let b = rap.agent_id("b").unwrap();
        let c = rap.agent_id("c").unwrap();

        assert!(outcome.winners.is_winner(rap.node_id("n0").unwrap(), a));
        assert!(outcome.winners.is_winner(rap.node_id("n1").unwrap(), a));
        assert!(outcome.winners.is_winner(rap.node_id("n2").unwrap(), c));
        assert!(!outcome.winners.all_winners().contains(&b));
        // b keeps its own pre-elimination lost view
        assert!(outcome
            .lost_nodes_of(b)
            .contains(&rap.node_id("n2").unwrap()));
        // a, after the rerun, lost nothing
        assert!(outcome.lost_nodes_of(a).is_empty());
    }

    #[test]
    fn test_no_winner_is_false_after_election() {
        // After a multi-node election no remaining winner may hold a loss
        // against a set of genuine winners.
        let rap = grid_rap(&["a", "b", "c", "d"], 3, 4);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "a", 12, 4);
        place(&mut data, &rap, "n0", "b", 11, 4);
        place(&mut data, &rap, "n1", "b", 11, 4);
        place(&mut data, &rap, "n1", "c", 9, 4);
        place(&mut data, &rap, "n2", "c", 9, 4);
        place(&mut data, &rap, "n2", "d", 14, 4);

        let outcome = multi_node_election(&rap, &data, &BTreeSet::new());
        let winners = outcome.winners.all_winners();
        for agent in &winners {
            // every surviving winner won every node it still bid on or its
            // losses are fully covered by eliminated agents
            for node in outcome.lost_nodes_of(*agent) {
                assert!(
                    outcome
                        .winners
                        .get(*node)
                        .iter()
                        .all(|w| !winners.contains(w) || outcome.lost_nodes_of(*w).is_empty()),
                    "loss of {} on {} stands against genuine winners",
                    rap.agent_name(*agent),
                    rap.node_name(*node),
                );
            }
        }
    }

    #[test]
    fn test_election_is_pure() {
        let rap = grid_rap(&["a", "b"], 1, 4);
        let mut data = BiddingData::new(&rap);
        place(&mut data, &rap, "n0", "a", 10, 2);
        place(&mut data, &rap, "n0", "b", 9, 2);

        let first = election_on_node(&rap, &data, rap.node_id("n0").unwrap(), &BTreeSet::new());
        let second = election_on_node(&rap, &data, rap.node_id("n0").unwrap(), &BTreeSet::new());
        assert_eq!(first, second);
    }
}
