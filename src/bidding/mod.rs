//! Bidding state and wire messages.
//!
//! A `Bid` is either ZERO ("not bidding on this node") or ACTIVE with a
//! score, a demand vector and a freshness timestamp. `BiddingData` is the
//! full node × agent matrix every agent maintains; `BiddingMessage` is what
//! travels between neighbors. In memory everything is integer-indexed; the
//! wire codec translates ids to names at the transport boundary.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ConcordError, ErrorCode, Result};
use crate::rap::{AgentId, NodeId, Rap, ResourceVector};

// ═══════════════════════════════════════════════════════════════════════════════
// Timestamps
// ═══════════════════════════════════════════════════════════════════════════════

/// Wall-clock seconds used only as a freshness order during merge; never a
/// clock of record. NaN is rejected at construction so ordering is total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamp(f64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0.0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_micros() as f64 / 1_000_000.0)
    }

    /// Build from raw seconds, sanitizing NaN to zero.
    pub fn from_secs(secs: f64) -> Self {
        if secs.is_nan() {
            Self(0.0)
        } else {
            Self(secs)
        }
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bids
// ═══════════════════════════════════════════════════════════════════════════════

/// One (node, agent) cell of the bidding matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum Bid {
    /// Not bidding on this node.
    Zero { timestamp: Timestamp },

    /// An active bid: score, demand and freshness.
    Active {
        score: u64,
        consumption: ResourceVector,
        timestamp: Timestamp,
    },
}

impl Bid {
    /// A zero bid stamped with the given time.
    pub fn zero(timestamp: Timestamp) -> Self {
        Bid::Zero { timestamp }
    }

    /// An active bid. A zero score or an all-zero demand collapses to the
    /// ZERO variant so "not bidding" has a single representation.
    pub fn active(score: u64, consumption: ResourceVector, timestamp: Timestamp) -> Self {
        if score == 0 || consumption.is_zero() {
            Bid::Zero { timestamp }
        } else {
            Bid::Active {
                score,
                consumption,
                timestamp,
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Bid::Zero { .. })
    }

    pub fn score(&self) -> u64 {
        match self {
            Bid::Zero { .. } => 0,
            Bid::Active { score, .. } => *score,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Bid::Zero { timestamp } | Bid::Active { timestamp, .. } => *timestamp,
        }
    }

    pub fn consumption(&self) -> Option<&ResourceVector> {
        match self {
            Bid::Zero { .. } => None,
            Bid::Active { consumption, .. } => Some(consumption),
        }
    }

    /// Add this bid's demand into an accumulator.
    pub fn add_consumption_into(&self, acc: &mut ResourceVector) {
        if let Bid::Active { consumption, .. } = self {
            acc.add_assign(consumption);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bidding matrix
// ═══════════════════════════════════════════════════════════════════════════════

/// The node × agent bid matrix. Every cell always exists; ZERO means the
/// agent is not bidding there.
#[derive(Debug, Clone, PartialEq)]
pub struct BiddingData {
    resource_count: usize,
    /// `cells[node][agent]`
    cells: Vec<Vec<Bid>>,
}

impl BiddingData {
    /// An all-zero matrix for the given instance.
    pub fn new(rap: &Rap) -> Self {
        Self {
            resource_count: rap.resource_count(),
            cells: vec![vec![Bid::zero(Timestamp::ZERO); rap.agent_count()]; rap.node_count()],
        }
    }

    pub fn get(&self, node: NodeId, agent: AgentId) -> &Bid {
        &self.cells[node.index()][agent.index()]
    }

    pub fn set(&mut self, node: NodeId, agent: AgentId, bid: Bid) {
        self.cells[node.index()][agent.index()] = bid;
    }

    /// All cells of one node, indexed by agent.
    pub fn node_cells(&self, node: NodeId) -> &[Bid] {
        &self.cells[node.index()]
    }

    /// Nodes where the agent holds a non-zero bid.
    pub fn agent_bid_nodes(&self, agent: AgentId) -> BTreeSet<NodeId> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, row)| !row[agent.index()].is_zero())
            .map(|(n, _)| NodeId(n as u16))
            .collect()
    }

    /// The agent's highest score across all nodes.
    pub fn max_score(&self, agent: AgentId) -> u64 {
        self.cells
            .iter()
            .map(|row| row[agent.index()].score())
            .max()
            .unwrap_or(0)
    }

    /// Sum of all agents' demand on a node (ignores election filtering).
    pub fn node_consumption_total(&self, node: NodeId) -> ResourceVector {
        let mut total = ResourceVector::zeros(self.resource_count);
        for bid in &self.cells[node.index()] {
            bid.add_consumption_into(&mut total);
        }
        total
    }

    /// Zero the agent's cell on every node, stamping the given time.
    pub fn clear_agent(&mut self, agent: AgentId, timestamp: Timestamp) {
        for row in &mut self.cells {
            row[agent.index()] = Bid::zero(timestamp);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Winners
// ═══════════════════════════════════════════════════════════════════════════════

/// The election outcome: the winning agents per node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PerNodeWinners(Vec<BTreeSet<AgentId>>);

impl PerNodeWinners {
    pub fn new(node_count: usize) -> Self {
        Self(vec![BTreeSet::new(); node_count])
    }

    pub fn get(&self, node: NodeId) -> &BTreeSet<AgentId> {
        &self.0[node.index()]
    }

    pub fn set(&mut self, node: NodeId, winners: BTreeSet<AgentId>) {
        self.0[node.index()] = winners;
    }

    pub fn insert(&mut self, node: NodeId, agent: AgentId) {
        self.0[node.index()].insert(agent);
    }

    pub fn remove(&mut self, node: NodeId, agent: AgentId) {
        self.0[node.index()].remove(&agent);
    }

    pub fn is_winner(&self, node: NodeId, agent: AgentId) -> bool {
        self.0[node.index()].contains(&agent)
    }

    /// Union of winners over every node.
    pub fn all_winners(&self) -> BTreeSet<AgentId> {
        self.0.iter().flatten().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.0.len()
    }
}

/// Digest of a winner set, used by the agreement decision table. Two sets
/// digest equal iff they contain the same agents.
pub fn winners_digest(winners: &BTreeSet<AgentId>, rap: &Rap) -> String {
    let mut hasher = Sha256::new();
    for agent in winners {
        hasher.update(rap.agent_name(*agent).as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════════

/// A neighbor-to-neighbor state exchange.
#[derive(Debug, Clone)]
pub struct BiddingMessage {
    pub sender: AgentId,
    pub winners: PerNodeWinners,
    pub bidding_data: BiddingData,
    pub timestamp: Timestamp,
}

/// JSON wire shape of a bid cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidWire {
    pub bid: u64,
    pub consumption: BTreeMap<String, i64>,
    pub timestamp: f64,
}

/// JSON wire shape of a `BiddingMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiddingMessageWire {
    pub sender: String,
    pub winners: BTreeMap<String, Vec<String>>,
    pub bidding_data: BTreeMap<String, BTreeMap<String, BidWire>>,
    pub timestamp: f64,
}

impl BiddingMessage {
    /// Encode for the wire, translating ids to names.
    pub fn to_wire(&self, rap: &Rap) -> BiddingMessageWire {
        let mut winners = BTreeMap::new();
        let mut bidding_data = BTreeMap::new();

        for node in rap.nodes() {
            let node_name = rap.node_name(node).to_string();
            winners.insert(
                node_name.clone(),
                self.winners
                    .get(node)
                    .iter()
                    .map(|a| rap.agent_name(*a).to_string())
                    .collect(),
            );

            let mut row = BTreeMap::new();
            for agent in rap.agents() {
                let bid = self.bidding_data.get(node, agent);
                let mut consumption = BTreeMap::new();
                for i in 0..rap.resource_count() {
                    let amount = bid.consumption().map_or(0, |c| c[i]);
                    consumption.insert(
                        rap.resource_name(crate::rap::ResourceId(i as u16)).to_string(),
                        amount,
                    );
                }
                row.insert(
                    rap.agent_name(agent).to_string(),
                    BidWire {
                        bid: bid.score(),
                        consumption,
                        timestamp: bid.timestamp().as_secs(),
                    },
                );
            }
            bidding_data.insert(node_name, row);
        }

        BiddingMessageWire {
            sender: rap.agent_name(self.sender).to_string(),
            winners,
            bidding_data,
            timestamp: self.timestamp.as_secs(),
        }
    }

    /// Decode from the wire. Unknown agent/node names are rejected; missing
    /// cells decode as zero bids.
    pub fn from_wire(wire: &BiddingMessageWire, rap: &Rap) -> Result<Self> {
        let sender = rap.agent_id(&wire.sender).ok_or_else(|| {
            ConcordError::with_internal(
                ErrorCode::DeserializationError,
                "Message from unknown sender",
                wire.sender.clone(),
            )
        })?;

        let mut winners = PerNodeWinners::new(rap.node_count());
        for (node_name, agent_names) in &wire.winners {
            let node = rap.node_id(node_name).ok_or_else(|| {
                ConcordError::with_internal(
                    ErrorCode::DeserializationError,
                    "Message references unknown node",
                    node_name.clone(),
                )
            })?;
            let mut set = BTreeSet::new();
            for name in agent_names {
                let agent = rap.agent_id(name).ok_or_else(|| {
                    ConcordError::with_internal(
                        ErrorCode::DeserializationError,
                        "Message references unknown agent",
                        name.clone(),
                    )
                })?;
                set.insert(agent);
            }
            winners.set(node, set);
        }

        let mut bidding_data = BiddingData::new(rap);
        for (node_name, row) in &wire.bidding_data {
            let node = rap.node_id(node_name).ok_or_else(|| {
                ConcordError::with_internal(
                    ErrorCode::DeserializationError,
                    "Message references unknown node",
                    node_name.clone(),
                )
            })?;
            for (agent_name, cell) in row {
                let agent = rap.agent_id(agent_name).ok_or_else(|| {
                    ConcordError::with_internal(
                        ErrorCode::DeserializationError,
                        "Message references unknown agent",
                        agent_name.clone(),
                    )
                })?;
                let mut consumption = ResourceVector::zeros(rap.resource_count());
                for (resource_name, amount) in &cell.consumption {
                    let idx = (0..rap.resource_count())
                        .find(|i| {
                            rap.resource_name(crate::rap::ResourceId(*i as u16)) == resource_name
                        })
                        .ok_or_else(|| {
                            ConcordError::with_internal(
                                ErrorCode::DeserializationError,
                                "Message references unknown resource",
                                resource_name.clone(),
                            )
                        })?;
                    consumption[idx] = *amount;
                }
                bidding_data.set(
                    node,
                    agent,
                    Bid::active(cell.bid, consumption, Timestamp::from_secs(cell.timestamp)),
                );
            }
        }

        Ok(Self {
            sender,
            winners,
            bidding_data,
            timestamp: Timestamp::from_secs(wire.timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rap::tests::toy_rap;

    #[test]
    fn test_zero_bid_normalization() {
        let bid = Bid::active(0, ResourceVector::from_vec(vec![1, 1]), Timestamp::ZERO);
        assert!(bid.is_zero());
        let bid = Bid::active(5, ResourceVector::zeros(2), Timestamp::ZERO);
        assert!(bid.is_zero());
        let bid = Bid::active(5, ResourceVector::from_vec(vec![1, 0]), Timestamp::ZERO);
        assert!(!bid.is_zero());
    }

    #[test]
    fn test_bidding_data_accessors() {
        let rap = toy_rap(&["a", "b"]);
        let mut data = BiddingData::new(&rap);
        let n0 = rap.node_id("n0").unwrap();
        let a = rap.agent_id("a").unwrap();
        data.set(
            n0,
            a,
            Bid::active(10, ResourceVector::from_vec(vec![2, 2]), Timestamp::now()),
        );

        assert_eq!(data.max_score(a), 10);
        assert_eq!(data.agent_bid_nodes(a), [n0].into_iter().collect());
        assert_eq!(
            data.node_consumption_total(n0),
            ResourceVector::from_vec(vec![2, 2])
        );

        data.clear_agent(a, Timestamp::now());
        assert!(data.agent_bid_nodes(a).is_empty());
    }

    #[test]
    fn test_winners_digest_equality() {
        let rap = toy_rap(&["a", "b", "c"]);
        let set1: BTreeSet<AgentId> = [rap.agent_id("a").unwrap(), rap.agent_id("c").unwrap()]
            .into_iter()
            .collect();
        let set2: BTreeSet<AgentId> = [rap.agent_id("c").unwrap(), rap.agent_id("a").unwrap()]
            .into_iter()
            .collect();
        let set3: BTreeSet<AgentId> = [rap.agent_id("b").unwrap()].into_iter().collect();
        assert_eq!(winners_digest(&set1, &rap), winners_digest(&set2, &rap));
        assert_ne!(winners_digest(&set1, &rap), winners_digest(&set3, &rap));
    }

    #[test]
    fn test_wire_round_trip() {
        let rap = toy_rap(&["a", "b"]);
        let n1 = rap.node_id("n1").unwrap();
        let b = rap.agent_id("b").unwrap();

        let mut data = BiddingData::new(&rap);
        data.set(
            n1,
            b,
            Bid::active(
                42,
                ResourceVector::from_vec(vec![3, 1]),
                Timestamp::from_secs(12.5),
            ),
        );
        let mut winners = PerNodeWinners::new(rap.node_count());
        winners.insert(n1, b);

        let message = BiddingMessage {
            sender: b,
            winners,
            bidding_data: data,
            timestamp: Timestamp::from_secs(13.0),
        };

        let wire = message.to_wire(&rap);
        let json = serde_json::to_string(&wire).unwrap();
        let parsed: BiddingMessageWire = serde_json::from_str(&json).unwrap();
        let decoded = BiddingMessage::from_wire(&parsed, &rap).unwrap();

        assert_eq!(decoded.sender, b);
        assert!(decoded.winners.is_winner(n1, b));
        assert_eq!(decoded.bidding_data.get(n1, b).score(), 42);
        assert_eq!(
            decoded.bidding_data.get(n1, b).consumption().unwrap(),
            &ResourceVector::from_vec(vec![3, 1])
        );
        assert_eq!(decoded.timestamp, Timestamp::from_secs(13.0));
    }

    #[test]
    fn test_wire_unknown_sender_rejected() {
        let rap = toy_rap(&["a"]);
        let wire = BiddingMessageWire {
            sender: "stranger".to_string(),
            winners: BTreeMap::new(),
            bidding_data: BTreeMap::new(),
            timestamp: 0.0,
        };
        assert!(BiddingMessage::from_wire(&wire, &rap).is_err());
    }

    #[test]
    fn test_nan_timestamp_sanitized() {
        assert_eq!(Timestamp::from_secs(f64::NAN), Timestamp::ZERO);
    }
}
