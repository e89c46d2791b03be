//! The neighbor agreement engine.
//!
//! `AgreementEngine::multi_agreement` merges a batch of received bidding
//! states (one latest message per sender), re-runs the election, detects
//! overbidding, and classifies the outcome per sender and node through the
//! protocol's decision table. "UPDATE" in the table means "keep the merge
//! result"; the merge itself is never rolled back, the table only decides
//! rebroadcast, update and agreement flags.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};

use crate::bidding::{winners_digest, Bid, BiddingData, BiddingMessage, PerNodeWinners, Timestamp};
use crate::orchestrator::election::multi_node_election;
use crate::orchestrator::Orchestrator;
use crate::rap::{AgentId, NodeId, Rap};

/// Flags produced by one agreement round.
#[derive(Debug, Clone, Default)]
pub struct AgreementOutcome {
    /// Broadcast the (merged, possibly rebid) state to all neighbors.
    pub rebroadcast: bool,

    /// The merge or a reset materially changed local state.
    pub updated: bool,

    /// Every sender in the batch fully agreed on every node.
    pub agreement: bool,

    /// This agent lost every standing it had and wiped its bundle.
    pub overbid: bool,

    /// Senders whose view agreed with the merged local view on all nodes.
    pub per_sender_agreement: BTreeSet<AgentId>,
}

/// Per-agent consensus engine.
pub struct AgreementEngine {
    agent: AgentId,
    rap: Arc<Rap>,
    pending_rebid: bool,
}

impl AgreementEngine {
    pub fn new(agent: AgentId, rap: Arc<Rap>) -> Self {
        Self {
            agent,
            rap,
            pending_rebid: false,
        }
    }

    /// Whether an overbid is waiting for a rebid-enabled round.
    pub fn pending_rebid(&self) -> bool {
        self.pending_rebid
    }

    /// Merge a batch of neighbor states and classify the outcome.
    pub fn multi_agreement(
        &mut self,
        orchestrator: &mut Orchestrator,
        received: &BTreeMap<AgentId, BiddingMessage>,
        rebid_enabled: bool,
    ) -> AgreementOutcome {
        counter!("concord_agreement_rounds_total").increment(1);
        info!(senders = received.len(), "agreement round started");

        let snapshot = orchestrator.bidding_data.clone();
        let current_winners = orchestrator.per_node_winners.clone();

        self.merge(orchestrator, received);

        let election = multi_node_election(&self.rap, &orchestrator.bidding_data, &BTreeSet::new());
        orchestrator.per_node_winners = election.winners.clone();

        let overbid = !election.lost_nodes_of(self.agent).is_empty();
        if overbid {
            counter!("concord_overbids_total").increment(1);
            info!(agent = %self.rap.agent_name(self.agent), "agent has been overbid");
            orchestrator.reset_implementation();
            let now = Timestamp::now();
            for node in self.rap.nodes() {
                if !snapshot.get(node, self.agent).is_zero() {
                    orchestrator
                        .bidding_data
                        .set(node, self.agent, Bid::zero(now));
                }
            }
        }

        if rebid_enabled && (overbid || self.pending_rebid) {
            orchestrator.orchestrate();
            self.pending_rebid = false;
        } else if overbid {
            self.pending_rebid = true;
        }

        if overbid {
            return AgreementOutcome {
                rebroadcast: true,
                updated: true,
                agreement: false,
                overbid: true,
                per_sender_agreement: BTreeSet::new(),
            };
        }

        self.classify(orchestrator, received, &snapshot, &current_winners)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Merge
    // ─────────────────────────────────────────────────────────────────────────

    /// For every cell: a sender's self-report wins, local data about self is
    /// kept, and third-party cells adopt the freshest sender observation.
    fn merge(&self, orchestrator: &mut Orchestrator, received: &BTreeMap<AgentId, BiddingMessage>) {
        for node in self.rap.nodes() {
            for agent in self.rap.agents() {
                if let Some(message) = received.get(&agent) {
                    let cell = message.bidding_data.get(node, agent).clone();
                    orchestrator.bidding_data.set(node, agent, cell);
                } else if agent == self.agent {
                    // local data about self is authoritative
                } else {
                    let freshest = received
                        .values()
                        .map(|m| m.bidding_data.get(node, agent))
                        .max_by_key(|bid| bid.timestamp());
                    if let Some(cell) = freshest {
                        orchestrator.bidding_data.set(node, agent, cell.clone());
                    }
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Decision table
    // ─────────────────────────────────────────────────────────────────────────

    fn classify(
        &self,
        orchestrator: &mut Orchestrator,
        received: &BTreeMap<AgentId, BiddingMessage>,
        snapshot: &BiddingData,
        current_winners: &PerNodeWinners,
    ) -> AgreementOutcome {
        let mut outcome = AgreementOutcome {
            agreement: true,
            ..AgreementOutcome::default()
        };

        for (sender, message) in received {
            let mut sender_agreed = true;

            for node in self.rap.nodes() {
                let agreed_on_node = self.classify_node(
                    orchestrator,
                    *sender,
                    message,
                    snapshot,
                    current_winners,
                    node,
                    &mut outcome,
                );
                if !agreed_on_node {
                    sender_agreed = false;
                    outcome.agreement = false;
                }
                debug!(
                    sender = %self.rap.agent_name(*sender),
                    node = %self.rap.node_name(node),
                    agreed = agreed_on_node,
                    "node classified"
                );
            }

            if sender_agreed {
                outcome.per_sender_agreement.insert(*sender);
            }
            info!(
                sender = %self.rap.agent_name(*sender),
                agreed = sender_agreed,
                "sender classified"
            );
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_node(
        &self,
        orchestrator: &mut Orchestrator,
        sender: AgentId,
        message: &BiddingMessage,
        snapshot: &BiddingData,
        current_winners: &PerNodeWinners,
        node: NodeId,
        outcome: &mut AgreementOutcome,
    ) -> bool {
        let current_digest = winners_digest(current_winners.get(node), &self.rap);
        let received_digest = winners_digest(message.winners.get(node), &self.rap);
        let new_digest = winners_digest(orchestrator.per_node_winners.get(node), &self.rap);

        let current_consumption = snapshot.node_consumption_total(node);
        let received_consumption = message.bidding_data.node_consumption_total(node);
        let new_consumption = orchestrator.bidding_data.node_consumption_total(node);

        let swapped = current_winners.is_winner(node, sender)
            && !message.winners.is_winner(node, sender)
            && message.winners.is_winner(node, self.agent)
            && !current_winners.is_winner(node, self.agent);

        if swapped {
            // mutual overbid crossing in flight: drop the node and resettle
            info!(node = %self.rap.node_name(node), "swap detected, resetting node");
            let now = Timestamp::now();
            for agent in self.rap.agents() {
                orchestrator.bidding_data.set(node, agent, Bid::zero(now));
            }
            outcome.rebroadcast = true;
            outcome.updated = true;
            return false;
        }

        if current_digest == received_digest && received_digest == new_digest {
            match compare_bid_times(
                message.bidding_data.node_cells(node),
                snapshot.node_cells(node),
            ) {
                std::cmp::Ordering::Greater => {
                    if current_consumption == received_consumption
                        && current_consumption == new_consumption
                    {
                        // fresher stamps, identical allocation
                        outcome.updated = true;
                        true
                    } else {
                        outcome.rebroadcast = true;
                        outcome.updated = true;
                        false
                    }
                }
                std::cmp::Ordering::Equal => true,
                std::cmp::Ordering::Less => true,
            }
        } else if received_digest == new_digest {
            // the sender's view prevailed over ours
            outcome.rebroadcast = true;
            outcome.updated = true;
            received_consumption == current_consumption
        } else if current_digest == new_digest {
            // our view stands against the sender's; let them hear it again
            outcome.rebroadcast = true;
            false
        } else {
            outcome.rebroadcast = true;
            outcome.updated = true;
            false
        }
    }
}

/// Compare the per-agent bid timestamps of two node rows:
/// `Greater` when the first row carries at least one newer stamp, `Equal`
/// when every stamp matches, `Less` otherwise.
pub fn compare_bid_times(a: &[Bid], b: &[Bid]) -> std::cmp::Ordering {
    let mut all_equal = true;
    for (x, y) in a.iter().zip(b.iter()) {
        if x.timestamp() > y.timestamp() {
            return std::cmp::Ordering::Greater;
        }
        if x.timestamp() < y.timestamp() {
            all_equal = false;
        }
    }
    if all_equal {
        std::cmp::Ordering::Equal
    } else {
        std::cmp::Ordering::Less
    }
}
