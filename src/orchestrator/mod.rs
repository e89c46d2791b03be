//! Per-agent orchestration.
//!
//! `Orchestrator` owns the agent's mutable bidding state and builds its
//! implementation bundle:
//!
//! 1. **Strong attempt** — greedy embedding maximizes utility under per-node
//!    resource bounds; a local election decides whether the bundle would
//!    win. Lost nodes are blacklisted, their bound shrinks to the residual,
//!    and the attempt repeats.
//! 2. **Weak fallback** — when no strong bundle wins, patience embedding
//!    seeds the lightest feasible bundle inside the residual space and
//!    improves it function-by-function until nothing improves or the
//!    scheduling budget runs out.
//!
//! The output is deterministic given the bidding data at entry and the
//! utility oracle.

pub mod election;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, info};

use crate::bidding::{Bid, BiddingData, PerNodeWinners, Timestamp};
use crate::rap::{AgentId, FunctionId, NodeId, Rap, ResourceVector, ServiceId};
use crate::utility::{reference_from_bound, BundleContext, Placement, UtilityOracle};
use election::{bid_ratio, multi_node_election, ElectionOutcome};

// ═══════════════════════════════════════════════════════════════════════════════
// Bundles
// ═══════════════════════════════════════════════════════════════════════════════

/// A placement chosen during embedding.
#[derive(Debug, Clone)]
struct BundleChoice {
    slot: usize,
    function: FunctionId,
    node: NodeId,
    utility: f64,
    added_at: u64,
}

/// A finalized placement with its rounded utility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailedPlacement {
    pub service: String,
    pub function: FunctionId,
    pub node: NodeId,
    pub utility: u64,
}

/// A committed placement, ordered by service label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRecord {
    pub service: String,
    pub function: FunctionId,
    pub node: NodeId,
}

/// Backtracking signal: no candidate left at the requested skip depth.
struct NoFunctionsLeft;

// ═══════════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════════

/// The per-agent orchestration engine and its bidding state.
pub struct Orchestrator {
    agent: AgentId,
    rap: Arc<Rap>,
    oracle: Arc<dyn UtilityOracle>,
    /// Stable per-slot labels (`"<index>_<service>"`), part of the oracle's
    /// deterministic identity.
    slot_labels: Vec<String>,
    /// Per-slot services of the agent's bundle.
    slot_services: Vec<ServiceId>,
    scheduling_time_limit: Duration,

    /// The full node × agent bid matrix as this agent currently sees it.
    pub bidding_data: BiddingData,

    /// Winners of the most recent election over `bidding_data`.
    pub per_node_winners: PerNodeWinners,

    /// Monotonically non-increasing ceiling on `bid/norm(demand)` per node.
    pub per_node_max_bid_ratio: Vec<f64>,

    /// Committed placements, ordered by service label.
    pub implementation: Vec<PlacementRecord>,

    /// Committed placements with utilities, in the order they were added.
    pub detailed_implementation: Vec<DetailedPlacement>,

    /// Total private utility of the committed bundle.
    pub private_utility: u64,

    seq: u64,
}

impl Orchestrator {
    pub fn new(
        agent: AgentId,
        rap: Arc<Rap>,
        oracle: Arc<dyn UtilityOracle>,
        services: &[ServiceId],
        scheduling_time_limit: Duration,
    ) -> Self {
        let slot_labels = services
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}_{}", i, rap.service_name(*s)))
            .collect();
        let slot_services = services.to_vec();
        let bidding_data = BiddingData::new(&rap);
        let per_node_winners = PerNodeWinners::new(rap.node_count());
        let per_node_max_bid_ratio = vec![f64::INFINITY; rap.node_count()];
        Self {
            agent,
            rap,
            oracle,
            slot_labels,
            slot_services,
            scheduling_time_limit,
            bidding_data,
            per_node_winners,
            per_node_max_bid_ratio,
            implementation: Vec::new(),
            detailed_implementation: Vec::new(),
            private_utility: 0,
            seq: 0,
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn rap(&self) -> &Arc<Rap> {
        &self.rap
    }

    /// Union of winners over every node, per the last election.
    pub fn winners_set(&self) -> BTreeSet<AgentId> {
        self.per_node_winners.all_winners()
    }

    /// Whether this agent currently wins at least one node.
    pub fn is_winner(&self) -> bool {
        self.winners_set().contains(&self.agent)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orchestration rounds
    // ─────────────────────────────────────────────────────────────────────────

    /// Build a new implementation bundle and this agent's bid cells.
    pub fn orchestrate(&mut self) {
        counter!("concord_orchestrations_total").increment(1);
        info!(agent = %self.rap.agent_name(self.agent), "orchestration round started");

        self.bidding_data.clear_agent(self.agent, Timestamp::now());
        self.implementation.clear();
        self.detailed_implementation.clear();
        self.private_utility = 0;

        let mut resource_bound: Vec<ResourceVector> =
            self.rap.nodes().map(|n| self.rap.capacity(n).clone()).collect();
        let mut blacklist: BTreeSet<NodeId> = BTreeSet::new();
        let mut committed: Option<Vec<DetailedPlacement>> = None;
        let mut last_outcome: Option<ElectionOutcome> = None;

        while blacklist.len() < self.rap.node_count() {
            debug!(blacklisted = blacklist.len(), "searching for desired bundle");
            let Some(bundle) = self.greedy_embedding(&resource_bound, &blacklist) else {
                // No feasible desired bundle: release everything and run an
                // election just to discover the residual space.
                self.bidding_data.clear_agent(self.agent, Timestamp::now());
                let outcome = multi_node_election(&self.rap, &self.bidding_data, &BTreeSet::new());
                self.per_node_winners = outcome.winners.clone();
                last_outcome = Some(outcome);
                break;
            };

            // publish the candidate cells
            self.bidding_data.clear_agent(self.agent, Timestamp::now());
            let cells = self.build_assignment(&bundle);

            // a ceiling can clamp a node's score to nothing; such a bundle
            // cannot stand, so treat those nodes as lost outright
            let clamped_out: Vec<NodeId> = cells
                .iter()
                .filter(|(_, bid)| bid.is_zero())
                .map(|(node, _)| *node)
                .collect();
            if !clamped_out.is_empty() {
                debug!(nodes = clamped_out.len(), "ceiling clamped bundle to zero");
                blacklist.extend(clamped_out);
                continue;
            }

            for (node, bid) in cells {
                self.bidding_data.set(node, self.agent, bid);
            }

            let outcome = multi_node_election(&self.rap, &self.bidding_data, &BTreeSet::new());
            self.update_bid_ratio_bound(&outcome);
            self.per_node_winners = outcome.winners.clone();
            let lost = outcome.lost_nodes_of(self.agent).clone();

            if lost.is_empty() {
                committed = Some(bundle);
                last_outcome = Some(outcome);
                break;
            }

            debug!(lost = lost.len(), "bundle lost nodes, rebidding");
            for node in &lost {
                blacklist.insert(*node);
                self.bidding_data
                    .set(*node, self.agent, Bid::zero(Timestamp::now()));
                // bound the next attempt on this node to what the winners left
                let mut residual = self.rap.capacity(*node).clone();
                for w in outcome.winners.get(*node) {
                    if let Some(c) = self.bidding_data.get(*node, *w).consumption() {
                        residual = residual.sub(c);
                    }
                }
                resource_bound[node.index()] = residual;
            }
            last_outcome = Some(outcome);
        }

        if let Some(bundle) = committed {
            info!(agent = %self.rap.agent_name(self.agent), "strong winner");
            self.install_bundle(bundle);
        } else {
            // Weak fallback: fit whatever space the last election left over.
            info!(agent = %self.rap.agent_name(self.agent), "lost election, trying residual space");
            for node in self.rap.nodes() {
                self.per_node_winners.remove(node, self.agent);
            }
            self.bidding_data.clear_agent(self.agent, Timestamp::now());

            let residual: Vec<ResourceVector> = match &last_outcome {
                Some(outcome) => self
                    .rap
                    .nodes()
                    .map(|n| {
                        self.rap
                            .capacity(n)
                            .sub(&outcome.winner_consumption[n.index()])
                    })
                    .collect(),
                None => resource_bound.clone(),
            };

            let weak_cells = self
                .patience_embedding(&residual, &BTreeSet::new())
                .map(|bundle| (self.build_assignment(&bundle), bundle))
                // a score clamped to nothing cannot claim a node
                .filter(|(cells, _)| cells.iter().all(|(_, bid)| !bid.is_zero()));
            if let Some((cells, bundle)) = weak_cells {
                info!(agent = %self.rap.agent_name(self.agent), "weak winner");
                for (node, bid) in cells {
                    self.bidding_data.set(node, self.agent, bid);
                    self.per_node_winners.insert(node, self.agent);
                }
                self.install_bundle(bundle);
            } else {
                info!(agent = %self.rap.agent_name(self.agent), "no bundle fits the residual space");
            }
        }

        // lock in the ratio limits for future rebidding
        for node in self.rap.nodes() {
            if self.per_node_winners.is_winner(node, self.agent) {
                if let Some(ratio) = bid_ratio(&self.rap, &self.bidding_data, node, self.agent) {
                    let bound = &mut self.per_node_max_bid_ratio[node.index()];
                    *bound = bound.min(ratio);
                }
            }
        }
    }

    /// Wipe the committed bundle and utility (an overbid was detected).
    pub fn reset_implementation(&mut self) {
        self.implementation.clear();
        self.detailed_implementation.clear();
        self.private_utility = 0;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scoring
    // ─────────────────────────────────────────────────────────────────────────

    /// Translate a bundle into this agent's per-node bid cells, clamping
    /// each score to the node's bid-ratio ceiling.
    fn build_assignment(&self, bundle: &[DetailedPlacement]) -> Vec<(NodeId, Bid)> {
        let ts = Timestamp::now();
        let mut per_node: BTreeMap<NodeId, (u64, Vec<FunctionId>)> = BTreeMap::new();
        for item in bundle {
            let entry = per_node.entry(item.node).or_insert((0, Vec::new()));
            entry.0 += item.utility;
            entry.1.push(item.function);
        }

        per_node
            .into_iter()
            .map(|(node, (mut score, functions))| {
                let consumption = self.rap.bundle_consumption(functions.into_iter());
                let norm = self.rap.norm(node, &consumption);
                let ceiling = self.per_node_max_bid_ratio[node.index()];
                if norm > 0.0 && ceiling.is_finite() && score as f64 / norm > ceiling {
                    score = (norm * ceiling).floor() as u64;
                }
                (node, Bid::active(score, consumption, ts))
            })
            .collect()
    }

    /// Tighten the per-node ceiling from an election outcome.
    ///
    /// Only nodes this agent is engaged with are touched (it won there,
    /// lost there, or had already set a ceiling). On loss the stored bound
    /// sits one ULP below the worst winning ratio.
    fn update_bid_ratio_bound(&mut self, outcome: &ElectionOutcome) {
        let lost = outcome.lost_nodes_of(self.agent);
        for node in self.rap.nodes() {
            let winners = outcome.winners.get(node);
            if winners.is_empty() {
                continue;
            }
            let engaged = winners.contains(&self.agent)
                || lost.contains(&node)
                || self.per_node_max_bid_ratio[node.index()].is_finite();
            if !engaged {
                continue;
            }

            let mut min_ratio = f64::INFINITY;
            for w in winners {
                if let Some(r) = bid_ratio(&self.rap, &self.bidding_data, node, *w) {
                    min_ratio = min_ratio.min(r);
                }
            }
            if !min_ratio.is_finite() {
                continue;
            }

            let own_ratio = bid_ratio(&self.rap, &self.bidding_data, node, self.agent);
            let beaten = match own_ratio {
                Some(own) if winners.contains(&self.agent) => min_ratio < own,
                _ => true,
            };
            if beaten {
                min_ratio = next_down(min_ratio);
            }

            let bound = &mut self.per_node_max_bid_ratio[node.index()];
            *bound = bound.min(min_ratio);
        }
    }

    fn install_bundle(&mut self, bundle: Vec<DetailedPlacement>) {
        self.private_utility = bundle.iter().map(|p| p.utility).sum();
        let mut records: Vec<PlacementRecord> = bundle
            .iter()
            .map(|p| PlacementRecord {
                service: p.service.clone(),
                function: p.function,
                node: p.node,
            })
            .collect();
        records.sort_by(|a, b| a.service.cmp(&b.service));
        self.implementation = records;
        self.detailed_implementation = bundle;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Greedy embedding
    // ─────────────────────────────────────────────────────────────────────────

    /// Maximize utility: repeatedly take the best-ranked `(service,
    /// function, node)` that keeps the partial bundle inside
    /// `resource_bound`, backtracking through a per-depth skip vector when
    /// a depth exhausts its candidates.
    fn greedy_embedding(
        &mut self,
        resource_bound: &[ResourceVector],
        blacklist: &BTreeSet<NodeId>,
    ) -> Option<Vec<DetailedPlacement>> {
        let mut choices: Vec<BundleChoice> = Vec::new();
        let mut skip = vec![0usize; self.slot_services.len()];

        while choices.len() < self.slot_services.len() {
            let depth = choices.len();
            match self.next_best_service(&choices, skip[depth], blacklist) {
                Ok((slot, function, node, utility)) => {
                    let added_at = self.next_seq();
                    choices.push(BundleChoice {
                        slot,
                        function,
                        node,
                        utility,
                        added_at,
                    });
                    if !self.fits_bound(&choices, resource_bound) {
                        choices.pop();
                        skip[depth] += 1;
                    }
                }
                Err(NoFunctionsLeft) => {
                    skip[depth] = 0;
                    choices.pop()?;
                    skip[choices.len()] += 1;
                }
            }
        }

        Some(self.finalize(choices))
    }

    /// The `skip`-th best candidate over all unplaced services. Candidates
    /// need positive marginal utility.
    fn next_best_service(
        &self,
        choices: &[BundleChoice],
        skip: usize,
        blacklist: &BTreeSet<NodeId>,
    ) -> std::result::Result<(usize, FunctionId, NodeId, f64), NoFunctionsLeft> {
        let placed = placements_of(choices);
        let ctx = self.bundle_context(&placed);

        let mut ranked: Vec<(f64, usize, FunctionId, NodeId)> = Vec::new();
        for slot in 0..self.slot_services.len() {
            if choices.iter().any(|c| c.slot == slot) {
                continue;
            }
            for function in self.rap.implementations_for(self.slot_services[slot]) {
                for node in self.rap.nodes() {
                    if blacklist.contains(&node) {
                        continue;
                    }
                    let utility = self
                        .oracle
                        .marginal_utility(&self.rap, &ctx, slot, *function, node);
                    if utility > 0.0 {
                        ranked.push((utility, slot, *function, node));
                    }
                }
            }
        }

        ranked.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });

        ranked
            .get(skip)
            .map(|&(utility, slot, function, node)| (slot, function, node, utility))
            .ok_or(NoFunctionsLeft)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Patience embedding
    // ─────────────────────────────────────────────────────────────────────────

    /// Fit the residual space: seed with the lightest feasible function per
    /// service, then keep substituting the next heavier function that still
    /// fits and raises utility, until nothing improves or the scheduling
    /// budget is exhausted.
    fn patience_embedding(
        &mut self,
        resource_bound: &[ResourceVector],
        blacklist: &BTreeSet<NodeId>,
    ) -> Option<Vec<DetailedPlacement>> {
        let deadline = Instant::now() + self.scheduling_time_limit;
        let mut choices: Vec<BundleChoice> = Vec::new();
        let mut floor = vec![0.0f64; self.slot_services.len()];

        // seed: lightest feasible bundle
        while choices.len() < self.slot_services.len() {
            let placed_slots: BTreeSet<usize> = choices.iter().map(|c| c.slot).collect();
            let mut excluded = blacklist.clone();
            excluded.extend(self.completed_bid_nodes(&choices, None));

            let (slot, function, node, utility) =
                self.next_lighter_service(&choices, &floor, &placed_slots, &excluded, resource_bound)?;
            let added_at = self.next_seq();
            choices.push(BundleChoice {
                slot,
                function,
                node,
                utility,
                added_at,
            });
            if !self.fits_bound(&choices, resource_bound) {
                // even the lightest bundle does not fit
                return None;
            }
        }

        // improve: walk each service up the size order while it pays off
        for choice in &choices {
            floor[choice.slot] = crate::utility::average_consumption(
                &self.rap,
                choice.function,
                &reference_from_bound(&resource_bound[choice.node.index()]),
            );
        }
        let mut not_improvable: BTreeSet<usize> = BTreeSet::new();

        while not_improvable.len() < choices.len() {
            let mut excluded = blacklist.clone();
            excluded.extend(self.completed_bid_nodes(&choices, Some(&not_improvable)));

            let Some((slot, function, node, utility)) = self.next_lighter_service(
                &choices,
                &floor,
                &not_improvable,
                &excluded,
                resource_bound,
            ) else {
                break;
            };
            floor[slot] = crate::utility::average_consumption(
                &self.rap,
                function,
                &reference_from_bound(&resource_bound[node.index()]),
            );

            let Some(idx) = choices.iter().position(|c| c.slot == slot) else {
                break;
            };
            if utility > choices[idx].utility {
                let previous = choices[idx].clone();
                let added_at = self.next_seq();
                choices[idx] = BundleChoice {
                    slot,
                    function,
                    node,
                    utility,
                    added_at,
                };
                if !self.fits_bound(&choices, resource_bound) {
                    choices[idx] = previous;
                    not_improvable.insert(slot);
                } else if Instant::now() > deadline {
                    debug!("scheduling budget exhausted, keeping current improvement");
                    break;
                }
            }
        }

        Some(self.finalize(choices))
    }

    /// The globally lightest `(service, function, node)` candidate that is
    /// strictly heavier than the service's current size floor.
    fn next_lighter_service(
        &self,
        choices: &[BundleChoice],
        floor: &[f64],
        skip_slots: &BTreeSet<usize>,
        blacklist: &BTreeSet<NodeId>,
        resource_bound: &[ResourceVector],
    ) -> Option<(usize, FunctionId, NodeId, f64)> {
        let mut best: Option<(usize, FunctionId, NodeId, f64)> = None;
        let mut best_weight = f64::INFINITY;

        for slot in 0..self.slot_services.len() {
            if skip_slots.contains(&slot) {
                continue;
            }
            let free: Vec<BundleChoice> = choices
                .iter()
                .filter(|c| c.slot != slot)
                .cloned()
                .collect();
            let placed = placements_of(&free);
            let ctx = self.bundle_context(&placed);

            for function in self.rap.implementations_for(self.slot_services[slot]) {
                for node in self.rap.nodes() {
                    if blacklist.contains(&node) {
                        continue;
                    }
                    let weight = crate::utility::average_consumption(
                        &self.rap,
                        *function,
                        &reference_from_bound(&resource_bound[node.index()]),
                    );
                    if best_weight > weight && weight > floor[slot] {
                        let utility =
                            self.oracle
                                .marginal_utility(&self.rap, &ctx, slot, *function, node);
                        best_weight = weight;
                        best = Some((slot, *function, node, utility));
                    }
                }
            }
        }

        best
    }

    /// Nodes the bundle already uses, except the most recently relevant
    /// one: that is the only used node where the bid can still change.
    fn completed_bid_nodes(
        &self,
        choices: &[BundleChoice],
        consider: Option<&BTreeSet<usize>>,
    ) -> BTreeSet<NodeId> {
        let mut ordered: Vec<&BundleChoice> = choices
            .iter()
            .filter(|c| consider.map_or(true, |set| set.contains(&c.slot)))
            .collect();
        ordered.sort_by(|a, b| {
            b.utility
                .total_cmp(&a.utility)
                .then(a.added_at.cmp(&b.added_at))
        });
        let used: Vec<NodeId> = ordered.iter().map(|c| c.node).collect();
        match used.split_last() {
            Some((last, rest)) => rest.iter().copied().filter(|n| n != last).collect(),
            None => BTreeSet::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn bundle_context<'a>(&'a self, placed: &'a [Placement]) -> BundleContext<'a> {
        BundleContext {
            labels: &self.slot_labels,
            services: &self.slot_services,
            placed,
        }
    }

    /// Whether the bundle's per-node demand fits the given bound.
    fn fits_bound(&self, choices: &[BundleChoice], resource_bound: &[ResourceVector]) -> bool {
        let mut per_node: BTreeMap<NodeId, ResourceVector> = BTreeMap::new();
        for choice in choices {
            per_node
                .entry(choice.node)
                .or_insert_with(|| ResourceVector::zeros(self.rap.resource_count()))
                .add_assign(self.rap.function_consumption(choice.function));
        }
        per_node
            .iter()
            .all(|(node, demand)| demand.fits(&resource_bound[node.index()]))
    }

    fn finalize(&self, mut choices: Vec<BundleChoice>) -> Vec<DetailedPlacement> {
        choices.sort_by_key(|c| c.added_at);
        choices
            .into_iter()
            .map(|c| DetailedPlacement {
                service: self.slot_labels[c.slot].clone(),
                function: c.function,
                node: c.node,
                utility: c.utility.round() as u64,
            })
            .collect()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

fn placements_of(choices: &[BundleChoice]) -> Vec<Placement> {
    let mut sorted: Vec<&BundleChoice> = choices.iter().collect();
    sorted.sort_by_key(|c| c.added_at);
    sorted
        .into_iter()
        .map(|c| Placement {
            slot: c.slot,
            function: c.function,
            node: c.node,
        })
        .collect()
}

/// The next representable double below `x`.
fn next_down(x: f64) -> f64 {
    if x.is_nan() || x == f64::NEG_INFINITY {
        return x;
    }
    if x == 0.0 {
        return -f64::from_bits(1);
    }
    if x > 0.0 {
        f64::from_bits(x.to_bits() - 1)
    } else {
        f64::from_bits(x.to_bits() + 1)
    }
}
