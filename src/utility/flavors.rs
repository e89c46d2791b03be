//! Concrete private utility flavors.
//!
//! All flavors are deterministic: every pseudo-random factor is derived
//! from SHA-256 digests of the agent identity and the call arguments, so a
//! rerun of the same agent over the same instance produces identical bids.
//!
//! The submodular machinery mirrors the experimental policy family this
//! engine was built for: a chain of `[0, 1]` bounds, one per bundle
//! position, each warped by a digest-selected transformation and multiplied
//! into its predecessor. The `[inf, sup]` window for a call is the last
//! pair of the chain, which shrinks as the bundle grows, bounding marginal
//! gains from above.

use sha2::{Digest, Sha256};

use crate::rap::{FunctionId, NodeId, Rap};
use crate::utility::{average_consumption, infrastructure_average, BundleContext, UtilityOracle};

// ═══════════════════════════════════════════════════════════════════════════════
// Deterministic pseudo-randomness
// ═══════════════════════════════════════════════════════════════════════════════

/// SHA-256 of the concatenated parts, folded into `[0, 1)`.
fn hash_unit(parts: &[&str]) -> f64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    let digest = hasher.finalize();
    let mut value = 0u64;
    for byte in &digest[..8] {
        value = (value << 8) | *byte as u64;
    }
    value as f64 / (u64::MAX as f64 + 1.0)
}

/// Generalized logistic curve spreading a small consumption fraction over
/// `[0, 1]`: `1 / (1 + q·e^(-b·x))` with `b = 30`, `q = e^3`.
fn spread(x: f64) -> f64 {
    1.0 / (1.0 + 20.0855_f64 * (-30.0 * x).exp())
}

/// A digest-selected monotone warp of `[0, 1]`.
fn transform_bound(x: f64, services: &[&str], functions: &[&str]) -> f64 {
    let mut forward: Vec<&str> = vec![""];
    forward.extend_from_slice(services);
    forward.extend_from_slice(functions);
    let mut backward: Vec<&str> = vec![""];
    backward.extend_from_slice(functions);
    backward.extend_from_slice(services);

    let pr1 = hash_unit(&forward);
    let pr2 = hash_unit(&backward);

    if pr1 > 0.5 {
        // polynomial / root curve
        let mut power = (5.0 - 1.0) * pr2 + 1.0;
        if (pr1 * 100.0) as u64 % 2 == 0 {
            power = 1.0 / power;
        }
        x.powf(power)
    } else {
        // x + sin warp
        let b = ((5.0 - 2.0) * pr2 + 2.0) as i64 as f64;
        let mut a = ((5.0 - b) * pr1 + b) as i64 as f64;
        if (pr1 * 100.0) as u64 % 2 != 0 {
            a = -a;
        }
        x + 1.0 / (a * std::f64::consts::PI) * (b * std::f64::consts::PI * x).sin()
    }
}

/// The `[inf, sup]` utility window for the next bundle position.
///
/// Without submodularity the window is the full `[1, 100]`. With it, the
/// per-position bound chain is warped and accumulated so that each
/// additional placement sees a window no larger than the previous one.
fn utility_window(
    bundle_len: usize,
    taken_services: &[&str],
    taken_functions: &[&str],
    submodular: bool,
) -> (f64, f64) {
    if !submodular {
        return (1.0, 100.0);
    }

    let positions = taken_services.len() + 2;
    let mut transformed: Vec<f64> = Vec::with_capacity(positions);
    for index in 0..positions {
        let bound = (bundle_len as f64 - index as f64) / bundle_len as f64;
        let warped = transform_bound(
            bound.max(0.0),
            &taken_services[..index.min(taken_services.len())],
            &taken_functions[..index.min(taken_functions.len())],
        )
        .clamp(0.0, 1.0);
        let cumulative = if index > 0 {
            warped * transformed[index - 1]
        } else {
            warped
        };
        transformed.push(cumulative);
    }

    let scaled: Vec<f64> = transformed.iter().map(|b| (b * 100.0).floor()).collect();
    let sup = scaled[scaled.len() - 2];
    let mut inf = scaled[scaled.len() - 1];
    if inf <= 0.0 {
        inf = 1.0;
    }
    (inf.min(sup), sup)
}

/// Labels of the taken services and names of the taken functions, in the
/// order placements were added, plus the candidate appended.
fn taken_lists<'a>(
    rap: &'a Rap,
    bundle: &BundleContext<'a>,
    slot: usize,
    function: FunctionId,
) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut services: Vec<&str> = bundle
        .placed
        .iter()
        .map(|p| bundle.labels[p.slot].as_str())
        .collect();
    let mut functions: Vec<&str> = bundle
        .placed
        .iter()
        .map(|p| rap.function_name(p.function))
        .collect();
    services.push(bundle.labels[slot].as_str());
    functions.push(rap.function_name(function));
    (services, functions)
}

fn clamp_window(value: f64, inf: f64, sup: f64) -> f64 {
    (sup - inf) * value.clamp(0.0, 1.0) + inf
}

// ═══════════════════════════════════════════════════════════════════════════════
// Flavors
// ═══════════════════════════════════════════════════════════════════════════════

/// The default experimental flavor: digest-perturbed, consumption-seeded.
pub struct PseudoUtility {
    agent: String,
    submodular: bool,
}

impl PseudoUtility {
    pub fn new(agent: impl Into<String>, submodular: bool) -> Self {
        Self {
            agent: agent.into(),
            submodular,
        }
    }
}

impl UtilityOracle for PseudoUtility {
    fn marginal_utility(
        &self,
        rap: &Rap,
        bundle: &BundleContext<'_>,
        slot: usize,
        function: FunctionId,
        node: NodeId,
    ) -> f64 {
        if !rap.implements(bundle.services[slot], function) {
            return 0.0;
        }

        let (taken_services, taken_functions) = taken_lists(rap, bundle, slot, function);
        let (inf, sup) = utility_window(
            bundle.labels.len(),
            &taken_services[..taken_services.len() - 1],
            &taken_functions[..taken_functions.len() - 1],
            self.submodular,
        );

        let reference = infrastructure_average(rap);
        let seeded = spread(average_consumption(rap, function, &reference));

        // digest perturbation over the sorted bundle content
        let mut sorted_services = taken_services.clone();
        let mut sorted_functions = taken_functions.clone();
        sorted_services.sort_unstable();
        sorted_functions.sort_unstable();
        let mut parts: Vec<&str> = sorted_services;
        parts.extend_from_slice(&sorted_functions);
        parts.push(&self.agent);
        let perturbation = 0.6 * hash_unit(&parts) - 0.3;
        let normalized = (seeded + perturbation).clamp(0.0, 1.0);

        // node affinity: placing next to the previous placement scores high
        let mut node_factor = hash_unit(&[&self.agent, rap.node_name(node), bundle.labels[slot].as_str()]);
        if let Some(last) = bundle.placed.last() {
            if last.node == node {
                node_factor = 0.3 * node_factor + 0.7;
            }
        }

        let agent_factor = hash_unit(&[&self.agent]);
        let utility = clamp_window(normalized * node_factor * agent_factor, inf, sup);

        // keep valid placements above the integer-rounding floor
        utility.max(0.51)
    }
}

/// Prefers resource-heavy functions.
pub struct GreedyUtility {
    agent: String,
    submodular: bool,
}

impl GreedyUtility {
    pub fn new(agent: impl Into<String>, submodular: bool) -> Self {
        Self {
            agent: agent.into(),
            submodular,
        }
    }
}

impl UtilityOracle for GreedyUtility {
    fn marginal_utility(
        &self,
        rap: &Rap,
        bundle: &BundleContext<'_>,
        slot: usize,
        function: FunctionId,
        node: NodeId,
    ) -> f64 {
        if !rap.implements(bundle.services[slot], function) {
            return 0.0;
        }

        let (taken_services, taken_functions) = taken_lists(rap, bundle, slot, function);
        let (inf, sup) = utility_window(
            bundle.labels.len(),
            &taken_services[..taken_services.len() - 1],
            &taken_functions[..taken_functions.len() - 1],
            self.submodular,
        );

        let reference = infrastructure_average(rap);
        let seeded = spread(average_consumption(rap, function, &reference));
        let node_factor =
            hash_unit(&[&self.agent, rap.node_name(node), bundle.labels[slot].as_str()]);

        clamp_window(seeded * node_factor, inf, sup).max(5.0)
    }
}

/// Prefers nodes not yet used by the bundle.
pub struct LoadBalanceUtility {
    agent: String,
    submodular: bool,
}

impl LoadBalanceUtility {
    pub fn new(agent: impl Into<String>, submodular: bool) -> Self {
        Self {
            agent: agent.into(),
            submodular,
        }
    }
}

impl UtilityOracle for LoadBalanceUtility {
    fn marginal_utility(
        &self,
        rap: &Rap,
        bundle: &BundleContext<'_>,
        slot: usize,
        function: FunctionId,
        node: NodeId,
    ) -> f64 {
        if !rap.implements(bundle.services[slot], function) {
            return 0.0;
        }

        let (taken_services, taken_functions) = taken_lists(rap, bundle, slot, function);
        let (inf, sup) = utility_window(
            bundle.labels.len(),
            &taken_services[..taken_services.len() - 1],
            &taken_functions[..taken_functions.len() - 1],
            self.submodular,
        );

        let reference = infrastructure_average(rap);
        let seeded = spread(average_consumption(rap, function, &reference));
        let used = bundle.placed.iter().any(|p| p.node == node);
        let h = hash_unit(&[&self.agent, rap.node_name(node), bundle.labels[slot].as_str()]);
        let node_factor = if used { 0.1 * h } else { 0.7 + 0.3 * h };

        clamp_window(seeded * node_factor, inf, sup).max(5.0)
    }
}

/// Prefers packing onto nodes the bundle already uses.
pub struct NodeLoadingUtility {
    agent: String,
    submodular: bool,
}

impl NodeLoadingUtility {
    pub fn new(agent: impl Into<String>, submodular: bool) -> Self {
        Self {
            agent: agent.into(),
            submodular,
        }
    }
}

impl UtilityOracle for NodeLoadingUtility {
    fn marginal_utility(
        &self,
        rap: &Rap,
        bundle: &BundleContext<'_>,
        slot: usize,
        function: FunctionId,
        node: NodeId,
    ) -> f64 {
        if !rap.implements(bundle.services[slot], function) {
            return 0.0;
        }

        let (taken_services, taken_functions) = taken_lists(rap, bundle, slot, function);
        let (inf, sup) = utility_window(
            bundle.labels.len(),
            &taken_services[..taken_services.len() - 1],
            &taken_functions[..taken_functions.len() - 1],
            self.submodular,
        );

        let reference = infrastructure_average(rap);
        let seeded = spread(average_consumption(rap, function, &reference));
        let used = bundle.placed.iter().any(|p| p.node == node);
        let h = hash_unit(&[&self.agent, rap.node_name(node), bundle.labels[slot].as_str()]);
        let node_factor = if used { 0.7 + 0.3 * h } else { 0.1 * h };

        clamp_window(seeded * node_factor, inf, sup).max(5.0)
    }
}
