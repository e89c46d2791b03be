//! The private utility oracle.
//!
//! Each agent scores candidate `(service, function, node)` placements with a
//! private marginal-utility function. The core treats the oracle as a black
//! box constrained by a small contract:
//!
//! - the returned value is in `[0, 100]`;
//! - it is `0` iff the function does not implement the service;
//! - it is deterministic given the agent identity and the call arguments;
//! - when `submodular` is on, marginal gains never grow with bundle size.
//!
//! Flavors are separate implementations selected at startup by
//! configuration.

pub mod flavors;

use std::sync::Arc;

use crate::error::{ConcordError, ErrorCode, Result};
use crate::rap::{FunctionId, NodeId, Rap, ResourceVector, ServiceId};

/// One placement already in the bundle, in added order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Index into the agent's service bundle.
    pub slot: usize,
    pub function: FunctionId,
    pub node: NodeId,
}

/// The bundle context an oracle call sees.
#[derive(Debug, Clone, Copy)]
pub struct BundleContext<'a> {
    /// Per-slot labels (`"<index>_<service-name>"`), stable for the run.
    pub labels: &'a [String],
    /// Per-slot services.
    pub services: &'a [ServiceId],
    /// Placements taken so far, in the order they were added.
    pub placed: &'a [Placement],
}

/// A private utility oracle.
pub trait UtilityOracle: Send + Sync {
    /// Marginal utility of adding `(slot, function, node)` to the bundle.
    fn marginal_utility(
        &self,
        rap: &Rap,
        bundle: &BundleContext<'_>,
        slot: usize,
        function: FunctionId,
        node: NodeId,
    ) -> f64;
}

/// Check a configured flavor name without constructing an oracle.
pub fn validate_flavor(name: &str) -> Result<()> {
    match name {
        "pseudo" | "greedy" | "load-balance" | "node-loading" => Ok(()),
        "game-latency" | "cdn-traffic" => Err(ConcordError::with_internal(
            ErrorCode::InvalidConfiguration,
            "Utility flavor requires a live statistics feed and is not supported",
            name.to_string(),
        )),
        other => Err(ConcordError::with_internal(
            ErrorCode::InvalidConfiguration,
            "Unknown utility flavor",
            other.to_string(),
        )),
    }
}

/// Build the oracle selected by configuration for the given agent.
pub fn build_oracle(
    flavor: &str,
    agent_name: &str,
    submodular: bool,
) -> Result<Arc<dyn UtilityOracle>> {
    validate_flavor(flavor)?;
    let oracle: Arc<dyn UtilityOracle> = match flavor {
        "pseudo" => Arc::new(flavors::PseudoUtility::new(agent_name, submodular)),
        "greedy" => Arc::new(flavors::GreedyUtility::new(agent_name, submodular)),
        "load-balance" => Arc::new(flavors::LoadBalanceUtility::new(agent_name, submodular)),
        "node-loading" => Arc::new(flavors::NodeLoadingUtility::new(agent_name, submodular)),
        _ => unreachable!("validated above"),
    };
    Ok(oracle)
}

/// Per-resource reference amounts: the average node capacity of the
/// infrastructure, used to express function demand as a dimensionless
/// fraction.
pub fn infrastructure_average(rap: &Rap) -> Vec<f64> {
    let total = rap.total_capacity();
    let nodes = rap.node_count() as f64;
    total.iter().map(|amount| amount as f64 / nodes).collect()
}

/// Mean over resources of `demand[r] / reference[r]`.
///
/// A non-zero demand against a zero reference is infinitely heavy, which
/// makes the candidate unusable for size-ordered iteration.
pub fn average_consumption(rap: &Rap, function: FunctionId, reference: &[f64]) -> f64 {
    let demand = rap.function_consumption(function);
    let mut sum = 0.0;
    for (i, amount) in demand.iter().enumerate() {
        if reference[i] <= 0.0 {
            if amount > 0 {
                return f64::INFINITY;
            }
            continue;
        }
        sum += amount as f64 / reference[i];
    }
    sum / reference.len() as f64
}

/// Reference amounts taken from a concrete bound vector.
pub fn reference_from_bound(bound: &ResourceVector) -> Vec<f64> {
    bound.iter().map(|v| v as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rap::tests::toy_rap;

    #[test]
    fn test_validate_flavors() {
        assert!(validate_flavor("pseudo").is_ok());
        assert!(validate_flavor("node-loading").is_ok());
        assert!(validate_flavor("cdn-traffic").is_err());
        assert!(validate_flavor("nonsense").is_err());
    }

    #[test]
    fn test_infrastructure_average() {
        let rap = toy_rap(&["a"]);
        // Two nodes with (4, 4) each: per-node average is (4, 4).
        let avg = infrastructure_average(&rap);
        assert_eq!(avg, vec![4.0, 4.0]);
    }

    #[test]
    fn test_average_consumption_zero_reference_is_infinite() {
        let rap = toy_rap(&["a"]);
        let f = crate::rap::FunctionId(0);
        assert!(average_consumption(&rap, f, &[0.0, 0.0]).is_infinite());
    }

    #[test]
    fn test_average_consumption_ordering() {
        let rap = toy_rap(&["a"]);
        // f_big consumes twice f_small everywhere.
        let reference = infrastructure_average(&rap);
        let big = crate::rap::FunctionId(0); // "f_big" sorts first
        let small = crate::rap::FunctionId(1);
        assert!(
            average_consumption(&rap, big, &reference)
                > average_consumption(&rap, small, &reference)
        );
    }
}
