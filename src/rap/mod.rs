//! The resource-allocation problem instance.
//!
//! An immutable description of the shared infrastructure every agent bids
//! on: agents, physical nodes, typed resources, functions with fixed
//! consumption vectors, and the service → implementing-functions map.
//!
//! All names are interned to dense integer ids at load time. Name lists are
//! sorted before id assignment so every process derives the identical id
//! order; tie-breaks on "ascending agent name" are then plain id order.

pub mod resources;

pub use resources::ResourceVector;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::{ConcordError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Interned ids
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u16);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Interned id of an agent (ids are assigned in ascending name order).
    AgentId
);
id_type!(
    /// Interned id of a physical node.
    NodeId
);
id_type!(
    /// Interned id of a resource type.
    ResourceId
);
id_type!(
    /// Interned id of a function.
    FunctionId
);
id_type!(
    /// Interned id of a service.
    ServiceId
);

// ═══════════════════════════════════════════════════════════════════════════════
// Wire format
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON shape of a problem instance file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RapSpec {
    pub sdos: Vec<String>,
    pub services: Vec<String>,
    pub functions: Vec<String>,
    pub resources: Vec<String>,
    pub nodes: Vec<String>,
    /// function → resource → amount
    pub consumption: BTreeMap<String, BTreeMap<String, i64>>,
    /// node → resource → amount
    pub available_resources: BTreeMap<String, BTreeMap<String, i64>>,
    /// service → ordered list of implementing function names
    pub implementation: BTreeMap<String, Vec<String>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Problem instance
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable problem instance with interned ids.
#[derive(Debug, Clone)]
pub struct Rap {
    agent_names: Vec<String>,
    node_names: Vec<String>,
    resource_names: Vec<String>,
    function_names: Vec<String>,
    service_names: Vec<String>,

    /// Per-function demand vector, indexed by `FunctionId`.
    consumption: Vec<ResourceVector>,

    /// Per-node capacity vector, indexed by `NodeId`.
    capacity: Vec<ResourceVector>,

    /// Implementing functions per service, indexed by `ServiceId`.
    implementations: Vec<Vec<FunctionId>>,
}

impl Rap {
    /// Load an instance from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConcordError::with_internal(
                ErrorCode::RapValidationFailed,
                format!("Cannot read problem instance {}", path.as_ref().display()),
                e.to_string(),
            )
        })?;
        let spec: RapSpec = serde_json::from_str(&text)?;
        Self::from_spec(spec)
    }

    /// Validate and intern a parsed instance.
    pub fn from_spec(spec: RapSpec) -> Result<Self> {
        let mut agent_names = spec.sdos;
        let mut node_names = spec.nodes;
        let mut resource_names = spec.resources;
        let mut function_names = spec.functions;
        let mut service_names = spec.services;

        agent_names.sort_unstable();
        node_names.sort_unstable();
        resource_names.sort_unstable();
        function_names.sort_unstable();
        service_names.sort_unstable();

        for list in [
            &agent_names,
            &node_names,
            &resource_names,
            &function_names,
            &service_names,
        ] {
            if list.is_empty() {
                return Err(ConcordError::rap("Instance has an empty name list"));
            }
            if list.windows(2).any(|w| w[0] == w[1]) {
                return Err(ConcordError::rap("Instance has duplicate names"));
            }
        }

        let resource_index = |name: &str| -> Result<usize> {
            resource_names
                .binary_search_by(|r| r.as_str().cmp(name))
                .map_err(|_| {
                    ConcordError::with_internal(
                        ErrorCode::UnknownResource,
                        "Instance references an unknown resource",
                        name.to_string(),
                    )
                })
        };

        let vector_of = |row: &BTreeMap<String, i64>| -> Result<ResourceVector> {
            let mut v = ResourceVector::zeros(resource_names.len());
            for (resource, amount) in row {
                if *amount < 0 {
                    return Err(ConcordError::with_internal(
                        ErrorCode::RapValidationFailed,
                        "Resource amounts must be non-negative",
                        format!("{resource}={amount}"),
                    ));
                }
                v[resource_index(resource)?] = *amount;
            }
            Ok(v)
        };

        let mut consumption = Vec::with_capacity(function_names.len());
        for function in &function_names {
            let row = spec.consumption.get(function).ok_or_else(|| {
                ConcordError::with_internal(
                    ErrorCode::RapValidationFailed,
                    "Function has no consumption row",
                    function.clone(),
                )
            })?;
            consumption.push(vector_of(row)?);
        }

        let mut capacity = Vec::with_capacity(node_names.len());
        for node in &node_names {
            let row = spec.available_resources.get(node).ok_or_else(|| {
                ConcordError::with_internal(
                    ErrorCode::UnknownNode,
                    "Node has no capacity row",
                    node.clone(),
                )
            })?;
            capacity.push(vector_of(row)?);
        }

        let mut implementations = Vec::with_capacity(service_names.len());
        for service in &service_names {
            let functions = spec.implementation.get(service).ok_or_else(|| {
                ConcordError::with_internal(
                    ErrorCode::UnknownService,
                    "Service has no implementation list",
                    service.clone(),
                )
            })?;
            if functions.is_empty() {
                return Err(ConcordError::with_internal(
                    ErrorCode::RapValidationFailed,
                    "Service has no implementing functions",
                    service.clone(),
                ));
            }
            let mut ids = Vec::with_capacity(functions.len());
            for f in functions {
                let idx = function_names
                    .binary_search_by(|name| name.as_str().cmp(f))
                    .map_err(|_| {
                        ConcordError::with_internal(
                            ErrorCode::RapValidationFailed,
                            "Implementation references an unknown function",
                            format!("{service} -> {f}"),
                        )
                    })?;
                ids.push(FunctionId(idx as u16));
            }
            implementations.push(ids);
        }

        Ok(Self {
            agent_names,
            node_names,
            resource_names,
            function_names,
            service_names,
            consumption,
            capacity,
            implementations,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dimensions and names
    // ─────────────────────────────────────────────────────────────────────────

    pub fn agent_count(&self) -> usize {
        self.agent_names.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_names.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resource_names.len()
    }

    pub fn agents(&self) -> impl Iterator<Item = AgentId> {
        (0..self.agent_names.len() as u16).map(AgentId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> {
        (0..self.node_names.len() as u16).map(NodeId)
    }

    pub fn agent_name(&self, agent: AgentId) -> &str {
        &self.agent_names[agent.index()]
    }

    pub fn node_name(&self, node: NodeId) -> &str {
        &self.node_names[node.index()]
    }

    pub fn resource_name(&self, resource: ResourceId) -> &str {
        &self.resource_names[resource.index()]
    }

    pub fn function_name(&self, function: FunctionId) -> &str {
        &self.function_names[function.index()]
    }

    pub fn service_name(&self, service: ServiceId) -> &str {
        &self.service_names[service.index()]
    }

    pub fn agent_id(&self, name: &str) -> Option<AgentId> {
        self.agent_names
            .binary_search_by(|a| a.as_str().cmp(name))
            .ok()
            .map(|i| AgentId(i as u16))
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_names
            .binary_search_by(|n| n.as_str().cmp(name))
            .ok()
            .map(|i| NodeId(i as u16))
    }

    pub fn service_id(&self, name: &str) -> Option<ServiceId> {
        self.service_names
            .binary_search_by(|s| s.as_str().cmp(name))
            .ok()
            .map(|i| ServiceId(i as u16))
    }

    pub fn all_agent_names(&self) -> &[String] {
        &self.agent_names
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Capacity and consumption
    // ─────────────────────────────────────────────────────────────────────────

    /// Capacity vector of a node.
    pub fn capacity(&self, node: NodeId) -> &ResourceVector {
        &self.capacity[node.index()]
    }

    /// Demand vector of a function.
    pub fn function_consumption(&self, function: FunctionId) -> &ResourceVector {
        &self.consumption[function.index()]
    }

    /// Total demand of a set of functions.
    pub fn bundle_consumption(&self, functions: impl Iterator<Item = FunctionId>) -> ResourceVector {
        let mut total = ResourceVector::zeros(self.resource_count());
        for f in functions {
            total.add_assign(&self.consumption[f.index()]);
        }
        total
    }

    /// Capacity summed over every node.
    pub fn total_capacity(&self) -> ResourceVector {
        let mut total = ResourceVector::zeros(self.resource_count());
        for c in &self.capacity {
            total.add_assign(c);
        }
        total
    }

    /// Implementing functions of a service, in instance order.
    pub fn implementations_for(&self, service: ServiceId) -> &[FunctionId] {
        &self.implementations[service.index()]
    }

    /// Whether `function` implements `service`.
    pub fn implements(&self, service: ServiceId, function: FunctionId) -> bool {
        self.implementations[service.index()].contains(&function)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Norm
    // ─────────────────────────────────────────────────────────────────────────

    /// Per-resource scale factor: the node's average capacity over its
    /// capacity of this resource, so no single resource dominates the norm.
    /// With `node` absent, scales against the infrastructure-wide totals.
    pub fn resource_scalar(&self, resource: ResourceId, node: Option<NodeId>) -> f64 {
        let amounts = match node {
            Some(n) => self.capacity[n.index()].clone(),
            None => self.total_capacity(),
        };
        let avg = amounts.total() as f64 / self.resource_count() as f64;
        let amount = amounts[resource.index()];
        if amount == 0 {
            0.0
        } else {
            avg / amount as f64
        }
    }

    /// Weighted L2 norm of a demand vector on a node:
    /// `sqrt(Σ_r (v[r] · s_r(n))²)`.
    pub fn norm(&self, node: NodeId, demand: &ResourceVector) -> f64 {
        let mut sum = 0.0;
        for (i, amount) in demand.iter().enumerate() {
            let scaled = amount as f64 * self.resource_scalar(ResourceId(i as u16), Some(node));
            sum += scaled * scaled;
        }
        sum.sqrt()
    }
}
