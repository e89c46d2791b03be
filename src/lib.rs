//! # Concord Core
//!
//! Distributed consensus engine for multi-agent resource allocation.
//!
//! A fixed set of autonomous agents must simultaneously place their service
//! bundles onto shared capacity-bounded nodes. There is no central arbiter:
//! each agent bids, elects winners locally, and exchanges bidding state
//! with its neighborhood until the network settles on a consistent,
//! capacity-feasible allocation.
//!
//! ## Architecture
//!
//! - **RAP model**: the immutable problem instance with interned ids and a
//!   weighted demand norm
//! - **Utility Oracle**: pluggable private scoring of candidate placements
//! - **Orchestrator**: greedy/patience bundle construction under resource
//!   and score-ceiling bounds
//! - **Election**: per-node greedy knapsack by score-to-demand ratio with
//!   false-winner elimination
//! - **Agreement Engine**: neighbor state merge, overbid detection and the
//!   rebroadcast decision table
//! - **Node Driver**: the per-agent event loop with message coalescing and
//!   convergence timers
//! - **Transport**: per-destination FIFO queues over a Redis broker, or an
//!   in-memory hub for tests

pub mod agreement;
pub mod bidding;
pub mod config;
pub mod driver;
pub mod error;
pub mod neighborhood;
pub mod observability;
pub mod orchestrator;
pub mod rap;
pub mod results;
pub mod transport;
pub mod utility;

pub use error::{ConcordError, ErrorCode, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::agreement::{AgreementEngine, AgreementOutcome};
    pub use crate::bidding::{Bid, BiddingData, BiddingMessage, PerNodeWinners, Timestamp};
    pub use crate::config::Config;
    pub use crate::driver::{DriverTimeouts, NodeDriver, RunReport};
    pub use crate::error::{ConcordError, ErrorCode, Result};
    pub use crate::neighborhood::NeighborhoodDetector;
    pub use crate::orchestrator::election::{multi_node_election, ElectionOutcome};
    pub use crate::orchestrator::{DetailedPlacement, Orchestrator, PlacementRecord};
    pub use crate::rap::{AgentId, FunctionId, NodeId, Rap, ResourceVector, ServiceId};
    pub use crate::transport::{InMemoryHub, RedisTransport, Transport};
    pub use crate::utility::{build_oracle, UtilityOracle};
}
