//! Configuration management.
//!
//! Configuration is an explicit immutable value passed into every component;
//! there are no process-wide mutable singletons.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{ConcordError, ErrorCode, Result};

/// Main agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Timeout configuration
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Neighborhood configuration
    #[serde(default)]
    pub neighborhood: NeighborhoodConfig,

    /// Private utility configuration
    #[serde(default)]
    pub utility: UtilityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Problem instance configuration
    #[serde(default)]
    pub problem: ProblemConfig,

    /// Broker transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Soft quiescence window: once neighborhood agreement is reached, the
    /// agent exits if no disruptive message arrives within this window.
    #[serde(with = "humantime_serde", default = "default_agreement_timeout")]
    pub agreement_timeout: Duration,

    /// Permanent silence window: the agent exits if no message at all
    /// arrives within this window, regardless of agreement state.
    #[serde(with = "humantime_serde", default = "default_weak_agreement_timeout")]
    pub weak_agreement_timeout: Duration,

    /// Ceiling on each driver dequeue wait.
    #[serde(with = "humantime_serde", default = "default_async_timeout")]
    pub async_timeout: Duration,

    /// Wall-clock budget for the patience-embedding improvement phase.
    #[serde(with = "humantime_serde", default = "default_scheduling_time_limit")]
    pub scheduling_time_limit: Duration,

    /// Bucket width for the message-rate validation output.
    #[serde(with = "humantime_serde", default = "default_sample_frequency")]
    pub sample_frequency: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agreement_timeout: default_agreement_timeout(),
            weak_agreement_timeout: default_weak_agreement_timeout(),
            async_timeout: default_async_timeout(),
            scheduling_time_limit: default_scheduling_time_limit(),
            sample_frequency: default_sample_frequency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeighborhoodConfig {
    /// Freeze the current neighborhood to the static set (no link flaps).
    #[serde(default = "default_stable_connections")]
    pub stable_connections: bool,

    /// Load the neighbor sets from `topology_file` instead of deriving them
    /// from the pairwise hash.
    #[serde(default)]
    pub load_topology: bool,

    /// Hash-admission threshold in 0..=100 for pairwise neighbor selection.
    #[serde(default = "default_neighbor_probability")]
    pub neighbor_probability: u8,

    /// Adjacency-map JSON file, used when `load_topology` is set.
    #[serde(default = "default_topology_file")]
    pub topology_file: String,
}

impl Default for NeighborhoodConfig {
    fn default() -> Self {
        Self {
            stable_connections: default_stable_connections(),
            load_topology: false,
            neighbor_probability: default_neighbor_probability(),
            topology_file: default_topology_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UtilityConfig {
    /// Selects the private utility flavor.
    #[serde(default = "default_private_utility")]
    pub private_utility: String,

    /// Require submodular marginal-gain bounds from the oracle.
    #[serde(default = "default_submodular")]
    pub submodular_private_utility: bool,
}

impl Default for UtilityConfig {
    fn default() -> Self {
        Self {
            private_utility: default_private_utility(),
            submodular_private_utility: default_submodular(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (overridden by `RUST_LOG` when set).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted log lines.
    #[serde(default)]
    pub json: bool,

    /// Directory for per-agent result files.
    #[serde(default = "default_results_folder")]
    pub results_folder: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
            results_folder: default_results_folder(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProblemConfig {
    /// Path of the problem-instance JSON file.
    #[serde(default = "default_rap_instance")]
    pub rap_instance: String,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            rap_instance: default_rap_instance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Broker connection URL.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
        }
    }
}

// Default value functions
fn default_agreement_timeout() -> Duration { Duration::from_secs(3) }
fn default_weak_agreement_timeout() -> Duration { Duration::from_secs(15) }
fn default_async_timeout() -> Duration { Duration::from_millis(500) }
fn default_scheduling_time_limit() -> Duration { Duration::from_secs(2) }
fn default_sample_frequency() -> Duration { Duration::from_secs(1) }
fn default_stable_connections() -> bool { true }
fn default_neighbor_probability() -> u8 { 50 }
fn default_topology_file() -> String { "config/topology.json".to_string() }
fn default_private_utility() -> String { "pseudo".to_string() }
fn default_submodular() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_results_folder() -> String { "results".to_string() }
fn default_rap_instance() -> String { "config/rap_instance.json".to_string() }
fn default_broker_url() -> String { "redis://127.0.0.1:6379".to_string() }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CONCORD").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONCORD").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.neighborhood.neighbor_probability > 100 {
            return Err(ConcordError::with_internal(
                ErrorCode::InvalidConfiguration,
                "neighbor_probability must be in 0..=100",
                self.neighborhood.neighbor_probability.to_string(),
            ));
        }
        if self.timeout.sample_frequency.is_zero() {
            return Err(ConcordError::new(
                ErrorCode::InvalidConfiguration,
                "sample_frequency must be non-zero",
            ));
        }
        crate::utility::validate_flavor(&self.utility.private_utility)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: TimeoutConfig::default(),
            neighborhood: NeighborhoodConfig::default(),
            utility: UtilityConfig::default(),
            logging: LoggingConfig::default(),
            problem: ProblemConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}
