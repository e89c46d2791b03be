//! Observability: logging and metrics.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ConcordError, ErrorCode, Result};

/// Initialize the tracing stack.
///
/// `RUST_LOG` wins over the configured level when set. With a log file the
/// output goes there instead of stdout.
pub fn init(config: &LoggingConfig, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ConcordError::with_internal(
                        ErrorCode::ConfigurationError,
                        format!("Cannot open log file {}", path.display()),
                        e.to_string(),
                    )
                })?;
            let writer = Mutex::new(file);
            if config.json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer),
                    )
                    .init();
            }
        }
        None => {
            if config.json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            }
        }
    }

    Ok(())
}

/// Metric registration and naming.
pub mod metrics {
    use metrics::{describe_counter, describe_gauge};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!(
            "concord_messages_sent_total",
            "Messages broadcast to neighbors"
        );
        describe_counter!(
            "concord_messages_received_total",
            "Messages received from neighbors"
        );
        describe_counter!(
            "concord_messages_coalesced_total",
            "Stale messages dropped unread by per-sender coalescing"
        );
        describe_counter!(
            "concord_agreement_rounds_total",
            "Agreement engine invocations"
        );
        describe_counter!(
            "concord_overbids_total",
            "Rounds in which this agent was overbid"
        );
        describe_counter!(
            "concord_orchestrations_total",
            "Orchestration (bidding) rounds"
        );
        describe_counter!("concord_errors_total", "Errors by code");

        describe_gauge!(
            "concord_agree_neighbors",
            "Neighbors currently in the agree set"
        );
    }
}
