//! Concord agent - one agent per process invocation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use concord_core::agreement::AgreementEngine;
use concord_core::config::Config;
use concord_core::driver::{DriverTimeouts, NodeDriver};
use concord_core::neighborhood::NeighborhoodDetector;
use concord_core::observability;
use concord_core::orchestrator::Orchestrator;
use concord_core::rap::Rap;
use concord_core::results::write_results;
use concord_core::transport::RedisTransport;
use concord_core::utility::build_oracle;

#[derive(Parser)]
#[command(
    name = "concord-agent",
    version,
    about = "Concord - distributed consensus engine for multi-agent resource allocation",
    long_about = "Runs one agent of the distributed resource-allocation protocol. \
                  The process exits when its neighborhood converges (or the weak \
                  timeout fires); the exit code is the agent's final private utility."
)]
struct Cli {
    /// Name of the agent.
    agent_name: String,

    /// Service bundle to place, one or more service names.
    #[arg(required = true)]
    service: Vec<String>,

    /// Log level filter.
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Log to `<agent>.log` instead of stdout.
    #[arg(short = 'o', long)]
    log_on_file: bool,

    /// Explicit log file path.
    #[arg(short = 'f', long)]
    log_file: Option<PathBuf>,

    /// Configuration file path.
    #[arg(short = 'd', long)]
    conf_file: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.conf_file {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {e}. Using defaults.");
            Config::default()
        }),
    };
    config.logging.log_level = cli.log_level.clone();

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| cli.log_on_file.then(|| PathBuf::from(format!("{}.log", cli.agent_name))));
    observability::init(&config.logging, log_file.as_deref())?;
    observability::metrics::register_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        agent = %cli.agent_name,
        "Starting Concord agent"
    );

    let rap = Arc::new(
        Rap::from_file(&config.problem.rap_instance)
            .with_context(|| format!("loading {}", config.problem.rap_instance))?,
    );
    tracing::info!(
        agents = rap.agent_count(),
        nodes = rap.node_count(),
        resources = rap.resource_count(),
        "Problem instance loaded"
    );

    let agent = rap
        .agent_id(&cli.agent_name)
        .with_context(|| format!("agent '{}' is not part of the instance", cli.agent_name))?;
    let services = cli
        .service
        .iter()
        .map(|name| {
            rap.service_id(name)
                .with_context(|| format!("service '{name}' is not part of the instance"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let oracle = build_oracle(
        &config.utility.private_utility,
        &cli.agent_name,
        config.utility.submodular_private_utility,
    )?;

    let orchestrator = Orchestrator::new(
        agent,
        rap.clone(),
        oracle,
        &services,
        config.timeout.scheduling_time_limit,
    );
    let engine = AgreementEngine::new(agent, rap.clone());
    let detector = NeighborhoodDetector::from_config(rap.clone(), agent, &config.neighborhood)?;
    tracing::info!(neighbors = detector.neighborhood().len(), "Neighborhood derived");

    let transport = Arc::new(RedisTransport::connect(&config.transport.broker_url)?);
    let driver = NodeDriver::new(
        orchestrator,
        engine,
        detector,
        transport,
        DriverTimeouts::from(&config.timeout),
    );

    let report = driver.run().await?;
    write_results(&config.logging.results_folder, &cli.agent_name, &report, &rap)?;

    println!(
        "{} | strong: {:<5} | utility: {:>4} | agreement on: {} | total time: {:.3}s | sent: {} | received: {}",
        cli.agent_name,
        report.strong_agreement,
        report.private_utility,
        report
            .agreement_after
            .map_or_else(|| "never".to_string(), |t| format!("{t:.3}s")),
        report.total_time,
        report.sent_messages,
        report.received_messages,
    );

    std::process::exit(report.private_utility as i32);
}
