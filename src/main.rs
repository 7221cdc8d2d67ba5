//! Command-line entry point for approximation and exact experiment runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rsp_approx::{
    Analyzer, Approach, ApproachKind, BrokerEndpoint, BrokerConnector, Config, EventLog,
    MqttConnector, RSPEngine, ResourceUsageLogger, WindowEngine, orchestrator,
    telemetry::init_tracing,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// RDF stream aggregation experiments: approximate vs exact evaluation
#[derive(Parser, Debug)]
#[command(name = "rsp-approx")]
#[command(version = rsp_approx::VERSION)]
#[command(about = "Decomposed window aggregation over correlated RDF streams", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive; overrides the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one experiment iteration until interrupted
    Run {
        #[arg(long, value_enum, default_value = "approximation")]
        mode: ApproachKind,

        /// Iteration directory the logs are written to
        #[arg(long, default_value = "1")]
        iteration: u32,
    },

    /// Summarize latency and resource usage over all iterations
    Analyze {
        #[arg(long, value_enum, default_value = "approximation")]
        mode: ApproachKind,
    },

    /// Print the sub-queries the combined query decomposes into
    Decompose,

    /// Print an example configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level, cli.json_logs || config.logging.format == "json");

    match cli.command {
        Command::Run { mode, iteration } => run(&config, mode, iteration).await,
        Command::Analyze { mode } => analyze(&config, mode),
        Command::Decompose => decompose(&config),
        Command::ExampleConfig => {
            println!("{}", Config::example_toml());
            Ok(())
        }
    }
}

async fn run(config: &Config, mode: ApproachKind, iteration: u32) -> Result<()> {
    let monitor = if config.monitor.enabled {
        let path = config.resource_log_path(mode, iteration);
        Some(ResourceUsageLogger::start(&path, config.monitor.interval())?)
    } else {
        None
    };

    let event_log = EventLog::open(config.event_log_path(mode, iteration))
        .context("opening event log")?;

    let connector = Arc::new(MqttConnector::default());
    let output_endpoint = BrokerEndpoint::from_stream_uri(&config.output.broker_url)?;
    let output_broker = connector
        .connect(&output_endpoint)
        .await
        .context("connecting to the output broker")?;

    let rsp_engine = RSPEngine::with_result_capacity(config.output.queue_capacity);
    let engine: Arc<dyn WindowEngine> = Arc::new(rsp_engine.clone());
    let queries = mode.queries(config)?;
    info!(mode = mode.name(), iteration, queries = queries.len(), "starting run");

    let running = Approach::new(mode, queries, engine, connector, output_broker, event_log)
        .with_output(config.output.clone())
        .with_timestamp_predicate(config.ingestion.timestamp_predicate.clone())
        .start()
        .await?;

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("interrupt received, shutting down");
    running.shutdown().await;
    if rsp_engine.dropped_ticks() > 0 {
        warn!(dropped = rsp_engine.dropped_ticks(), "result ticks dropped on full queues");
    }

    if let Some(monitor) = monitor {
        match monitor.stop().await {
            Ok(samples) => info!(samples, "resource monitor stopped"),
            Err(e) => warn!(error = %e, "resource monitor did not stop cleanly"),
        }
    }
    Ok(())
}

fn analyze(config: &Config, mode: ApproachKind) -> Result<()> {
    let rows = Analyzer::new(config.analyzer_config(mode)).run()?;
    let complete = rows.iter().filter(|r| r.latency_ms.is_some()).count();
    info!(iterations = rows.len(), complete, "analysis finished");
    Ok(())
}

fn decompose(config: &Config) -> Result<()> {
    let combined = config.combined_query()?;
    let sub_queries = orchestrator::decompose(&combined, &config.decomposition)?;
    for (index, sub_query) in sub_queries.iter().enumerate() {
        println!("# sub-query {}\n{}\n", index + 1, sub_query.text);
    }
    Ok(())
}
