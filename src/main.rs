//! Inference orchestrator - command line entry point

use clap::{Parser, Subcommand};
use inference_orchestrator::agent::Capability;
use inference_orchestrator::config::EngineConfig;
use inference_orchestrator::observability::{init_default_logging, MetricsCollector};
use inference_orchestrator::{Engine, InferOptions, ProgressReporter};
use std::io::BufRead;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Route queries to locally hosted inference agents
#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Routing, caching and admission control for local inference agents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer queries read line by line from stdin until EOF or Ctrl-C
    Run,
    /// Answer a single query
    Ask {
        query: String,
        /// Skip routing and use this agent
        #[arg(long)]
        agent: Option<String>,
        /// Prefer agents with this capability (e.g. code_generation)
        #[arg(long)]
        capability: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Print engine statistics after answering
        #[arg(long)]
        stats: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    debug!(
        "Starting inference orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_interactive(config).await,
        Commands::Ask {
            query,
            agent,
            capability,
            priority,
            stats,
        } => ask_once(config, query, agent, capability, priority, stats).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(EngineConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["orchestrator.toml", "config/orchestrator.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(EngineConfig::load_from_file(&path)?);
                }
            }

            info!("No configuration file found, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

/// Build and initialize an engine over the simulated agent roster
async fn start_engine(
    config: EngineConfig,
    metrics: Arc<MetricsCollector>,
) -> Result<Engine, Box<dyn std::error::Error>> {
    let (progress, mut updates) = ProgressReporter::channel(64);
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            debug!(
                agent_id = %update.agent_id,
                phase = ?update.phase,
                fraction = update.fraction,
                "{}",
                update.message
            );
        }
    });

    let engine = Engine::builder(config)
        .builtin_agents()
        .telemetry(metrics)
        .progress(progress)
        .build()?;
    engine.initialize().await?;
    Ok(engine)
}

async fn run_interactive(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(MetricsCollector::new());
    let engine = start_engine(config, metrics.clone()).await?;

    let (lines_tx, mut lines_rx) = tokio::sync::mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if lines_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    info!("Ready; type a query per line");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break;
            }
            line = lines_rx.recv() => {
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match engine.infer(&line, InferOptions::default()).await {
                    Ok(output) => println!("[{}] {}", output.agent_id, output.content),
                    Err(e) => {
                        warn!(error = %e, "Query failed");
                        println!("error: {}", e.user_message());
                    }
                }
            }
        }
    }

    engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    Ok(())
}

async fn ask_once(
    config: EngineConfig,
    query: String,
    agent: Option<String>,
    capability: Option<String>,
    priority: i32,
    stats: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(MetricsCollector::new());
    let engine = start_engine(config, metrics.clone()).await?;

    let mut options = InferOptions::default().with_priority(priority);
    options.force_agent = agent;
    if let Some(name) = capability {
        let capability =
            Capability::parse(&name).ok_or_else(|| format!("Unknown capability: {name}"))?;
        options = options.with_capability(capability);
    }

    let result = engine.infer(&query, options).await;
    let engine_stats = engine.stats();
    engine.shutdown().await;

    let output = result?;
    println!("[{}] {}", output.agent_id, output.content);
    if stats {
        println!("{}", serde_json::to_string_pretty(&engine_stats)?);
        println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }
    Ok(())
}

fn handle_config_command(
    config: &EngineConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
