//! evolved - autonomous agent evolution daemon
//!
//! ## Commands
//!
//! - `run`: start the scheduler and periodic evaluation until Ctrl-C
//! - `capabilities`: list registered capabilities
//! - `invoke`: call one capability with JSON parameters
//! - `config`: print the effective configuration as TOML

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evolve_core::telemetry::init_tracing;
use evolve_core::{CapabilitySet, EvolutionConfig, EvolutionService, InvocationBudget};
use evolve_state::SurrealEvolutionStore;
use serde::Deserialize;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "evolved")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Autonomous agent evolution daemon", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to the TOML config file
    #[arg(short, long, global = true, env = "EVOLVE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evolution scheduler until interrupted
    Run {
        /// SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
        /// In-process memory stores are used when omitted.
        #[arg(long, env = "EVOLVE_DB_URL")]
        db: Option<String>,

        /// JSON file with agents to register at startup
        #[arg(long)]
        agents: Option<PathBuf>,

        /// Override the periodic evaluation interval, in seconds
        #[arg(long)]
        scan_interval: Option<u64>,
    },

    /// List registered capabilities
    Capabilities {
        /// Only show this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Invoke a capability with JSON parameters
    Invoke {
        /// Capability name
        name: String,

        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,

        /// Wall-clock budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

/// One entry of the `--agents` seed file.
#[derive(Debug, Deserialize)]
struct SeedAgent {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    capabilities: CapabilitySet,
    #[serde(default)]
    scores: Vec<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = EvolutionConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Run {
            db,
            agents,
            scan_interval,
        } => cmd_run(config, db.as_deref(), agents.as_deref(), scan_interval).await,
        Commands::Capabilities { category } => cmd_capabilities(config, category.as_deref()),
        Commands::Invoke {
            name,
            params,
            timeout_ms,
        } => cmd_invoke(config, &name, &params, timeout_ms).await,
        Commands::Config => cmd_config(&config),
    }
}

async fn cmd_run(
    config: EvolutionConfig,
    db: Option<&str>,
    agents: Option<&Path>,
    scan_interval: Option<u64>,
) -> Result<()> {
    let interval = scan_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.scan_interval());

    let service = match db {
        Some(url) => {
            let store = Arc::new(
                SurrealEvolutionStore::connect(url)
                    .await
                    .with_context(|| format!("Failed to connect to {url}"))?,
            );
            let service = EvolutionService::builder(config)
                .store(store.clone())
                .log(store)
                .persist_knowledge(true)
                .build()?;
            let recovered = service
                .recover_interrupted()
                .await
                .context("Failed to recover interrupted attempts")?;
            let restored = service
                .reload_knowledge()
                .await
                .context("Failed to reload knowledge")?;
            info!(entries = restored, recovered, "state restored from {url}");
            service
        }
        None => EvolutionService::in_memory(config)?,
    };

    if let Some(path) = agents {
        let seeds = read_seed_agents(path)?;
        for seed in seeds {
            let name = seed.name.unwrap_or_else(|| seed.id.clone());
            let agent = match service.register_agent(seed.id.as_str(), name, seed.capabilities).await {
                Ok(agent) => agent,
                Err(err) => {
                    warn!(agent_id = %seed.id, error = %err, "skipping seed agent");
                    continue;
                }
            };
            for score in seed.scores {
                service
                    .record_performance(&agent.id, score)
                    .await
                    .with_context(|| format!("Invalid score for agent {}", agent.id))?;
            }
        }
    }

    service.start_periodic_evaluation(interval);
    info!(
        interval_secs = interval.as_secs(),
        agents = service.list_agents().await?.len(),
        "evolved running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    service.shutdown().await;
    Ok(())
}

fn read_seed_agents(path: &Path) -> Result<Vec<SeedAgent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read agents file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse agents file {}", path.display()))
}

fn cmd_capabilities(config: EvolutionConfig, category: Option<&str>) -> Result<()> {
    let registry = evolve_core::CapabilityRegistry::from_config(&config);
    evolve_core::registry::register_defaults(&registry)?;

    let descriptors = match category {
        Some(category) => registry.list_by_category(category),
        None => registry.list(),
    };
    for d in descriptors {
        println!("{:<28} v{:<3} {:<20} {}", d.name, d.version, d.category, d.description);
    }
    Ok(())
}

async fn cmd_invoke(
    config: EvolutionConfig,
    name: &str,
    params: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("Parameters must be valid JSON")?;

    let registry = evolve_core::CapabilityRegistry::from_config(&config);
    evolve_core::registry::register_defaults(&registry)?;

    let budget = timeout_ms.map(|ms| InvocationBudget::with_duration(Duration::from_millis(ms)));
    let output = registry
        .invoke(name, params, budget)
        .await
        .with_context(|| format!("Capability {name} failed"))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_config(config: &EvolutionConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_parses_invoke_with_default_params() {
        let cli = Cli::try_parse_from(["evolved", "invoke", "analyze_data"]).unwrap();
        match cli.command {
            Commands::Invoke { name, params, .. } => {
                assert_eq!(name, "analyze_data");
                assert_eq!(params, "{}");
            }
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn seed_file_accepts_minimal_agents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "a1"}}, {{"id": "a2", "name": "Two", "scores": [0.4],
                "capabilities": {{"data_analysis": {{"version": 1, "config": {{}}}}}}}}]"#
        )
        .unwrap();

        let seeds = read_seed_agents(file.path()).unwrap();
        assert_eq!(seeds.len(), 2);
        assert!(seeds[0].capabilities.is_empty());
        assert_eq!(seeds[1].scores, vec![0.4]);
        assert!(seeds[1].capabilities.contains("data_analysis"));
    }
}
