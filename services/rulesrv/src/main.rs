use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use voltage_rtdb::{LoggingSink, MemorySink, SystemTimeProvider};
use voltage_rules::{Binding, RuleScheduler};

use rulesrv::replay::{read_telemetry, replay};
use rulesrv::{Engine, FileGraphService, Inputs, RulesrvConfig};

/// VoltageEMS rule service
#[derive(Parser, Debug)]
#[command(name = "rulesrv")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "RULESRV_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Evaluate rules on the configured tick until interrupted
    Run,

    /// Bind every rule instance and report failures
    Check,

    /// Feed a telemetry CSV through the engine and print final states
    Replay {
        /// CSV with timestamp,signal_id,value columns, defaults to data.telemetry
        csv: Option<PathBuf>,
    },

    /// List rules and instance counts
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RulesrvConfig::load(args.config.as_deref())?;

    common::logging::init_with_config(config.log_config())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&config).await,
        Commands::Check => check_rules(&config).await,
        Commands::Replay { csv } => replay_telemetry(&config, csv).await,
        Commands::List => list_rules(&config),
    }
}

/// Run the rules service
async fn run_service(config: &RulesrvConfig) -> Result<()> {
    info!("Starting Rules Service");
    let inputs = Inputs::load(&config.data)?;
    let engine = Engine::build(config, inputs, Arc::new(LoggingSink))?;

    let scheduler = Arc::new(
        RuleScheduler::new(
            Arc::clone(&engine.runner),
            Arc::new(SystemTimeProvider),
            config.engine.tick_interval_ms,
        )
        .with_graph_refresh(
            Arc::new(FileGraphService::new(config.data.graph.clone())),
            config.graph_refresh(),
        ),
    );

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.start().await })
    };

    common::shutdown::wait_for_shutdown().await;
    info!("Shutdown signal received");
    scheduler.stop();
    if let Err(e) = handle.await {
        error!("Scheduler task failed: {}", e);
    }

    engine.shutdown().await;
    info!("Rules Service stopped");
    Ok(())
}

/// Bind all instances, failing when any is excluded
async fn check_rules(config: &RulesrvConfig) -> Result<()> {
    let inputs = Inputs::load(&config.data)?;
    let engine = Engine::build(config, inputs, Arc::new(LoggingSink))?;

    let mut excluded = 0;
    for (instance, binding) in engine.runner.check() {
        match binding {
            Binding::Bound(bound) => println!(
                "{} {} ({} capabilities)",
                "[OK]".green(),
                instance.id,
                bound.capabilities.len()
            ),
            Binding::Excluded(reason) => {
                excluded += 1;
                println!("{} {}: {}", "[FAIL]".red(), instance.id, reason);
            },
        }
    }
    engine.shutdown().await;

    if excluded > 0 {
        bail!("{} rule instance(s) failed to bind", excluded);
    }
    println!("{}", "All rule instances bound".green().bold());
    Ok(())
}

async fn replay_telemetry(config: &RulesrvConfig, csv: Option<PathBuf>) -> Result<()> {
    let Some(path) = csv.or_else(|| config.data.telemetry.clone()) else {
        bail!("No telemetry CSV given and data.telemetry is not configured");
    };
    let points = read_telemetry(&path)?;
    let inputs = Inputs::load(&config.data)?;
    let engine = Engine::build(config, inputs, Arc::new(MemorySink::new()))?;

    let tick = chrono::TimeDelta::milliseconds(config.engine.tick_interval_ms as i64);
    let summary = replay(&engine, points, tick).await?;
    engine.shutdown().await;

    let json = serde_json::to_string_pretty(&summary).context("Failed to serialize replay summary")?;
    println!("{}", json);
    Ok(())
}

/// List all rules
fn list_rules(config: &RulesrvConfig) -> Result<()> {
    let inputs = Inputs::load(&config.data)?;
    let rules = &inputs.rules;

    println!("{}", "Available rules:".bold());
    for rule in &rules.rules {
        let instances = rules
            .instances
            .iter()
            .filter(|i| i.rule_id == rule.id)
            .count();
        let state = if rule.enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        };
        println!(
            "  {} - {} [{}] window {}h v{} {} ({} instances)",
            rule.id,
            rule.name,
            rule.template.name(),
            rule.window_hours,
            rule.version,
            state,
            instances
        );
    }
    Ok(())
}
