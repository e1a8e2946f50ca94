use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use logship::{
    AgentsManager, DriverRegistry, ManagerError, ManagerOptions,
    agent::{INPUT, OUTPUT, PIPELINE},
    config::{AgentsManagerConfig, CONTROLLER, Content, RPC_PORT, load_config_file},
    connector::DEFAULT_CAPACITY,
    logger::{LogConfig, init_tracing},
    pipeline::PipelineStage,
    watcher::{ConfigWatcher, DEFAULT_POLL_INTERVAL},
};
use serde_json::Value;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "logship",
    about = "Log shipping agent managed by a remote controller",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent
    Run(RunArgs),

    /// Check a config file without starting anything
    Validate(ValidateArgs),

    /// List the registered drivers and transforms
    Drivers,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Agent config file (YAML)
    #[arg(long, short)]
    config: PathBuf,

    /// Override the controller address from the config file
    #[arg(long)]
    controller: Option<String>,

    /// Override the control RPC port from the config file
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write daily rolling log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry logs endpoint (e.g. http://localhost:4318/v1/logs)
    #[arg(long)]
    otel_logs_endpoint: Option<String>,

    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    channel_capacity: usize,

    /// Reload the pipeline section when the config file changes
    #[arg(long, default_value_t = false)]
    watch: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match Cli::parse().command {
        Commands::Run(args) => run(args).await,
        Commands::Validate(args) => {
            validate(&args.config)?;
            println!("{} is valid", args.config.display());
            Ok(())
        }
        Commands::Drivers => {
            let registry = DriverRegistry::with_builtins();
            println!("inputs:     {}", registry.input_names().join(", "));
            println!("outputs:    {}", registry.output_names().join(", "));
            println!("transforms: {}", registry.transform_names().join(", "));
            Ok(())
        }
    }
}

fn apply_overrides(content: &mut Content, args: &RunArgs) {
    if let Some(controller) = &args.controller {
        content.insert(CONTROLLER.into(), Value::String(controller.clone()));
    }
    if let Some(port) = args.rpc_port {
        content.insert(RPC_PORT.into(), Value::from(port));
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let content = load_config_file(path)?;
    let config = AgentsManagerConfig::from_content(content)?;
    let registry = DriverRegistry::with_builtins();
    if let Some(section) = config.section(INPUT) {
        registry.build_input(section).context("input")?;
    }
    if let Some(section) = config.section(OUTPUT) {
        registry.build_output(section).context("output")?;
    }
    PipelineStage::from_config(&registry, config.section(PIPELINE)).context("pipeline")?;
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let _logs = init_tracing(&LogConfig {
        level: args.log_level.clone(),
        log_dir: args.log_dir.clone(),
        otel_endpoint: args.otel_logs_endpoint.clone(),
    })?;

    let mut content = load_config_file(&args.config)?;
    apply_overrides(&mut content, &args);

    let options = ManagerOptions {
        channel_capacity: args.channel_capacity,
        ..Default::default()
    };
    let manager = AgentsManager::with_options(DriverRegistry::with_builtins(), options).await?;
    manager
        .set_config(content)
        .await
        .with_context(|| format!("applying {}", args.config.display()))?;

    match manager.run().await {
        Ok(()) => {}
        Err(e @ ManagerError::Bind { .. }) => {
            error!(error = %e, "agent cannot be managed without its control endpoint");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }
    if let Some(addr) = manager.rpc_addr() {
        info!(%addr, "logship running; press Ctrl-C to exit");
    }

    let watcher = if args.watch {
        Some(ConfigWatcher::spawn(args.config.clone(), manager.clone(), DEFAULT_POLL_INTERVAL)?)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    drop(watcher);
    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "agents did not shut down cleanly");
    }
    Ok(())
}
