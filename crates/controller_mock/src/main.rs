use std::{path::PathBuf, time::Duration};

use agent_protocol::control_client::AgentClient;
use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use controller_mock::ControllerService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "controller-mock",
    about = "Minimal controller for poking at logship agents",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept heartbeats from agents and print a summary on exit
    Listen(ListenArgs),

    /// Push a pipeline config to an agent
    Push(PushArgs),

    /// Ask an agent for its heartbeat
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct ListenArgs {
    #[arg(long, default_value = "127.0.0.1:7000")]
    addr: String,
}

#[derive(Args, Debug)]
struct PushArgs {
    /// Agent control endpoint, e.g. 127.0.0.1:9000
    #[arg(long)]
    agent: String,

    /// YAML file holding a single top-level `pipeline` key
    #[arg(long)]
    config: PathBuf,

    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long)]
    agent: String,

    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Listen(args) => listen(args).await,
        Commands::Push(args) => {
            let timeout = Duration::from_millis(args.timeout_ms);
            let config = tokio::fs::read(&args.config)
                .await
                .with_context(|| format!("reading {}", args.config.display()))?;
            let client = AgentClient::connect(&args.agent, timeout).await?;
            let resp = client.update_config(config, timeout).await?;
            if !resp.header.is_ok() {
                bail!("agent rejected config: {}", resp.header.error.message);
            }
            println!("config applied");
            if let Some(hb) = resp.heartbeat {
                println!("{}", String::from_utf8_lossy(&hb.config));
            }
            Ok(())
        }
        Commands::Status(args) => {
            let timeout = Duration::from_millis(args.timeout_ms);
            let client = AgentClient::connect(&args.agent, timeout).await?;
            let hb = client.get_heartbeat(timeout).await?;
            println!("id: {}\nstatus: {}\nrpc port: {}", hb.id, hb.status, hb.rpc_port);
            println!("{}", String::from_utf8_lossy(&hb.config));
            Ok(())
        }
    }
}

async fn listen(args: ListenArgs) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    let service = ControllerService::new();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(service.clone().serve(listener, cancel.clone()));
    info!(addr = %args.addr, "waiting for heartbeats; press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    let _ = server.await;

    for id in service.agents() {
        if let Some(record) = service.record_of(id) {
            println!(
                "agent {id}: {} heartbeats, last {} ({}, port {})",
                record.received,
                record.last_seen.to_rfc3339(),
                record.heartbeat.status,
                record.heartbeat.rpc_port
            );
        }
    }
    Ok(())
}
