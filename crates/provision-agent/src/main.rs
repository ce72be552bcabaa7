use anyhow::{Context, Result};
use clap::Parser;
use provision_agent::{AgentApi, HttpApi, MachineAgent, ScriptRunner, SystemPower};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about = "Run the tasks a provisioning server assigns to this machine", long_about = None)]
struct Args {
    /// API root of the provisioning server
    #[arg(long, env = "RS_ENDPOINT")]
    endpoint: String,

    /// Bearer token to authenticate with
    #[arg(long, env = "RS_TOKEN")]
    token: Option<String>,

    /// UUID of the machine this agent runs on
    #[arg(long, env = "RS_UUID")]
    machine: String,

    /// Exit instead of retrying when something fails
    #[arg(long)]
    exit_on_failure: bool,

    /// Exit when the machine does not become runnable in time
    #[arg(long)]
    exit_on_not_runnable: bool,

    /// Actually reboot or power off the machine when asked to
    #[arg(long)]
    power: bool,

    /// Seconds to wait for the machine to change before giving up
    #[arg(long, default_value = "3600")]
    timeout: u64,

    /// Directory jobs run in (default: a fresh temporary directory)
    #[arg(long)]
    runner_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("provision_agent={}", level))),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let uuid = Uuid::parse_str(&args.machine)
        .with_context(|| format!("invalid machine UUID {}", args.machine))?;
    let api: Arc<dyn AgentApi> = Arc::new(
        HttpApi::new(&args.endpoint, args.token.clone()).context("Failed to create HTTP client")?,
    );
    let machine = api
        .get_machine(&uuid.to_string())
        .await
        .with_context(|| format!("Failed to fetch machine {}", uuid))?;
    info!(machine = %machine.uuid, name = %machine.name, stage = %machine.stage, "Starting agent");

    let runner_dir = match args.runner_dir {
        Some(dir) => dir,
        None => tempfile::Builder::new()
            .prefix("runner-")
            .tempdir()
            .context("Failed to create runner directory")?
            .keep(),
    };
    let tasks = Arc::new(ScriptRunner::new(api.clone(), runner_dir));
    let power = Arc::new(SystemPower::new(api.clone(), args.power));

    let mut agent = MachineAgent::new(api, machine, tasks, power)
        .with_timeout(Duration::from_secs(args.timeout))
        .exit_on_failure(args.exit_on_failure)
        .exit_on_not_runnable(args.exit_on_not_runnable);

    if let Err(e) = agent.run().await {
        error!(error = %e, "Agent finished with an error");
        return Err(e).context("Agent run failed");
    }
    info!("Agent finished");
    Ok(())
}
