use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use provision_dhcp::{DhcpServer, NoProbe};
use provision_store::{create_backing, DataTracker, StoreConfig};
use std::io::stderr;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod config;

use config::ServeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Bare-metal provisioning server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the data store and DHCP server
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// YAML configuration file
    #[arg(short, long, env = "PROVISION_CONFIG")]
    config: Option<PathBuf>,

    /// Persist objects in a redb database at this path instead of memory
    #[arg(long, env = "PROVISION_DB")]
    db: Option<String>,

    /// Directory for the database and boot files
    #[arg(long, env = "PROVISION_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory boot files are served from
    #[arg(long, env = "PROVISION_FILE_ROOT")]
    file_root: Option<PathBuf>,

    /// Address to advertise to machines
    #[arg(long, env = "PROVISION_STATIC_IP")]
    static_ip: Option<Ipv4Addr>,

    /// Interfaces to serve DHCP on (default: all)
    #[arg(long, value_delimiter = ',', env = "PROVISION_DHCP_INTERFACES")]
    dhcp_interfaces: Vec<String>,

    /// UDP port for the DHCP server
    #[arg(long, env = "PROVISION_DHCP_PORT")]
    dhcp_port: Option<u16>,

    /// Only answer PXE clients, never hand out addresses
    #[arg(long)]
    proxy_only: bool,

    /// Do not run the DHCP server
    #[arg(long)]
    no_dhcp: bool,
}

impl ServeArgs {
    fn into_config(self) -> Result<ServeConfig> {
        let mut config = match &self.config {
            Some(path) => ServeConfig::load(path)?,
            None => ServeConfig::default(),
        };
        if let Some(path) = self.db {
            config.backend = StoreConfig::Redb { path };
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        if self.file_root.is_some() {
            config.file_root = self.file_root;
        }
        if self.static_ip.is_some() {
            config.static_ip = self.static_ip;
        }
        if !self.dhcp_interfaces.is_empty() {
            config.dhcp.interfaces = self.dhcp_interfaces;
        }
        if let Some(port) = self.dhcp_port {
            config.dhcp.port = port;
        }
        config.dhcp.proxy_only |= self.proxy_only;
        config.dhcp.enabled &= !self.no_dhcp;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "provision={level},provision_store={level},provision_dhcp={level}",
        level = level
    );
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    match cli.command {
        Commands::Serve(args) => serve(args.into_config()?).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    let store = config.store();
    let backing = create_backing(&store).wrap_err("Failed to open the data store")?;
    let dt = Arc::new(
        DataTracker::new(backing, config.tracker()).wrap_err("Failed to load the data store")?,
    );
    if !config.prefs.is_empty() {
        dt.set_prefs(&config.prefs)
            .wrap_err("Failed to apply configured preferences")?;
    }
    info!(backend = ?store, "data store ready");

    dt.cache().start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dhcp_task = if config.dhcp.enabled {
        let server = Arc::new(DhcpServer::new(config.dhcp()?, dt.clone(), Arc::new(NoProbe)));
        info!(
            port = server.config().port,
            proxy_only = server.config().proxy_only,
            "starting DHCP server"
        );
        Some(tokio::spawn(server.run(shutdown_rx)))
    } else {
        info!("DHCP server disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to install Ctrl+C handler")?;
    info!("Ctrl+C received, shutting down...");
    let _ = shutdown_tx.send(true);

    let mut result = Ok(());
    if let Some(task) = dhcp_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "DHCP server failed");
                result = Err(eyre!(e));
            }
            Err(e) => {
                warn!(error = %e, "DHCP server task aborted");
            }
        }
    }
    dt.cache().stop().await;
    info!("shutdown complete");
    result
}
