use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleet_dispatch::db::{self, NodeRepo};
use fleet_dispatch::{Config, Daemon};

/// fleetd - agent connection registry and command dispatcher
#[derive(Parser)]
#[command(name = "fleetd", version, about)]
struct Cli {
    /// Port to listen on (overrides config file and `FLEET_PORT`)
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding the database (overrides config file and `FLEET_DATA_DIR`)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration
    Status,
    /// Add a host to the inventory
    AddNode {
        /// Agent hostname
        hostname: String,
    },
    /// Add hosts to a group, creating the group if needed
    AddToGroup {
        /// Group ID
        #[arg(short, long)]
        group: String,
        /// Display name for a new group
        #[arg(short, long)]
        name: Option<String>,
        /// Hostnames to add
        #[arg(required = true)]
        hostnames: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,fleet_dispatch=info",
        1 => "info,fleet_dispatch=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Status => cmd_status(&config),
            Command::AddNode { hostname } => cmd_add_node(&config, &hostname),
            Command::AddToGroup {
                group,
                name,
                hostnames,
            } => cmd_add_to_group(&config, &group, name.as_deref(), &hostnames),
        };
    }

    tracing::info!(
        port = config.api_server.port,
        data_dir = %config.data_dir.display(),
        "starting fleet dispatcher"
    );

    let daemon = Daemon::new(config)?;
    daemon.run().await?;
    Ok(())
}

#[allow(clippy::unnecessary_wraps)]
fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let liveness = &config.liveness;
    let dispatch = &config.dispatch;

    println!("fleetd {}", env!("CARGO_PKG_VERSION"));
    println!("  port:              {}", config.api_server.port);
    let auth = match (&config.api_server.api_key, config.api_server.allow_unauthenticated) {
        (Some(_), _) => "key set",
        (None, true) => "disabled (unauthenticated access allowed)",
        (None, false) => "not set (startup will fail)",
    };
    println!("  api auth:          {auth}");
    println!("  database:          {}", config.db_path().display());
    println!("  ping after:        {}s", liveness.ping_after.as_secs());
    println!("  evict after:       {}s", liveness.evict_after.as_secs());
    println!("  offline grace:     {}s", liveness.offline_grace.as_secs());
    println!("  ack timeout:       {}s", dispatch.ack_timeout.as_secs());
    println!("  write timeout:     {}s", dispatch.write_timeout.as_secs());
    println!("  queue capacity:    {}", dispatch.queue_capacity);
    if let Some(path) = fleet_dispatch::config::file::config_file_path() {
        println!("  config file:       {}", path.display());
    }
    Ok(())
}

fn open_inventory(config: &Config) -> anyhow::Result<NodeRepo> {
    std::fs::create_dir_all(&config.data_dir)?;
    let pool = db::init(config.db_path())?;
    Ok(NodeRepo::new(pool))
}

fn cmd_add_node(config: &Config, hostname: &str) -> anyhow::Result<()> {
    let repo = open_inventory(config)?;
    repo.create_node(hostname)?;
    println!("Added node {hostname}");
    Ok(())
}

fn cmd_add_to_group(
    config: &Config,
    group: &str,
    name: Option<&str>,
    hostnames: &[String],
) -> anyhow::Result<()> {
    let repo = open_inventory(config)?;
    repo.create_group(group, name.unwrap_or(group))?;
    for hostname in hostnames {
        repo.create_node(hostname)?;
        repo.add_to_group(group, hostname)?;
    }
    println!("Group {group}: {}", repo.members(group)?.join(", "));
    Ok(())
}
