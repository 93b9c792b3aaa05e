//! sitelink CLI
//!
//! Inspect and drive sitelink topologies: list device kinds, hosts and links,
//! manage the port pool, and run a small demo topology.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    build_topology, cmd_demo, cmd_devices, cmd_hosts, cmd_links, cmd_pool_clear, cmd_pool_list,
};
use sitelink::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON); falls back to $SITELINK_CONFIG, then ./sitelink.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Work against an in-memory fabric instead of the kernel
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered device kinds
    Devices,

    /// List hosts discovered from every device manager
    Hosts {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List links discovered between hosts
    Links {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Inspect or empty the port pool
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Build two sites and a switch, link them, report, and tear down
    Demo {
        /// Leave the demo topology in place
        #[arg(long)]
        keep: bool,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// List idle veth ends
    List,
    /// Destroy every idle pair
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let topology = build_topology(&config, cli.dry_run).await?;

    match cli.command {
        Commands::Devices => {
            cmd_devices(&topology).await?;
        }
        Commands::Hosts { json } => {
            cmd_hosts(&topology, json).await?;
        }
        Commands::Links { json } => {
            cmd_links(&topology, json).await?;
        }
        Commands::Pool { action } => match action {
            PoolAction::List => cmd_pool_list(&topology).await?,
            PoolAction::Clear => cmd_pool_clear(&topology).await?,
        },
        Commands::Demo { keep } => {
            cmd_demo(&topology, keep).await?;
        }
    }

    Ok(())
}
