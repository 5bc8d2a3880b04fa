//! Zone server binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zonelog::{Config, ZoneServerNode};

#[derive(Parser)]
#[command(name = "zonelog-server")]
#[command(about = "zonelog zone server with Raft replication and federation shipping")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a zone server
    Serve {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Server ID inside the zone
        #[arg(long)]
        server_id: Option<i32>,

        /// Zone ID
        #[arg(long)]
        zone_id: Option<i32>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Bind address for gRPC
        #[arg(long)]
        grpc: Option<SocketAddr>,

        /// Bind address for the HTTP admin API
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Endpoint peers use to reach this server
        #[arg(long)]
        endpoint: Option<String>,

        /// Run as a cache-only replica
        #[arg(long)]
        cache: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            server_id,
            zone_id,
            data_dir,
            grpc,
            http,
            endpoint,
            cache,
        } => {
            // Load config from file and environment, then apply CLI overrides
            let mut config = Config::load(config.as_deref())?;
            if let Some(id) = server_id {
                config.server_id = id;
            }
            if let Some(id) = zone_id {
                config.zone_id = id;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(addr) = grpc {
                config.grpc_addr = addr;
            }
            if let Some(addr) = http {
                config.http_addr = addr;
            }
            if let Some(endpoint) = endpoint {
                config.endpoint = endpoint;
            }
            config.cache |= cache;
            config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            ZoneServerNode::new(config).serve().await?;
        }
    }

    Ok(())
}
