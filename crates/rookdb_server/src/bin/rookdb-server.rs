//! RookDB server binary.
//!
//! Serves the binary protocol over TCP against in-memory storage. Disk
//! storage engines register through the `StorageRegistry` contract.

use clap::Parser;
use rookdb_core::{MemoryStorageRegistry, StorageRegistry};
use rookdb_server::{Server, ServerConfig, ServerContext};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// RookDB binary protocol server.
#[derive(Parser)]
#[command(name = "rookdb-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:2424")]
    listen: SocketAddr,

    /// Root user name
    #[arg(long, default_value = "root")]
    root_user: String,

    /// Root password
    #[arg(long, default_value = "root")]
    root_password: String,

    /// Databases to create at startup
    #[arg(short, long)]
    database: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let registry = Arc::new(MemoryStorageRegistry::new());
    for name in &cli.database {
        registry.create(name)?;
        tracing::info!(database = name, "created database");
    }

    let config = ServerConfig::new(cli.listen).with_root(cli.root_user, cli.root_password);
    let context = ServerContext::new(config, registry);
    Server::new(context).serve()?;
    Ok(())
}
