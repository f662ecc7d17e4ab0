//! Diode network client CLI
//!
//! Commands:
//!   1) time
//!      - Validates the chain against the configured edge servers and
//!        prints the last valid block.
//!   2) resolve <name>
//!      - Resolves a name-service entry to its destination addresses.
//!   3) forward <local_port> <remote>
//!      - Forwards a local TCP port through the network to a device,
//!        e.g. `forward 2022 mypi.diode:22`.
//!   4) publish <device_port>=<local_addr> ...
//!      - Keeps the client connected and serves inbound opens for the
//!        published ports, e.g. `publish 80=127.0.0.1:8080`.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use diode_core::util::Address;

/// CLI definition
#[derive(Parser)]
#[command(name = "diode", version)]
struct Cli {
    /// Edge servers to connect to (host:port); may be repeated
    #[arg(
        long = "server",
        global = true,
        default_values_t = vec![
            "as1.prenet.diode.io:41046".to_string(),
            "eu1.prenet.diode.io:41046".to_string(),
            "us1.prenet.diode.io:41046".to_string(),
        ]
    )]
    pub(crate) servers: Vec<String>,

    /// Client database directory
    #[arg(long = "db", global = true, default_value = "diode.db")]
    pub(crate) db_path: PathBuf,

    /// Fleet contract governing this client
    #[arg(long, global = true)]
    pub(crate) fleet: Option<Address>,

    /// Trust anchor block number used on first run
    #[arg(long, global = true, default_value_t = 0)]
    pub(crate) genesis_number: u64,

    /// Trust anchor block hash (hex) used on first run
    #[arg(long, global = true)]
    pub(crate) genesis_hash: Option<String>,

    /// Tunnel payloads end-to-end encrypted (nested TLS)
    #[arg(long, global = true)]
    pub(crate) e2e: bool,

    #[command(subcommand)]
    pub(crate) cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Validate the chain and print the last valid block
    Time,

    /// Resolve a name-service entry
    Resolve {
        /// Name to look up, e.g. "mypi" or "mypi.diode"
        name: String,
    },

    /// Forward a local TCP port to a remote device
    Forward {
        /// Local port to listen on
        local_port: u16,
        /// Remote destination, e.g. "mypi.diode:22" or a hex address
        remote: String,
    },

    /// Publish local services to the fleet and stay connected
    Publish {
        /// Mappings of the form <device_port>=<local_addr>
        #[arg(required = true)]
        ports: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let setup = commands::Setup::from_cli(&cli)?;
    match cli.cmd {
        Cmd::Time => commands::time(setup).await,
        Cmd::Resolve { name } => commands::resolve(setup, &name).await,
        Cmd::Forward { local_port, remote } => commands::forward(setup, local_port, &remote).await,
        Cmd::Publish { ports } => commands::publish(setup, &ports).await,
    }
}
