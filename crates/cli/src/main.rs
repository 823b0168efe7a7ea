#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::Result;
use tern_config::TernConfig;

mod builder;
use builder::AppBuilder;

mod commands;

mod logging;
use logging::{Logger, init_tracing};

mod store;

/// Wallet queries against public Electrum servers.
#[derive(Debug, Parser)]
#[command(name = "tern", author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true, env = "TERN_CONFIG")]
    config: Option<PathBuf>,

    /// Network, overriding the configuration file.
    #[arg(short, long, global = true, env = "TERN_NETWORK")]
    network: Option<String>,

    /// Log filter directive.
    #[arg(long, default_value = "warn", global = true, env = "TERN_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Confirmed and unconfirmed balance of the given addresses.
    Balance {
        /// Addresses to sum.
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Unspent outputs of the given addresses.
    Utxos {
        /// Addresses to list.
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Transaction history of the given addresses.
    History {
        /// Addresses to list.
        #[arg(required = true)]
        addresses: Vec<String>,
        /// Resolve every transaction (inputs, outputs, fee, net effect).
        #[arg(long)]
        details: bool,
    },
    /// A single transaction.
    Tx {
        /// Transaction id.
        txid: String,
        /// Print the raw hex instead of decoded details.
        #[arg(long)]
        raw: bool,
        /// Addresses whose net effect is computed.
        #[arg(long = "address", value_name = "ADDRESS")]
        addresses: Vec<String>,
    },
    /// Fee estimates in sat/vB.
    Fees,
    /// Broadcast a raw transaction.
    Broadcast {
        /// Consensus-encoded transaction hex.
        raw_tx: String,
    },
    /// Current chain tip height, or the timestamp of a block.
    Height {
        /// Print the timestamp of this block instead.
        #[arg(long)]
        timestamp_of: Option<u32>,
    },
    /// Follow the given addresses and print changes until interrupted.
    Watch {
        /// Addresses to follow.
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Known servers with their health scores.
    Servers {
        /// Connect once before listing.
        #[arg(long)]
        probe: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => TernConfig::from_file(path)?,
        None => TernConfig::default(),
    };
    if let Some(network) = cli.network {
        config.network = network.to_ascii_lowercase();
        config.validate()?;
    }
    Logger::new().log(&config);

    let app = AppBuilder::new().build(&config).await?;
    let result = commands::run(&app, cli.command).await;
    app.shutdown().await;
    result
}
