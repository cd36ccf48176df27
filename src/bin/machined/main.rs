use std::{path::PathBuf, str::FromStr};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use machine_dispatch::{Address, Config};
use tracing_subscriber::{fmt::format::FmtSpan, FmtSubscriber};

mod cmd_call;
mod cmd_serve;

/// Dispatch JSON-RPC calls to machines over pipes, tcp and usb.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "machined")]
struct Cli {
    /// verbosity of logging output [trace, debug, info, warn, error]
    #[arg(long, short, default_value = "info")]
    log_level: String,

    /// Config file to use; built-in defaults when absent.
    #[arg(long, short, env = "MACHINED_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured machines and serve clients until interrupted.
    Serve {
        /// Listen address, overriding `[server] address` from the config.
        #[arg(long, short)]
        address: Option<Address>,
    },

    /// Issue one request and print its result as JSON.
    Call {
        /// Where to send the request.
        address: Address,

        /// Method to invoke.
        method: String,

        /// Params as JSON, either an array or an object.
        params: Option<String>,

        /// Seconds to wait for the result, overriding the config.
        #[arg(long)]
        timeout: Option<f64>,

        /// Seconds to wait between heartbeats, overriding the config.
        #[arg(long)]
        heartbeat_timeout: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(
            tracing::Level::from_str(&cli.log_level)
                .map_err(|_| anyhow::anyhow!("unknown log level {:?}", cli.log_level))?,
        )
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Serve { ref address } => cmd_serve::main(&config, address.as_ref()).await,
        Commands::Call {
            ref address,
            ref method,
            ref params,
            timeout,
            heartbeat_timeout,
        } => {
            cmd_call::main(
                &config,
                address,
                method,
                params.as_deref(),
                timeout,
                heartbeat_timeout,
            )
            .await
        }
    }
}
