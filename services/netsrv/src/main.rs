//! netsrv entry point
//!
//! Reads JSON lines from stdin (see `netsrv::reading`) and forwards them
//! until stdin closes or SIGINT/SIGTERM arrives, then flushes every
//! publisher and closes the broker sessions.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use common::{load_config_from_file, wait_for_shutdown};
use netsrv::{NetsrvConfig, NetworkService, SerializerRegistry};
use voltage_buffer::ConnectionRegistry;

#[derive(Parser, Debug)]
#[command(name = "netsrv", about = "Network service: telemetry to MQTT with durable buffering")]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short, long, env = "NETSRV_CONFIG", default_value = "config/netsrv.yml")]
    config: PathBuf,

    /// Disable colored console output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config: NetsrvConfig = load_config_from_file(&args.config, Some("NETSRV_"))
        .with_context(|| format!("loading {}", args.config.display()))?;
    common::logging::init_with_config(config.logging.to_log_config(!args.no_color))?;
    info!("Starting netsrv with {}", args.config.display());

    let serializers = SerializerRegistry::with_defaults();
    let registry = ConnectionRegistry::new();
    let service = NetworkService::connect(&config, &serializers, &registry)?;
    service.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!("{} received, shutting down", signal);
                break;
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => service.handle_line(&line).await,
                Ok(None) => {
                    info!("Input closed, shutting down");
                    break;
                },
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                },
            },
        }
    }

    service.shutdown().await;
    Ok(())
}
