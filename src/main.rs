//! ONVIF SOAP engine command-line tool.
//!
//! Run with: `onvif-soap --config config.yaml discover`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use onvif_soap::discovery::NETWORK_VIDEO_TRANSMITTER;
use onvif_soap::{DeviceAdvertisement, DiscoveryClient, DiscoveryResponder, OnvifConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// WS-Discovery probe and responder for ONVIF devices.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the network and print the devices that answered
    Discover {
        /// Scope filter (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,

        /// Type filter such as dn:NetworkVideoTransmitter (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,

        /// Collection window in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,

        /// Print matches as JSON
        #[arg(long)]
        json: bool,
    },

    /// Answer probes for one device until Ctrl+C
    Advertise {
        /// Endpoint reference, e.g. urn:uuid:...
        #[arg(long)]
        endpoint: String,

        /// Service URL (repeatable)
        #[arg(long = "xaddr", required = true)]
        xaddrs: Vec<String>,

        /// Advertised scope (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,

        /// Advertised type (repeatable)
        #[arg(long = "type", default_value = NETWORK_VIDEO_TRANSMITTER)]
        types: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = if args.config.exists() {
        OnvifConfig::load(&args.config).context("Failed to load config file")?
    } else {
        info!("Config file not found, using defaults");
        OnvifConfig::default()
    };

    match args.command {
        Command::Discover {
            scopes,
            types,
            window_ms,
            json,
        } => {
            if let Some(window_ms) = window_ms {
                config.discovery.window_ms = window_ms;
            }
            config.validate().context("Invalid configuration")?;

            let client = DiscoveryClient::new(config.discovery);
            let matches = client
                .probe_for(&types, &scopes)
                .await
                .context("Discovery failed")?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&matches).context("Failed to encode matches")?
                );
            } else {
                for m in &matches {
                    println!("{}", m.endpoint_reference);
                    println!("  xaddrs:  {}", m.xaddrs.join(" "));
                    println!("  types:   {}", m.types.join(" "));
                    println!("  scopes:  {}", m.scopes.join(" "));
                    println!("  version: {}", m.metadata_version);
                }
                info!(devices = matches.len(), "Discovery finished");
            }
        }

        Command::Advertise {
            endpoint,
            xaddrs,
            scopes,
            types,
        } => {
            config.validate().context("Invalid configuration")?;

            let device = Arc::new(DeviceAdvertisement::new(endpoint, types, scopes, xaddrs));
            let responder = DiscoveryResponder::bind(&config.discovery, device)
                .await
                .context("Failed to bind discovery responder")?;

            info!(
                addr = %responder.local_addr().context("Failed to read local address")?,
                "Advertising device"
            );
            responder
                .run_until(shutdown_signal())
                .await
                .context("Discovery responder error")?;
            info!("Responder stopped");
        }
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
