//! Ticketscan CLI - Headless ticket scanning station
//!
//! This binary drives the scanning core from a terminal:
//! - List cameras and probe camera permission
//! - Run a scanning session, validating codes read from stdin
//! - Validate a single code without touching the camera
//! - Show the resolved configuration

mod scan;
mod surface;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use ticketscan_core::capture::{pick_default, platform_backend, DeviceCatalog, PermissionMonitor};
use ticketscan_core::{config, HttpValidationClient, ValidationClient};

#[derive(Parser)]
#[command(name = "ticketscan")]
#[command(author = "Ticketscan Team")]
#[command(version)]
#[command(about = "Headless ticket code scanning station")]
#[command(long_about = "
Ticketscan opens a camera, keeps it bound to a (headless) render surface
and validates the ticket codes fed to it against the ticket service.

Quick start:
  1. Check cameras:     ticketscan devices
  2. Start scanning:    ticketscan scan
  3. Validate by hand:  ticketscan validate NEBULA-1-abc

Codes are read from stdin, one per line. Pipe a decoder into it or use a
keyboard-wedge scanner.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available cameras
    #[command(alias = "cameras")]
    Devices,

    /// Check camera permission
    Permission,

    /// Start a scanning session and validate codes read from stdin
    Scan {
        /// Camera to use (see `ticketscan devices`); defaults to the rear camera
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Validate a single code
    Validate {
        /// The decoded ticket code
        code: String,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ticketscan={},ticketscan_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Devices => cmd_devices(&cli).await,
        Commands::Permission => cmd_permission(&cli).await,
        Commands::Scan { ref device } => scan::run_scan(cli.format, device.clone()).await,
        Commands::Validate { ref code } => cmd_validate(&cli, code).await,
        Commands::Config => cmd_config(&cli).await,
    }
}

async fn cmd_devices(cli: &Cli) -> Result<()> {
    let catalog = DeviceCatalog::new(platform_backend());
    let devices = catalog.list_cameras().await?;
    let default_id = pick_default(&devices).map(|d| d.id.clone());

    match cli.format {
        OutputFormat::Text => {
            if devices.is_empty() {
                println!("No cameras found.");
                return Ok(());
            }
            println!("Found {} camera(s):", devices.len());
            println!();
            for device in &devices {
                let marker = if Some(&device.id) == default_id.as_ref() { "*" } else { " " };
                let label = if device.label.is_empty() { "-" } else { device.label.as_str() };
                println!("{} {:20} {}", marker, device.id, label);
            }
            println!();
            println!("* default camera");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "devices": devices,
                "default_device_id": default_id,
            }));
        }
    }

    Ok(())
}

async fn cmd_permission(cli: &Cli) -> Result<()> {
    let monitor = PermissionMonitor::new(platform_backend());
    let state = monitor.probe().await;

    match cli.format {
        OutputFormat::Text => println!("Camera permission: {}", state),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "permission": state,
            }));
        }
    }

    Ok(())
}

async fn cmd_validate(cli: &Cli, code: &str) -> Result<()> {
    let endpoint = config::load_scan_config().validation;
    let client: Arc<dyn ValidationClient> = Arc::new(HttpValidationClient::new(&endpoint));

    match client.submit_code(code).await {
        Ok(verdict) => match cli.format {
            OutputFormat::Text => {
                println!("Code:    {}", code);
                println!("Valid:   {}", if verdict.is_valid { "yes" } else { "no" });
                if !verdict.message.is_empty() {
                    println!("Message: {}", verdict.message);
                }
            }
            OutputFormat::Json => println!("{}", serde_json::to_string(&verdict)?),
        },
        Err(e) => match cli.format {
            OutputFormat::Text => {
                eprintln!("Validation failed: {}", e);
                std::process::exit(1);
            }
            OutputFormat::Json => {
                println!("{}", serde_json::json!({
                    "code": code,
                    "error": e,
                }));
            }
        },
    }

    Ok(())
}

async fn cmd_config(cli: &Cli) -> Result<()> {
    let scan_config = config::load_scan_config();
    let config_path = config::config_file_display();
    let constraints = &scan_config.constraints;
    let session = &scan_config.session;

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {} ({})", config_path, scan_config.source);
            println!("Validation API:   {} (from {})", scan_config.validation.api_url, scan_config.validation.source);
            println!(
                "Resolution:       {}x{} (min {}x{})",
                constraints.width.ideal, constraints.height.ideal, constraints.width.min, constraints.height.min
            );
            println!("Frame rate:       {} (min {})", constraints.frame_rate.ideal, constraints.frame_rate.min);
            println!(
                "Surface wait:     {} x {:?}, metadata timeout {:?}",
                session.bind.max_poll_attempts, session.bind.poll_interval, session.bind.metadata_timeout
            );
            println!("Switch settle:    {:?}", session.settle_delay);
            println!();
            println!("Environment variables:");
            println!("  TICKETSCAN_VALIDATION_URL - Override validation endpoint");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "config_source": scan_config.source,
                "validation_url": scan_config.validation.api_url,
                "validation_source": scan_config.validation.source,
                "constraints": constraints,
                "poll_interval_ms": session.bind.poll_interval.as_millis() as u64,
                "max_poll_attempts": session.bind.max_poll_attempts,
                "metadata_timeout_ms": session.bind.metadata_timeout.as_millis() as u64,
                "settle_delay_ms": session.settle_delay.as_millis() as u64,
            }));
        }
    }

    Ok(())
}
