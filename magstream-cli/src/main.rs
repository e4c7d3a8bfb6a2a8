//! Magstream CLI - Command-line interface
//!
//! Runs the streaming server and exposes the probe and resolve stages for
//! inspecting media outside of a request.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use magstream_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "magstream")]
#[command(about = "Range-aware streaming transcode server")]
#[command(version)]
struct Cli {
    /// Console log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for the full debug log of this run
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.as_tracing_level();
    if let Err(e) = init_tracing(level, cli.logs_dir.as_deref()) {
        // Console-only logging when the log file cannot be written
        tracing_subscriber::fmt().with_max_level(level).init();
        tracing::warn!("File logging unavailable: {}", e);
    }

    commands::handle_command(cli.command).await
}
