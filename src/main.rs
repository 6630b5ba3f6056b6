//! vpnctl: VPN connection orchestrator.
//!
//! Parses the command line, loads configuration and hands off to
//! [`vpnctl::cli_handler`]. Logs go to stderr; progress for the user goes to
//! stdout.

use anyhow::{Context, Result};
use clap::Parser;
use vpnctl::{cli::Cli, cli_handler, config::ConfigLoader};
use tracing::debug;

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    // Load configuration with hierarchy merging
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;

    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    cli_handler::handle_command(cli.command, config)
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, then `general.log_level`, then warnings only
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if configured_level.is_empty() {
                "warn"
            } else {
                configured_level
            })
        }),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
