//! docmesh CLI
//!
//! Command-line interface for docmesh - document tree replication.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docmesh_core::Config;

mod commands;
mod output;

use commands::simulate::SimulateOptions;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "docmesh")]
#[command(about = "docmesh - replicate document trees across backends")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync an in-memory tree with in-memory backends and report progress
    Simulate {
        /// Number of shadow backends
        #[arg(long, default_value_t = 2)]
        shadows: usize,
        /// Number of sub-documents under the root
        #[arg(long, default_value_t = 3)]
        subdocs: usize,
        /// Make the first N pushes to the main backend fail
        #[arg(long, default_value_t = 0)]
        fail_pushes: usize,
        /// Override the configured retry delay
        #[arg(long)]
        retry_delay_ms: Option<u64>,
        /// Give up if the engine has not synced after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Print the config file path
    Path,
    /// Set a configuration value
    Set {
        /// Configuration key (retry_delay_ms, log_level)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Config { command } => handle_config_command(command, config_path, &output),
        Commands::Simulate {
            shadows,
            subdocs,
            fail_pushes,
            retry_delay_ms,
            timeout,
        } => {
            let mut config = Config::load_with_cli_override(config_path)
                .context("Failed to load configuration")?;
            if let Some(delay) = retry_delay_ms {
                config.retry_delay_ms = delay;
            }
            init_logging(&config);

            let options = SimulateOptions {
                shadows,
                subdocs,
                fail_pushes,
                timeout: Duration::from_secs(timeout),
            };
            commands::simulate::run(&config, options, &output).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&std::path::Path>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Path) => commands::config::path(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Log to stderr so status output on stdout stays machine-readable
fn init_logging(config: &Config) {
    let env_filter = EnvFilter::new(config.log_filter());

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
