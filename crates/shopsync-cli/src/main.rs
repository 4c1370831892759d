//! ShopSync CLI
//!
//! Command-line interface for the shopsync offline sync core: inspect the
//! queue, record local changes, run syncs and review conflicts.

use std::fs::OpenOptions;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shopsync_core::Config;

mod app;
mod commands;
mod output;

use app::App;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "shopsync")]
#[command(about = "ShopSync - Offline-first sync for point-of-sale data")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log verbosity (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue, conflict and sync status
    Status,
    /// Inspect and manage the sync queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Record a local change and queue it for upload
    Record {
        /// Entity type (product, sale, stock_movement)
        entity: String,
        /// Operation (create, update, delete)
        operation: String,
        /// Entity id; generated for creates when omitted
        #[arg(long)]
        id: Option<String>,
        /// Changed fields as a JSON object
        #[arg(short, long)]
        data: Option<String>,
    },
    /// Sync with the server
    Sync {
        /// Keep running and sync periodically and on reconnection
        #[arg(long)]
        watch: bool,
    },
    /// Review and resolve conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued operations in upload order
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, in_flight, conflicted, failed)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show queue statistics
    Stats,
    /// Remove queued operations
    Clear {
        /// Only remove operations with this status
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Return failed operations to the queue
    Requeue,
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts
    #[command(alias = "ls")]
    List {
        /// Include resolved conflicts
        #[arg(short, long)]
        all: bool,
    },
    /// Show both sides of a conflict
    Show {
        /// Conflict ID (full or prefix)
        id: String,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID (full or prefix)
        id: String,
        /// Strategy (last_write_wins, client_wins, server_wins, merge, business_rules)
        #[arg(short, long)]
        strategy: Option<String>,
        /// Resolved record as JSON
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (server_url, sync_enabled, sync.batch_size, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work even with a broken data directory
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(&output),
            Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, &output),
        };
    }

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config, &cli.log_level);
    let app = App::open(config)?;

    match cli.command {
        Commands::Config { .. } => Ok(()), // Handled above
        Commands::Status => commands::status::show(&app, &output).await,
        Commands::Queue { command } => match command {
            QueueCommands::List { status } => commands::queue::list(&app, status, &output),
            QueueCommands::Stats => commands::queue::stats(&app, &output),
            QueueCommands::Clear { status } => commands::queue::clear(&app, status, &output),
            QueueCommands::Requeue => commands::queue::requeue(&app, &output),
        },
        Commands::Record {
            entity,
            operation,
            id,
            data,
        } => commands::record::record(&app, entity, operation, id, data, &output),
        Commands::Sync { watch: true } => commands::sync::watch(&app, &output).await,
        Commands::Sync { watch: false } => commands::sync::sync(&app, &output).await,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { all } => commands::conflicts::list(&app, all, &output),
            ConflictCommands::Show { id } => commands::conflicts::show(&app, id, &output),
            ConflictCommands::Resolve { id, strategy, data } => {
                commands::conflicts::resolve(&app, id, strategy, data, &output).await
            }
        },
    }
}

/// Initialize tracing to stderr, or to `log_file` when configured
fn init_logging(config: &Config, level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("shopsync_core={},shopsync_cli={}", level, level))
    });

    match &config.log_file {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                    return;
                }
            };
            // Ignore error if already initialized
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(file)
                .try_init();
            info!("Logging to {:?}", path);
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
