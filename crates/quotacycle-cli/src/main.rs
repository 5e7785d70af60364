//! quotacycle CLI - inspect and repair quota reset cycles
//!
//! A command-line interface for recording quota readings, repairing merged
//! cycles, and reporting per-cycle usage.

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use quotacycle_core::TuningConfig;

#[derive(Parser)]
#[command(name = "quotacycle")]
#[command(author, version, about = "Quota reset-cycle tracking CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = output::OutputFormat::Table)]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Override database path (or set QUOTACYCLE_DB_PATH env var)
    #[arg(long, env = "QUOTACYCLE_DB_PATH", global = true)]
    db: Option<String>,

    /// Provider tuning file (JSON); built-in tuning when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one quota reading and run it through the tracker
    Record(commands::record::RecordArgs),

    /// Split cycles that merged across a missed reset
    Repair {
        /// Run even if a previous repair pass completed
        #[arg(long)]
        force: bool,
    },

    /// Show the usage summary of a quota
    Summary {
        /// Provider (anthropic, codex, synthetic, zai, copilot, antigravity, minimax)
        provider: quotacycle_core::ProviderKind,

        /// Quota key, e.g. five_hour
        quota: String,
    },

    /// List the active and closed cycles of a quota
    Cycles {
        provider: quotacycle_core::ProviderKind,

        quota: String,

        /// Maximum number of closed cycles to show
        #[arg(long, short)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let out = output::Printer::new(cli.format, cli.quiet);
    let default_filter = if out.is_quiet() { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    // Set up database path if provided
    if let Some(db_path) = &cli.db {
        std::env::set_var(quotacycle_core::db::DB_PATH_ENV, db_path);
    }

    let config = match &cli.config {
        Some(path) => {
            log::debug!("Loading tuning config from {}", path.display());
            TuningConfig::load(path)?
        }
        None => TuningConfig::default(),
    };

    // Initialize database
    let db = quotacycle_core::Database::new().await?;

    // Create context for commands
    let ctx = commands::Context::new(db, config, out);

    // Execute command
    match cli.command {
        Commands::Record(args) => commands::record::execute(&ctx, args).await,
        Commands::Repair { force } => commands::repair::execute(&ctx, force).await,
        Commands::Summary { provider, quota } => {
            commands::summary::execute(&ctx, provider, quota).await
        }
        Commands::Cycles {
            provider,
            quota,
            limit,
        } => commands::cycles::execute(&ctx, provider, quota, limit).await,
    }
}
