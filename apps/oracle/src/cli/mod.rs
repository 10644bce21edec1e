//! # Oracle CLI Module
//!
//! This module implements the CLI interface for the Oracle.
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server
//! - `stages` - Print the stage table
//! - `evaluate` - Run the stage evaluator on given signal levels
//! - `history` - Show a user's stage transitions
//! - `sessions` - List live sessions

mod commands;

use crate::config::{Backend, OracleConfig};
use clap::{Args, Parser, Subcommand};
use oracle_core::OracleError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Oracle - stage-gated conversation server
///
/// Serves each user at one of four maturity stages and moves them one step
/// at a time as their measured capacity changes.
#[derive(Parser, Debug)]
#[command(name = "oracle")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the session database (selects the redb backend unless --backend is given)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend
    #[arg(short = 'B', long, global = true, value_enum)]
    pub backend: Option<Backend>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to (overrides [server].host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the stage table
    Stages,

    /// Evaluate one stage decision from explicit signal levels
    Evaluate(EvaluateArgs),

    /// Show a user's stage transition history
    History {
        /// User identifier
        #[arg(short, long)]
        user: String,
    },

    /// List live sessions
    Sessions,
}

/// Inputs to `oracle evaluate`. Levels are per-mille (0-1000).
#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// Current stage (structured_guide, dialogical_companion, co_creative_partner, transparent_prism)
    #[arg(short, long, default_value = "structured_guide")]
    pub stage: String,

    #[arg(long, default_value_t = 500)]
    pub trust: u16,

    #[arg(long, default_value_t = 500)]
    pub engagement: u16,

    #[arg(long, default_value_t = 500)]
    pub integration: u16,

    #[arg(long, default_value_t = 700)]
    pub confidence: u16,

    /// Raise the safety flag
    #[arg(long)]
    pub safety: bool,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Resolve the configuration file and apply the global flag overrides.
pub fn load_config(cli: &Cli) -> Result<OracleConfig, OracleError> {
    let mut config = OracleConfig::resolve(cli.config.as_deref())?;

    if let Some(database) = &cli.database {
        config.storage.database = database.clone();
        config.storage.backend = Backend::Redb;
    }
    if let Some(backend) = cli.backend {
        config.storage.backend = backend;
    }
    Ok(config)
}

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), OracleError> {
    let config = load_config(&cli)?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(config, host, port).await,
        Some(Commands::Stages) => cmd_stages(&config, json_mode),
        Some(Commands::Evaluate(args)) => cmd_evaluate(&config, json_mode, &args),
        Some(Commands::History { user }) => cmd_history(&config, json_mode, &user),
        Some(Commands::Sessions) => cmd_sessions(&config, json_mode),
        None => cmd_stages(&config, json_mode),
    }
}
