//! # Oracle - Stage-Gated Conversation Server
//!
//! The main binary for the Oracle session engine.
//!
//! This application provides:
//! - HTTP REST API server (axum-based)
//! - CLI interface for inspecting stages, sessions and transition history
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    apps/oracle (THE BINARY)                  │
//! │                                                              │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐  │
//! │  │   CLI       │    │   HTTP API  │    │  TOML config     │  │
//! │  │  (clap)     │    │   (axum)    │    │  (oracle.toml)   │  │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘  │
//! │         │                  │                    │            │
//! │         └──────────────────┼────────────────────┘            │
//! │                            ▼                                 │
//! │                    ┌───────────────┐                         │
//! │                    │  oracle-core  │                         │
//! │                    │ (THE LOGIC)   │                         │
//! │                    └───────────────┘                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server with a persistent store
//! oracle --backend redb -D oracle.redb server --host 0.0.0.0 --port 8080
//!
//! # CLI operations
//! oracle stages
//! oracle evaluate --stage dialogical_companion --trust 400 --engagement 400
//! oracle history --user u-42
//! ```

use clap::Parser;
use oracle::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // ORACLE_LOG_FORMAT=json switches to machine-parseable output.
    let log_format = std::env::var("ORACLE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "oracle=info,oracle_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
   ___  ____      _    ____ _     _____
  / _ \|  _ \    / \  / ___| |   | ____|
 | | | | |_) |  / _ \| |   | |   |  _|
 | |_| |  _ <  / ___ \ |___| |___| |___
  \___/|_| \_\/_/   \_\____|_____|_____|

  Stage-Gated Oracle v{}

  Measured • Gated • Grounded
"#,
        env!("CARGO_PKG_VERSION")
    );
}
