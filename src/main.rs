//! egresswall - egress policy enforcement for sandboxed agent containers
//!
//! Thin binary entry point that delegates to the CLI handlers.

use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Load .env (non-fatal if missing).
    dotenvy::dotenv().ok();

    initialize_tracing();

    let args = Cli::parse();
    match args.command {
        Commands::Apply { dry_run } => cli::handle_apply_command(dry_run),
        Commands::Attribute { port } => cli::handle_attribute_command(&port),
    }
}

/// Honor `RUST_LOG` when set, defaulting to info-level events otherwise.
/// Diagnostics go to stderr; stdout carries only structured query output.
fn initialize_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("egresswall=info,egresswall_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
