//! CLI argument definitions and subcommand handlers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use egresswall_core::{
    Attributor, IptablesBackend, ProcessAttribution, RuleApplier, TrustPolicy, compile, parse_port,
};

#[derive(Parser)]
#[command(name = "egresswall")]
#[command(about = "Egress policy enforcement and connection attribution for sandboxed containers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile the egress policy from the environment and install it into
    /// the kernel packet filter
    Apply {
        /// Print the compiled rules instead of touching the kernel
        #[arg(long)]
        dry_run: bool,
    },
    /// Attribute a local TCP source port to its owning process
    Attribute {
        /// Local source port (decimal, 1-65535)
        port: String,
    },
}

/// Compile and install the egress policy. Runs once at container start and
/// must succeed before the sandboxed workload is launched.
pub fn handle_apply_command(dry_run: bool) -> Result<()> {
    let policy = TrustPolicy::from_env().context("egress policy could not be constructed")?;
    let ruleset = compile(&policy);

    if dry_run {
        for rule in ruleset.rules() {
            println!("{rule}");
        }
        return Ok(());
    }

    let backend = IptablesBackend::new();
    RuleApplier::new(&backend)
        .apply(&ruleset)
        .context("failed to install egress rules; the workload must not start")?;
    info!(rules = ruleset.len(), "egress policy active");
    Ok(())
}

/// Run one attribution query and print a single-line JSON record. Exits
/// non-zero on validation (2) or lookup (1) failure, after the record is
/// written.
pub fn handle_attribute_command(raw_port: &str) -> Result<()> {
    let attributor = Attributor::new();
    match attributor.attribute(raw_port) {
        Ok(record) => {
            println!("{}", record.to_json_line()?);
            Ok(())
        }
        Err(err) => {
            let src_port = parse_port(raw_port).unwrap_or(0);
            let record = ProcessAttribution::failure(src_port, &err);
            println!("{}", record.to_json_line()?);
            std::process::exit(err.exit_code());
        }
    }
}
