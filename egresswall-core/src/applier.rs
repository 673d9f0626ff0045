//! Idempotent application of a compiled rule set to the live packet filter.

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::backend::RuleBackend;
use crate::compiler::CompiledRuleset;
use crate::rules::{Chain, Family};

/// Built-in hook both managed chains are reached from.
const OUTPUT_HOOK: &str = "OUTPUT";

/// Applies compiled rules through a [`RuleBackend`].
///
/// The managed chains are flushed before rules are appended, so re-running
/// the applier converges to the compiled policy instead of accumulating
/// duplicates across container restarts. Insertion order is exactly the
/// compiler's order; packet-filter semantics are first-match.
pub struct RuleApplier<'a> {
    backend: &'a dyn RuleBackend,
}

impl<'a> RuleApplier<'a> {
    pub fn new(backend: &'a dyn RuleBackend) -> Self {
        Self { backend }
    }

    /// Install the rule set. IPv4 is applied unconditionally; IPv6 only when
    /// the backend probe reports support, otherwise that half is skipped with
    /// a single warning. Any rejected required command aborts: on failure the
    /// sandboxed workload must not be started.
    pub fn apply(&self, ruleset: &CompiledRuleset) -> Result<()> {
        for family in [Family::V4, Family::V6] {
            if family == Family::V6 && !self.backend.supports(family) {
                warn!("ipv6 filtering unsupported on this runtime; applying ipv4 rules only");
                continue;
            }
            self.prepare_chains(family)?;
            let mut count = 0usize;
            for rule in ruleset.family(family) {
                self.required(family, &rule.to_args())?;
                count += 1;
            }
            info!(tool = family.binary(), rules = count, "egress rules applied");
        }
        Ok(())
    }

    /// Create, flush, and re-hook the managed chains for one family.
    fn prepare_chains(&self, family: Family) -> Result<()> {
        for chain in [Chain::Nat, Chain::Output] {
            let table = chain.table();
            let name = chain.name();
            // Creation fails when the chain survives from a previous run;
            // the flush right after resets it either way.
            self.best_effort(family, &args(&["-t", table, "-N", name]));
            self.required(family, &args(&["-t", table, "-F", name]))?;
            // Remove a stale hook before re-adding so exactly one jump from
            // OUTPUT into the managed chain exists after every run.
            self.best_effort(family, &args(&["-t", table, "-D", OUTPUT_HOOK, "-j", name]));
            self.required(family, &args(&["-t", table, "-A", OUTPUT_HOOK, "-j", name]))?;
        }
        Ok(())
    }

    fn required(&self, family: Family, cmd: &[String]) -> Result<()> {
        let output = self.backend.run(family, cmd)?;
        if !output.success {
            bail!(
                "{} {} exited with status {:?}: {}",
                family.binary(),
                cmd.join(" "),
                output.code,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    fn best_effort(&self, family: Family, cmd: &[String]) {
        match self.backend.run(family, cmd) {
            Ok(output) if !output.success => {
                debug!(
                    tool = family.binary(),
                    command = cmd.join(" "),
                    stderr = output.stderr.trim(),
                    "best-effort command rejected"
                );
            }
            Ok(_) => {}
            Err(err) => {
                debug!(
                    tool = family.binary(),
                    command = cmd.join(" "),
                    error = %err,
                    "best-effort command failed to execute"
                );
            }
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}
