//! Injectable execution backend for packet-filter commands.
//!
//! Kernel rule tables are global mutable state, so every mutation goes
//! through the [`RuleBackend`] trait: production uses [`IptablesBackend`]
//! (the real `iptables`/`ip6tables` binaries), tests use [`MemoryBackend`],
//! which models just enough chain semantics to verify ordering and
//! idempotence without privilege.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};

use crate::rules::Family;

/// Outcome of one backend invocation.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

impl From<std::process::Output> for CmdOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Strategy for mutating and probing the kernel packet filter.
pub trait RuleBackend: Send + Sync {
    /// Run one command against the given family's tables. An `Err` means the
    /// command could not be executed at all; a non-success [`CmdOutput`]
    /// means it ran and was rejected.
    fn run(&self, family: Family, args: &[String]) -> Result<CmdOutput>;

    /// Capability probe: can this family's rules be installed at runtime?
    fn supports(&self, family: Family) -> bool;
}

/// Live backend shelling out to `iptables`/`ip6tables`.
///
/// `-w` makes concurrent invocations wait on the xtables lock instead of
/// failing spuriously.
#[derive(Debug, Default)]
pub struct IptablesBackend;

impl IptablesBackend {
    pub fn new() -> Self {
        Self
    }
}

impl RuleBackend for IptablesBackend {
    fn run(&self, family: Family, args: &[String]) -> Result<CmdOutput> {
        let output = Command::new(family.binary())
            .arg("-w")
            .args(args)
            .output()
            .with_context(|| format!("failed to execute {}", family.binary()))?;
        Ok(output.into())
    }

    fn supports(&self, family: Family) -> bool {
        match family {
            Family::V4 => true,
            Family::V6 => {
                // The kernel must expose an IPv6 stack and the tool must run.
                Path::new("/proc/net/if_inet6").exists()
                    && Command::new(family.binary())
                        .arg("--version")
                        .output()
                        .map(|output| output.status.success())
                        .unwrap_or(false)
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    /// (family, table, chain) -> appended rule argument tails.
    chains: HashMap<(Family, String, String), Vec<Vec<String>>>,
    log: Vec<(Family, Vec<String>)>,
}

/// In-memory fake understanding the `-N`/`-F`/`-A`/`-D` subset the applier
/// emits, with the built-in `OUTPUT` chains pre-created.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    v6_supported: bool,
    fail_on: Option<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::build(true, None)
    }

    /// A backend whose capability probe reports no IPv6 stack.
    pub fn without_v6() -> Self {
        Self::build(false, None)
    }

    /// A backend that rejects any command whose argument string contains
    /// `needle`, for exercising fail-closed behavior.
    pub fn failing_on(needle: impl Into<String>) -> Self {
        Self::build(true, Some(needle.into()))
    }

    fn build(v6_supported: bool, fail_on: Option<String>) -> Self {
        let mut state = MemoryState::default();
        for family in [Family::V4, Family::V6] {
            for table in ["nat", "filter"] {
                state
                    .chains
                    .insert((family, table.to_string(), "OUTPUT".to_string()), Vec::new());
            }
        }
        Self {
            state: Mutex::new(state),
            v6_supported,
            fail_on,
        }
    }

    /// Current contents of a chain, as appended argument tails.
    pub fn chain_rules(&self, family: Family, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .map(|state| {
                state
                    .chains
                    .get(&(family, table.to_string(), chain.to_string()))
                    .cloned()
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn chain_exists(&self, family: Family, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .map(|state| {
                state
                    .chains
                    .contains_key(&(family, table.to_string(), chain.to_string()))
            })
            .unwrap_or(false)
    }

    /// Every invocation seen, in order.
    pub fn commands(&self) -> Vec<(Family, Vec<String>)> {
        self.state
            .lock()
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBackend for MemoryBackend {
    fn run(&self, family: Family, args: &[String]) -> Result<CmdOutput> {
        let mut state = self.state.lock().map_err(|_| anyhow!("state lock poisoned"))?;
        state.log.push((family, args.to_vec()));

        if let Some(needle) = &self.fail_on {
            if args.join(" ").contains(needle.as_str()) {
                return Ok(CmdOutput::fail("injected failure"));
            }
        }

        if args.len() < 4 || args[0] != "-t" {
            return Ok(CmdOutput::fail(format!("unsupported invocation: {args:?}")));
        }
        let key = (family, args[1].clone(), args[3].clone());
        let op = args[2].as_str();
        let tail = args[4..].to_vec();
        match op {
            "-N" => {
                if state.chains.contains_key(&key) {
                    Ok(CmdOutput::fail("Chain already exists"))
                } else {
                    state.chains.insert(key, Vec::new());
                    Ok(CmdOutput::ok())
                }
            }
            "-F" => match state.chains.get_mut(&key) {
                Some(rules) => {
                    rules.clear();
                    Ok(CmdOutput::ok())
                }
                None => Ok(CmdOutput::fail("No chain/target/match by that name")),
            },
            "-A" => match state.chains.get_mut(&key) {
                Some(rules) => {
                    rules.push(tail);
                    Ok(CmdOutput::ok())
                }
                None => Ok(CmdOutput::fail("No chain/target/match by that name")),
            },
            "-D" => match state.chains.get_mut(&key) {
                Some(rules) => match rules.iter().position(|rule| *rule == tail) {
                    Some(index) => {
                        rules.remove(index);
                        Ok(CmdOutput::ok())
                    }
                    None => Ok(CmdOutput::fail("No chain/target/match by that name")),
                },
                None => Ok(CmdOutput::fail("No chain/target/match by that name")),
            },
            other => Ok(CmdOutput::fail(format!("unsupported operation {other}"))),
        }
    }

    fn supports(&self, family: Family) -> bool {
        match family {
            Family::V4 => true,
            Family::V6 => self.v6_supported,
        }
    }
}
