//! Attribution pipeline: source port → socket inode → owning process.
//!
//! The result is a single structured record in both the success and the
//! failure case, so audit pipelines always receive one parseable line per
//! query.

use std::path::Path;

use serde::Serialize;

use crate::error::AttributionError;
use crate::procscan::ProcScanner;
use crate::socket::SocketTable;

/// Structured attribution result for one queried port.
///
/// Serialized as one JSON line; `serde_json` escapes quotes, backslashes,
/// and control characters in every string field. Exactly one of `inode`
/// (success) and `error` (failure) is present.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessAttribution {
    #[serde(rename = "srcPort")]
    pub src_port: u16,
    /// Owning process id, or -1 when unknown.
    pub pid: i32,
    pub cmdline: String,
    pub comm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessAttribution {
    /// Record for a fully resolved query.
    pub fn resolved(src_port: u16, pid: i32, cmdline: String, comm: String, inode: String) -> Self {
        Self {
            src_port,
            pid,
            cmdline,
            comm,
            inode: Some(inode),
            error: None,
        }
    }

    /// Record for a failed query: sentinel pid, empty metadata, and a
    /// human-readable error.
    pub fn failure(src_port: u16, error: &AttributionError) -> Self {
        Self {
            src_port,
            pid: -1,
            cmdline: String::new(),
            comm: String::new(),
            inode: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// One-line JSON rendering.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Validate a raw port argument: decimal digits only, range 1-65535.
pub fn parse_port(raw: &str) -> Result<u16, AttributionError> {
    let trimmed = raw.trim();
    let invalid = || AttributionError::InvalidPort(raw.to_string());
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    match trimmed.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(port) => Ok(port),
    }
}

/// Runs the full lookup pipeline against one proc root.
#[derive(Debug, Clone, Default)]
pub struct Attributor {
    table: SocketTable,
    scanner: ProcScanner,
}

impl Attributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proc_root(root: impl AsRef<Path>) -> Self {
        Self {
            table: SocketTable::with_root(root.as_ref()),
            scanner: ProcScanner::with_root(root.as_ref()),
        }
    }

    /// Attribute a raw port argument to its owning process.
    ///
    /// Queries are read-only against kernel state and safe to run
    /// concurrently or abandon mid-flight.
    pub fn attribute(&self, raw_port: &str) -> Result<ProcessAttribution, AttributionError> {
        let port = parse_port(raw_port)?;
        let record = self.table.find_inode(port)?;
        let pid = self.scanner.find_pid(&record.inode)?;
        let meta = self.scanner.read_metadata(pid);
        Ok(ProcessAttribution::resolved(
            port,
            pid,
            meta.cmdline,
            meta.comm,
            record.inode,
        ))
    }
}
