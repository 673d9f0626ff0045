//! Socket-to-process correlation over the process table.
//!
//! A socket inode is matched by walking every numeric directory under the
//! proc root and reading each file-descriptor symlink until one points at
//! `socket:[<inode>]`. Descriptor tables can change between the connection
//! table read and this scan; the correlation is best-effort by nature and
//! not transactional from user space.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::AttributionError;

/// Sentinel for metadata that could not be read.
pub const UNKNOWN_METADATA: &str = "unknown";

/// Default upper bound on one full process-table scan.
pub const DEFAULT_SCAN_DEADLINE: Duration = Duration::from_secs(5);

/// Best-effort command line and short name of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMeta {
    pub cmdline: String,
    pub comm: String,
}

/// Scanner over `<root>/<pid>/fd` descriptor tables.
#[derive(Debug, Clone)]
pub struct ProcScanner {
    root: PathBuf,
    deadline: Duration,
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcScanner {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            deadline: DEFAULT_SCAN_DEADLINE,
        }
    }

    /// Bound the scan; a busy host can hold tens of thousands of descriptors.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Return the pid whose descriptor table references `inode`.
    ///
    /// First match wins; a socket has exactly one owning descriptor table in
    /// practice. Directories that cannot be read (cross-user or
    /// cross-namespace boundaries) are skipped, so an owner outside this
    /// permission domain degrades to a lookup miss rather than an error.
    pub fn find_pid(&self, inode: &str) -> Result<i32, AttributionError> {
        let needle = format!("socket:[{inode}]");
        let started = Instant::now();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, root = %self.root.display(), "process table unreadable");
                return Err(AttributionError::ProcessNotFound(inode.to_string()));
            }
        };

        for entry in entries.flatten() {
            if started.elapsed() >= self.deadline {
                debug!(inode, "process scan deadline exhausted before a match");
                break;
            }
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|name| name.parse::<i32>().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(target) = fs::read_link(fd.path()) else {
                    continue;
                };
                if target.as_os_str() == needle.as_str() {
                    return Ok(pid);
                }
            }
        }
        Err(AttributionError::ProcessNotFound(inode.to_string()))
    }

    /// Read the process's command line and short name.
    ///
    /// Metadata is advisory: anything missing or unreadable becomes the
    /// `"unknown"` sentinel instead of an error.
    pub fn read_metadata(&self, pid: i32) -> ProcessMeta {
        let base = self.root.join(pid.to_string());
        ProcessMeta {
            cmdline: read_cmdline(&base.join("cmdline")),
            comm: read_comm(&base.join("comm")),
        }
    }
}

/// Join the NUL-separated argument vector with single spaces.
fn read_cmdline(path: &Path) -> String {
    let Ok(raw) = fs::read(path) else {
        return UNKNOWN_METADATA.to_string();
    };
    let joined = raw
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        // Kernel threads expose an empty cmdline.
        UNKNOWN_METADATA.to_string()
    } else {
        joined
    }
}

fn read_comm(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let trimmed = raw.trim_end().to_string();
            if trimmed.is_empty() {
                UNKNOWN_METADATA.to_string()
            } else {
                trimmed
            }
        }
        Err(_) => UNKNOWN_METADATA.to_string(),
    }
}
