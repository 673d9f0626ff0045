//! Kernel TCP connection table reader.
//!
//! Each row of `net/tcp` encodes the local endpoint as `ADDR:PORT` with both
//! halves in hex; the socket inode sits in the tenth column. The reader is
//! rooted at an injectable path so tests run against synthetic tables.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::AttributionError;

/// One matched connection-table row. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRecord {
    pub local_port: u16,
    pub inode: String,
}

/// Reader over `<root>/net/tcp` and `<root>/net/tcp6`.
#[derive(Debug, Clone)]
pub struct SocketTable {
    root: PathBuf,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Find the socket inode owning `port`.
    ///
    /// The v4 table is scanned before the v6 table, and within each table the
    /// first matching row wins. Multiple live rows can claim one local port
    /// during TIME_WAIT races; taking the first in table order is a known
    /// best-effort limitation that has not been validated against
    /// TIME_WAIT/dual-stack edge cases.
    pub fn find_inode(&self, port: u16) -> Result<SocketRecord, AttributionError> {
        for (name, optional) in [("net/tcp", false), ("net/tcp6", true)] {
            let path = self.root.join(name);
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                // A machine without an IPv6 stack has no tcp6 table.
                Err(err) if optional && err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(AttributionError::TableIo {
                        path: path.display().to_string(),
                        source: err,
                    });
                }
            };
            if let Some(record) = scan_table(&contents, port) {
                return Ok(record);
            }
        }
        Err(AttributionError::SocketNotFound(port))
    }
}

fn scan_table(contents: &str, port: u16) -> Option<SocketRecord> {
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Some(hex_port) = fields[1].rsplit(':').next() else {
            continue;
        };
        let Ok(local_port) = u16::from_str_radix(hex_port, 16) else {
            continue;
        };
        if local_port == port {
            return Some(SocketRecord {
                local_port,
                inode: fields[9].to_string(),
            });
        }
    }
    None
}
