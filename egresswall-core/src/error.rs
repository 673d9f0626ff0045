//! Typed errors for policy construction and connection attribution.

/// Errors raised while building a [`TrustPolicy`](crate::policy::TrustPolicy)
/// from its inputs. All variants are fatal: the sandboxed workload must not
/// start behind a policy that could not be fully resolved.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("proxy host '{host}' did not resolve to an address")]
    ProxyUnresolved { host: String },

    #[error("invalid proxy port '{0}': expected a decimal port in 1-65535")]
    InvalidProxyPort(String),

    #[error("invalid trusted resolver address '{0}'")]
    InvalidResolver(String),

    #[error("invalid allowed port specification '{0}'")]
    InvalidPortSpec(String),

    #[error("inverted port range {lo}-{hi}: lower bound exceeds upper bound")]
    InvertedPortRange { lo: u16, hi: u16 },
}

/// Errors raised by the attribution pipeline.
///
/// `TableIo` is deliberately distinct from `SocketNotFound`: callers must be
/// able to tell "the connection table could not be read" apart from "nothing
/// owns that port".
#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("invalid port '{0}': expected a decimal port in 1-65535")]
    InvalidPort(String),

    #[error("no tcp socket found with local port {0}")]
    SocketNotFound(u16),

    #[error("no process found holding socket inode {0}")]
    ProcessNotFound(String),

    #[error("failed to read connection table {path}: {source}")]
    TableIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AttributionError {
    /// True for malformed query input, as opposed to a lookup that ran and
    /// found nothing.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidPort(_))
    }

    /// Process exit status for a failed query: 2 for validation failures,
    /// 1 for lookup failures.
    pub fn exit_code(&self) -> i32 {
        if self.is_validation() { 2 } else { 1 }
    }
}
