//! Egress policy enforcement and connection attribution for sandboxed agent
//! containers.
//!
//! Two subsystems share this crate. The firewall half turns a declarative
//! [`TrustPolicy`] into an ordered, typed rule set (`compiler`) and installs
//! it idempotently through an injectable backend (`applier`/`backend`): all
//! outbound traffic is dropped, sent to a trusted resolver, or redirected
//! into a filtering proxy, with independent NAT and filter layers so no
//! single failure grants open egress. The attribution half maps an observed
//! local source port back to its owning process (`socket`/`procscan`) and
//! reports the result as a structured record (`attribution`). Both are
//! one-shot and stateless; all state lives in the kernel.

pub mod applier;
pub mod attribution;
pub mod backend;
pub mod compiler;
pub mod error;
pub mod policy;
pub mod procscan;
pub mod rules;
pub mod socket;

pub use applier::RuleApplier;
pub use attribution::{Attributor, ProcessAttribution, parse_port};
pub use backend::{CmdOutput, IptablesBackend, MemoryBackend, RuleBackend};
pub use compiler::{CompiledRuleset, compile};
pub use error::{AttributionError, PolicyError};
pub use policy::TrustPolicy;
pub use procscan::{ProcScanner, ProcessMeta};
pub use rules::{Action, Chain, Family, PortMatch, Proto, Rule};
pub use socket::{SocketRecord, SocketTable};
