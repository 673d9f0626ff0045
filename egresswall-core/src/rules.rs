//! Typed packet-filter rule model.
//!
//! Rules are explicit ordered values rather than imperative commands: the
//! compiler emits a list, tests inspect it, and the applier translates each
//! rule into an iptables argument vector. First match wins, so ordering is
//! part of the contract, not an implementation detail.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::PolicyError;

/// Well-known destination ports used by the compiler.
pub const DNS_PORT: u16 = 53;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

/// The container runtime's embedded name resolver (Docker's internal DNS).
/// Only ever reachable over IPv4 inside the container network.
pub const EMBEDDED_RESOLVER: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 11));

/// Ports that must never leave the container, redirected or otherwise.
/// These are common lateral-movement and exfiltration channels; traffic to
/// them falls through the NAT chain untouched and hits the default deny.
pub const DANGEROUS_PORTS: &[u16] = &[
    22,    // ssh
    23,    // telnet
    25,    // smtp
    445,   // smb
    1433,  // mssql
    3306,  // mysql
    3389,  // rdp
    5432,  // postgres
    5900,  // vnc
    6379,  // redis
    9200,  // elasticsearch
    11211, // memcached
    27017, // mongodb
];

/// Name of the managed chain hooked from `OUTPUT` in the nat table.
pub const NAT_CHAIN: &str = "EGRESSWALL_NAT";

/// Name of the managed chain hooked from `OUTPUT` in the filter table.
pub const FILTER_CHAIN: &str = "EGRESSWALL_OUT";

/// Rule chain: redirection decisions happen in the nat table, the final
/// accept/drop verdict in the filter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Nat,
    Output,
}

impl Chain {
    pub fn table(self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Output => "filter",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nat => NAT_CHAIN,
            Self::Output => FILTER_CHAIN,
        }
    }
}

/// Address family a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn matches(self, addr: &IpAddr) -> bool {
        Self::of(addr) == self
    }

    /// The userland tool that manages this family's tables.
    pub fn binary(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// A single destination port or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortMatch {
    Single(u16),
    Range(u16, u16),
}

impl PortMatch {
    pub fn contains(self, port: u16) -> bool {
        match self {
            Self::Single(p) => p == port,
            Self::Range(lo, hi) => (lo..=hi).contains(&port),
        }
    }
}

impl fmt::Display for PortMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(p) => write!(f, "{p}"),
            Self::Range(lo, hi) => write!(f, "{lo}:{hi}"),
        }
    }
}

impl FromStr for PortMatch {
    type Err = PolicyError;

    /// Parses `"8080"` or `"8080-8090"`. Port 0 is never valid.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim();
        let invalid = || PolicyError::InvalidPortSpec(spec.to_string());
        if let Some((lo, hi)) = spec.split_once('-') {
            let lo: u16 = lo.trim().parse().map_err(|_| invalid())?;
            let hi: u16 = hi.trim().parse().map_err(|_| invalid())?;
            if lo == 0 || hi == 0 {
                return Err(invalid());
            }
            if lo > hi {
                return Err(PolicyError::InvertedPortRange { lo, hi });
            }
            if lo == hi {
                Ok(Self::Single(lo))
            } else {
                Ok(Self::Range(lo, hi))
            }
        } else {
            let port: u16 = spec.parse().map_err(|_| invalid())?;
            if port == 0 {
                return Err(invalid());
            }
            Ok(Self::Single(port))
        }
    }
}

/// Terminal action of a rule.
///
/// `Return` in the nat chain means "do not rewrite this flow"; whether it is
/// ultimately accepted or dropped is the filter chain's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Return,
    Accept,
    Drop,
    /// DNAT the flow to the given proxy endpoint.
    Redirect(SocketAddr),
}

/// One ordered packet-filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: Chain,
    pub family: Family,
    pub proto: Option<Proto>,
    pub dest: Option<IpAddr>,
    pub dport: Option<PortMatch>,
    pub out_iface: Option<&'static str>,
    pub action: Action,
}

impl Rule {
    pub fn new(chain: Chain, family: Family, action: Action) -> Self {
        Self {
            chain,
            family,
            proto: None,
            dest: None,
            dport: None,
            out_iface: None,
            action,
        }
    }

    pub fn proto(mut self, proto: Proto) -> Self {
        self.proto = Some(proto);
        self
    }

    pub fn dest(mut self, dest: IpAddr) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn dport(mut self, dport: PortMatch) -> Self {
        self.dport = Some(dport);
        self
    }

    pub fn out_iface(mut self, iface: &'static str) -> Self {
        self.out_iface = Some(iface);
        self
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.action, Action::Redirect(_))
    }

    /// Translate into an append invocation for the family's iptables binary.
    /// Matcher order follows iptables convention; `-p` must precede `--dport`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-t".into(),
            self.chain.table().into(),
            "-A".into(),
            self.chain.name().into(),
        ];
        if let Some(iface) = self.out_iface {
            args.push("-o".into());
            args.push(iface.into());
        }
        if let Some(dest) = self.dest {
            args.push("-d".into());
            args.push(dest.to_string());
        }
        if let Some(proto) = self.proto {
            args.push("-p".into());
            args.push(proto.as_str().into());
        }
        if let Some(dport) = self.dport {
            args.push("--dport".into());
            args.push(dport.to_string());
        }
        args.push("-j".into());
        match self.action {
            Action::Return => args.push("RETURN".into()),
            Action::Accept => args.push("ACCEPT".into()),
            Action::Drop => args.push("DROP".into()),
            Action::Redirect(target) => {
                args.push("DNAT".into());
                args.push("--to-destination".into());
                args.push(target.to_string());
            }
        }
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family.binary(), self.to_args().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    #[test]
    fn port_match_parses_singles_and_ranges() {
        assert_eq!("8080".parse::<PortMatch>().unwrap(), PortMatch::Single(8080));
        assert_eq!(
            "8080-8090".parse::<PortMatch>().unwrap(),
            PortMatch::Range(8080, 8090)
        );
        // A degenerate range collapses to a single port.
        assert_eq!("443-443".parse::<PortMatch>().unwrap(), PortMatch::Single(443));
    }

    #[test]
    fn port_match_rejects_bad_specs() {
        assert!("0".parse::<PortMatch>().is_err());
        assert!("".parse::<PortMatch>().is_err());
        assert!("http".parse::<PortMatch>().is_err());
        assert!("70000".parse::<PortMatch>().is_err());
        assert!("0-80".parse::<PortMatch>().is_err());
        assert!(matches!(
            "9000-8000".parse::<PortMatch>(),
            Err(PolicyError::InvertedPortRange { lo: 9000, hi: 8000 })
        ));
    }

    #[test]
    fn port_match_contains() {
        assert!(PortMatch::Single(80).contains(80));
        assert!(!PortMatch::Single(80).contains(81));
        assert!(PortMatch::Range(8080, 8090).contains(8085));
        assert!(!PortMatch::Range(8080, 8090).contains(8091));
    }

    #[test]
    fn redirect_rule_renders_dnat_args() {
        let proxy: SocketAddr = "10.0.0.5:3128".parse().unwrap();
        let rule = Rule::new(Chain::Nat, Family::V4, Action::Redirect(proxy))
            .proto(Proto::Tcp)
            .dport(PortMatch::Single(443));
        assert_eq!(
            rule.to_args(),
            vec![
                "-t", "nat", "-A", NAT_CHAIN, "-p", "tcp", "--dport", "443", "-j", "DNAT",
                "--to-destination", "10.0.0.5:3128",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn v6_redirect_target_is_bracketed() {
        let proxy = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 3128);
        let rule = Rule::new(Chain::Nat, Family::V6, Action::Redirect(proxy))
            .proto(Proto::Tcp)
            .dport(PortMatch::Single(80));
        let args = rule.to_args();
        assert_eq!(args.last().unwrap(), "[2001:db8::1]:3128");
        assert!(rule.to_string().starts_with("ip6tables "));
    }

    #[test]
    fn loopback_bypass_renders_interface_matcher() {
        let rule = Rule::new(Chain::Output, Family::V4, Action::Accept).out_iface("lo");
        assert_eq!(
            rule.to_args(),
            vec!["-t", "filter", "-A", FILTER_CHAIN, "-o", "lo", "-j", "ACCEPT"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn range_matcher_uses_colon_syntax() {
        let rule = Rule::new(Chain::Nat, Family::V4, Action::Return)
            .proto(Proto::Tcp)
            .dport(PortMatch::Range(8080, 8090));
        assert!(rule.to_args().contains(&"8080:8090".to_string()));
    }
}
