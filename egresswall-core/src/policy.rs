//! Trust policy model and environment loading.
//!
//! A [`TrustPolicy`] is the declarative input to the rule compiler: which
//! resolvers may be spoken to directly, where the filtering proxy lives, and
//! which extra ports are tunneled through it. Every address in a constructed
//! policy is already resolved — name resolution happens here, while the host
//! network is still reachable, never inside the compiler.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use tracing::{debug, warn};

use crate::error::PolicyError;
use crate::rules::{DANGEROUS_PORTS, PortMatch};

/// Default trusted resolvers, used when none are configured.
pub const DEFAULT_TRUSTED_RESOLVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
];

/// Default proxy endpoint, matching a co-located Squid instance.
pub const DEFAULT_PROXY_HOST: &str = "localhost";
pub const DEFAULT_PROXY_PORT: u16 = 3128;

/// Hostname the container runtime maps to the host gateway.
pub const DEFAULT_HOST_GATEWAY: &str = "host.docker.internal";

/// Environment variables consumed by [`TrustPolicy::from_env`].
pub const ENV_TRUSTED_RESOLVERS: &str = "EGRESS_TRUSTED_RESOLVERS";
pub const ENV_PROXY_HOST: &str = "EGRESS_PROXY_HOST";
pub const ENV_PROXY_PORT: &str = "EGRESS_PROXY_PORT";
pub const ENV_ALLOWED_PORTS: &str = "EGRESS_ALLOWED_PORTS";
pub const ENV_ALLOW_HOST: &str = "EGRESS_ALLOW_HOST";
pub const ENV_HOST_GATEWAY: &str = "EGRESS_HOST_GATEWAY";

/// Declarative egress trust policy. Immutable once compiled.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    /// Resolvers the workload may query directly, in configuration order.
    pub trusted_resolvers: Vec<IpAddr>,
    /// The filtering proxy all allowed TCP traffic is redirected through.
    pub proxy: SocketAddr,
    /// Extra destination ports (or ranges) tunneled through the proxy.
    pub allowed_ports: Vec<PortMatch>,
    /// Host gateway addresses exempted from redirection, when host access is
    /// enabled and the gateway name resolved.
    pub host_bypass: Vec<IpAddr>,
}

impl TrustPolicy {
    /// Policy with default resolvers, no extra ports, and no host bypass.
    pub fn new(proxy: SocketAddr) -> Self {
        Self {
            trusted_resolvers: DEFAULT_TRUSTED_RESOLVERS.to_vec(),
            proxy,
            allowed_ports: Vec::new(),
            host_bypass: Vec::new(),
        }
    }

    /// Replace the trusted resolver set, deduplicating in order.
    pub fn with_resolvers(mut self, resolvers: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_resolvers = dedup_ordered(resolvers);
        self
    }

    /// Tunnel an additional port or range through the proxy.
    pub fn allow_port(mut self, port: PortMatch) -> Self {
        self.allowed_ports.push(port);
        self
    }

    /// Exempt the given host gateway addresses from redirection.
    pub fn with_host_bypass(mut self, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.host_bypass = dedup_ordered(addrs);
        self
    }

    /// The fixed blocklist of ports that must never leave the container.
    pub fn blocked_ports(&self) -> &'static [u16] {
        DANGEROUS_PORTS
    }

    /// Build the policy from the process environment.
    ///
    /// An unresolvable proxy or malformed resolver/port entry is fatal. A
    /// host gateway that fails to resolve only disables the bypass, with a
    /// warning: the sandbox is still safe without it, just more restrictive.
    pub fn from_env() -> Result<Self, PolicyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self, PolicyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let trusted_resolvers = match get(ENV_TRUSTED_RESOLVERS) {
            Some(raw) => parse_resolvers(&raw)?,
            None => DEFAULT_TRUSTED_RESOLVERS.to_vec(),
        };

        let proxy_host = get(ENV_PROXY_HOST).unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string());
        let proxy_port = match get(ENV_PROXY_PORT) {
            Some(raw) => {
                let parsed = raw.trim().parse::<u16>().ok().filter(|port| *port != 0);
                parsed.ok_or(PolicyError::InvalidProxyPort(raw))?
            }
            None => DEFAULT_PROXY_PORT,
        };
        let proxy = resolve_proxy(&proxy_host, proxy_port)?;

        let allowed_ports = match get(ENV_ALLOWED_PORTS) {
            Some(raw) => parse_ports(&raw)?,
            None => Vec::new(),
        };

        let host_bypass = if get(ENV_ALLOW_HOST).as_deref().map(is_truthy).unwrap_or(false) {
            let gateway = get(ENV_HOST_GATEWAY).unwrap_or_else(|| DEFAULT_HOST_GATEWAY.to_string());
            resolve_gateway(&gateway)
        } else {
            Vec::new()
        };

        debug!(
            resolvers = trusted_resolvers.len(),
            proxy = %proxy,
            allowed_ports = allowed_ports.len(),
            host_bypass = host_bypass.len(),
            "trust policy loaded"
        );

        Ok(Self {
            trusted_resolvers,
            proxy,
            allowed_ports,
            host_bypass,
        })
    }
}

/// Resolve the proxy endpoint, preferring an IPv4 address when the host name
/// yields both families.
fn resolve_proxy(host: &str, port: u16) -> Result<SocketAddr, PolicyError> {
    let unresolved = || PolicyError::ProxyUnresolved {
        host: host.to_string(),
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(unresolved)
}

/// Resolve the host gateway name to its addresses. Failure is recoverable:
/// the bypass is omitted and the caller keeps the stricter policy.
fn resolve_gateway(name: &str) -> Vec<IpAddr> {
    let addrs = match (name, 0u16).to_socket_addrs() {
        Ok(addrs) => dedup_ordered(addrs.map(|addr| addr.ip())),
        Err(err) => {
            warn!(gateway = name, error = %err, "host gateway did not resolve; bypass omitted");
            return Vec::new();
        }
    };
    if addrs.is_empty() {
        warn!(gateway = name, "host gateway resolved to no addresses; bypass omitted");
    }
    addrs
}

fn parse_resolvers(raw: &str) -> Result<Vec<IpAddr>, PolicyError> {
    let mut resolvers = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let addr: IpAddr = entry
            .parse()
            .map_err(|_| PolicyError::InvalidResolver(entry.to_string()))?;
        if !resolvers.contains(&addr) {
            resolvers.push(addr);
        }
    }
    Ok(resolvers)
}

fn parse_ports(raw: &str) -> Result<Vec<PortMatch>, PolicyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn dedup_ordered(addrs: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for addr in addrs {
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|value| value.to_string())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let policy = TrustPolicy::from_lookup(lookup(&[(ENV_PROXY_HOST, "127.0.0.1")])).unwrap();
        assert_eq!(policy.trusted_resolvers, DEFAULT_TRUSTED_RESOLVERS.to_vec());
        assert_eq!(policy.proxy, "127.0.0.1:3128".parse().unwrap());
        assert!(policy.allowed_ports.is_empty());
        assert!(policy.host_bypass.is_empty());
    }

    #[test]
    fn resolvers_are_parsed_in_order_and_deduplicated() {
        let policy = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_TRUSTED_RESOLVERS, "1.1.1.1, 8.8.8.8 ,1.1.1.1,2606:4700:4700::1111"),
        ]))
        .unwrap();
        assert_eq!(
            policy.trusted_resolvers,
            vec![
                "1.1.1.1".parse::<IpAddr>().unwrap(),
                "8.8.8.8".parse().unwrap(),
                "2606:4700:4700::1111".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn malformed_resolver_is_fatal() {
        let err = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_TRUSTED_RESOLVERS, "8.8.8.8,dns.example"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidResolver(entry) if entry == "dns.example"));
    }

    #[test]
    fn allowed_ports_accept_singles_and_ranges() {
        let policy = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_ALLOWED_PORTS, "8080, 9000-9010"),
        ]))
        .unwrap();
        assert_eq!(
            policy.allowed_ports,
            vec![PortMatch::Single(8080), PortMatch::Range(9000, 9010)]
        );
    }

    #[test]
    fn malformed_port_spec_is_fatal() {
        let err = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_ALLOWED_PORTS, "8080,https"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPortSpec(_)));
    }

    #[test]
    fn unresolvable_proxy_is_fatal() {
        let err =
            TrustPolicy::from_lookup(lookup(&[(ENV_PROXY_HOST, "proxy.invalid")])).unwrap_err();
        assert!(matches!(err, PolicyError::ProxyUnresolved { host } if host == "proxy.invalid"));
    }

    #[test]
    fn invalid_proxy_port_is_fatal() {
        let err = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_PROXY_PORT, "squid"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidProxyPort(_)));
    }

    #[test]
    fn host_bypass_resolves_when_enabled() {
        // A literal address stands in for the runtime-provided gateway name
        // so resolution works without external DNS.
        let policy = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_ALLOW_HOST, "true"),
            (ENV_HOST_GATEWAY, "192.168.65.2"),
        ]))
        .unwrap();
        assert_eq!(policy.host_bypass, vec!["192.168.65.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn unresolvable_host_gateway_is_recoverable() {
        let policy = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_ALLOW_HOST, "1"),
            (ENV_HOST_GATEWAY, "gateway.invalid"),
        ]))
        .unwrap();
        assert!(policy.host_bypass.is_empty());
    }

    #[test]
    fn host_bypass_requires_truthy_flag() {
        let policy = TrustPolicy::from_lookup(lookup(&[
            (ENV_PROXY_HOST, "127.0.0.1"),
            (ENV_ALLOW_HOST, "definitely"),
            (ENV_HOST_GATEWAY, "192.168.65.2"),
        ]))
        .unwrap();
        assert!(policy.host_bypass.is_empty());
    }

    #[test]
    fn builder_constructors_compose() {
        let proxy = "10.0.0.5:3128".parse().unwrap();
        let policy = TrustPolicy::new(proxy)
            .with_resolvers(["8.8.8.8".parse().unwrap()])
            .allow_port(PortMatch::Single(8080));
        assert_eq!(policy.proxy, proxy);
        assert_eq!(policy.trusted_resolvers.len(), 1);
        assert_eq!(policy.allowed_ports, vec![PortMatch::Single(8080)]);
        assert!(policy.blocked_ports().contains(&22));
    }
}
