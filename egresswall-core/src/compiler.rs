//! Compile a [`TrustPolicy`] into an ordered rule set.
//!
//! Compilation is pure: no name resolution, no kernel access. The emitted
//! order is load-bearing under first-match semantics and is layered, per
//! family, as: localhost bypass, trusted-resolver bypass, embedded-resolver
//! bypass, proxy-self bypass, host-gateway bypass, dangerous-port block,
//! HTTP/HTTPS redirect, user-port redirect, default deny.

use crate::policy::TrustPolicy;
use crate::rules::{
    Action, Chain, DANGEROUS_PORTS, DNS_PORT, EMBEDDED_RESOLVER, Family, HTTP_PORT, HTTPS_PORT,
    PortMatch, Proto, Rule,
};

use std::net::IpAddr;

/// Ordered rule set for both address families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRuleset {
    rules: Vec<Rule>,
}

impl CompiledRuleset {
    /// All rules, IPv4 first, in application order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules for one family, preserving order.
    pub fn family(&self, family: Family) -> impl Iterator<Item = &Rule> + '_ {
        self.rules.iter().filter(move |rule| rule.family == family)
    }

    /// Rules for one chain and family, preserving order.
    pub fn chain(&self, chain: Chain, family: Family) -> Vec<&Rule> {
        self.family(family)
            .filter(|rule| rule.chain == chain)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Compile the policy into rules for both families.
///
/// Both families are always emitted; whether the IPv6 half can be installed
/// is the applier's runtime decision. Redirect rules are restricted to the
/// proxy's own address family — a v4-only proxy cannot terminate v6 flows,
/// so the other family keeps its bypass and block layers and falls through
/// to the default deny.
pub fn compile(policy: &TrustPolicy) -> CompiledRuleset {
    let mut rules = Vec::new();
    for family in [Family::V4, Family::V6] {
        compile_family(policy, family, &mut rules);
    }
    CompiledRuleset { rules }
}

fn compile_family(policy: &TrustPolicy, family: Family, out: &mut Vec<Rule>) {
    let proxy_family = Family::of(&policy.proxy.ip());

    // NAT chain: decide which flows are rewritten toward the proxy and which
    // are left alone. RETURN here means "no rewrite" — the filter chain still
    // has the final word.
    out.push(Rule::new(Chain::Nat, family, Action::Return).out_iface("lo"));
    for resolver in resolvers_for(policy, family) {
        out.extend(dns_bypass(Chain::Nat, family, resolver, Action::Return));
    }
    if family == Family::V4 {
        out.extend(dns_bypass(Chain::Nat, family, EMBEDDED_RESOLVER, Action::Return));
    }
    if proxy_family == family {
        // Without this, the redirect below would loop traffic already headed
        // for the proxy back into itself.
        out.push(
            Rule::new(Chain::Nat, family, Action::Return)
                .dest(policy.proxy.ip())
                .proto(Proto::Tcp)
                .dport(PortMatch::Single(policy.proxy.port())),
        );
    }
    for gateway in gateways_for(policy, family) {
        out.push(Rule::new(Chain::Nat, family, Action::Return).dest(gateway));
    }
    for port in DANGEROUS_PORTS {
        out.push(
            Rule::new(Chain::Nat, family, Action::Return)
                .proto(Proto::Tcp)
                .dport(PortMatch::Single(*port)),
        );
    }
    if proxy_family == family {
        for port in [HTTP_PORT, HTTPS_PORT] {
            out.push(redirect(family, PortMatch::Single(port), policy));
        }
        for port in &policy.allowed_ports {
            out.push(redirect(family, *port, policy));
        }
    }

    // Filter chain: everything the NAT chain did not rewrite must be an
    // explicitly trusted destination, or it is dropped.
    out.push(Rule::new(Chain::Output, family, Action::Accept).out_iface("lo"));
    for resolver in resolvers_for(policy, family) {
        out.extend(dns_bypass(Chain::Output, family, resolver, Action::Accept));
    }
    if family == Family::V4 {
        out.extend(dns_bypass(Chain::Output, family, EMBEDDED_RESOLVER, Action::Accept));
    }
    if proxy_family == family {
        out.push(
            Rule::new(Chain::Output, family, Action::Accept)
                .dest(policy.proxy.ip())
                .proto(Proto::Tcp)
                .dport(PortMatch::Single(policy.proxy.port())),
        );
    }
    for gateway in gateways_for(policy, family) {
        out.push(Rule::new(Chain::Output, family, Action::Accept).dest(gateway));
    }
    out.push(Rule::new(Chain::Output, family, Action::Drop).proto(Proto::Tcp));
}

fn resolvers_for(policy: &TrustPolicy, family: Family) -> impl Iterator<Item = IpAddr> + '_ {
    policy
        .trusted_resolvers
        .iter()
        .copied()
        .filter(move |addr| family.matches(addr))
}

fn gateways_for(policy: &TrustPolicy, family: Family) -> impl Iterator<Item = IpAddr> + '_ {
    policy
        .host_bypass
        .iter()
        .copied()
        .filter(move |addr| family.matches(addr))
}

fn dns_bypass(chain: Chain, family: Family, dest: IpAddr, action: Action) -> [Rule; 2] {
    [Proto::Udp, Proto::Tcp].map(|proto| {
        Rule::new(chain, family, action)
            .dest(dest)
            .proto(proto)
            .dport(PortMatch::Single(DNS_PORT))
    })
}

fn redirect(family: Family, port: PortMatch, policy: &TrustPolicy) -> Rule {
    Rule::new(Chain::Nat, family, Action::Redirect(policy.proxy))
        .proto(Proto::Tcp)
        .dport(port)
}
