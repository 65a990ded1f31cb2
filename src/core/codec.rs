//! Decoding of `nft -j -a list chain` output into domain objects
//!
//! The listing is parsed once into [`NftRule`]s (typed expressions, see
//! [`crate::core::expr`]); each decoder then walks those rules and extracts the
//! facts it needs: ports, protocol, quota counters, NAT targets and markers.

use crate::core::error::{Error, Result};
use crate::core::expr::{Expr, Match, Nat, Operand, Quota};
use crate::core::marker;
use crate::core::model::{AllowedPort, ChainRef, ForwardingRule, Protocol, QuotaRule, forward_id};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

/// One rule as reported by nft, with its handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NftRule {
    pub family: String,
    pub table: String,
    pub chain: String,
    #[serde(default)]
    pub handle: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default)]
    pub expr: Vec<Expr>,
}

impl NftRule {
    pub fn chain_ref(&self) -> ChainRef {
        ChainRef::new(&self.family, &self.table, &self.chain)
    }

    pub fn is_in(&self, chain: &ChainRef) -> bool {
        self.family == chain.family && self.table == chain.table && self.chain == chain.chain
    }

    fn matches(&self) -> impl Iterator<Item = &Match> {
        self.expr.iter().filter_map(|e| match e {
            Expr::Match(m) => Some(m),
            _ => None,
        })
    }

    pub fn quota(&self) -> Option<&Quota> {
        self.expr.iter().find_map(|e| match e {
            Expr::Quota(q) => Some(q),
            _ => None,
        })
    }

    pub fn dnat(&self) -> Option<&Nat> {
        self.expr.iter().find_map(|e| match e {
            Expr::Dnat(n) => Some(n),
            _ => None,
        })
    }

    pub fn accepts(&self) -> bool {
        self.expr.iter().any(|e| matches!(e, Expr::Accept))
    }

    /// Ports of the last transport-port predicate on one of `fields`.
    fn ports(&self, fields: &[&str]) -> Vec<u16> {
        self.matches()
            .filter_map(|m| port_values(m, fields))
            .filter(|ports| !ports.is_empty())
            .last()
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct Listing {
    nftables: Vec<ListingEntry>,
}

#[derive(Deserialize)]
struct ListingEntry {
    #[serde(default)]
    rule: Option<NftRule>,
}

/// Parses raw nft JSON into the rules of `chain`, in listing order.
///
/// Metainfo, table and chain objects are skipped.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the text is not an nft JSON listing.
pub fn parse_listing(raw: &str, chain: &ChainRef) -> Result<Vec<NftRule>> {
    let listing: Listing = serde_json::from_str(raw)
        .map_err(|e| Error::Decode(format!("listing of {chain}: {e}")))?;
    Ok(listing
        .nftables
        .into_iter()
        .filter_map(|entry| entry.rule)
        .filter(|rule| rule.is_in(chain))
        .collect())
}

/// Values of a `<proto> <field> == N | {set} | [list]` match, or `None` if the
/// match is not a transport-port predicate on one of `fields`.
fn port_values(m: &Match, fields: &[&str]) -> Option<Vec<u16>> {
    let Operand::Payload { field, .. } = &m.left else {
        return None;
    };
    if !fields.contains(&field.as_str()) {
        return None;
    }
    Some(
        m.right
            .numbers()
            .into_iter()
            .filter_map(|n| u16::try_from(n).ok())
            .collect(),
    )
}

/// Protocol constraint of a rule.
///
/// An explicit `meta l4proto` match wins; a `tcp`/`udp` payload predicate is the
/// fallback; no constraint at all means both.
pub fn protocol_of(rule: &NftRule) -> Protocol {
    for m in rule.matches() {
        if matches!(&m.left, Operand::Meta { key } if key == "l4proto") {
            let names = m.right.texts();
            let tcp = names.contains(&"tcp");
            let udp = names.contains(&"udp");
            match (tcp, udp) {
                (true, false) => return Protocol::Tcp,
                (false, true) => return Protocol::Udp,
                (true, true) => return Protocol::Both,
                (false, false) => {}
            }
        }
    }

    rule.matches()
        .filter_map(|m| match &m.left {
            Operand::Payload { protocol, .. } => protocol.parse::<Protocol>().ok(),
            _ => None,
        })
        .find(|p| *p != Protocol::Both)
        .unwrap_or_default()
}

/// Decodes every quota-carrying rule into one [`QuotaRule`] per matched port.
///
/// A quota rule without a recognizable port predicate yields a single entry on
/// port 0.
pub fn decode_quotas(rules: &[NftRule]) -> Vec<QuotaRule> {
    let mut out = Vec::new();
    for rule in rules {
        let Some(quota) = rule.quota() else {
            continue;
        };
        let chain = rule.chain_ref();
        let protocol = protocol_of(rule);
        let mut ports = rule.ports(&["sport", "dport"]);
        if ports.is_empty() {
            ports.push(0);
        }
        for port in ports {
            out.push(QuotaRule::new(
                &chain,
                rule.handle,
                port,
                protocol,
                quota.limit_bytes(),
                quota.used_bytes(),
                rule.comment.clone(),
            ));
        }
    }
    out
}

/// Decodes accept rules on destination ports, deduplicated by port across rules.
pub fn decode_allowed_ports(rules: &[NftRule]) -> Vec<AllowedPort> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for rule in rules.iter().filter(|r| r.accepts()) {
        let ports = rule
            .matches()
            .filter_map(|m| port_values(m, &["dport"]))
            .flatten();
        for port in ports {
            if seen.insert(port) {
                out.push(AllowedPort {
                    port,
                    handle: rule.handle,
                    managed: marker::is_managed(&rule.comment),
                    comment: rule.comment.clone(),
                });
            }
        }
    }
    out
}

/// Reconstructs live forwards from the prerouting and postrouting listings.
///
/// Every prerouting DNAT rule with a source port and a complete target is a
/// forward. Managed ones are paired with their masquerade rule through the source
/// port encoded in the marker.
pub fn decode_forwards(prerouting: &[NftRule], postrouting: &[NftRule]) -> Vec<ForwardingRule> {
    let post_handles: HashMap<u16, u64> = postrouting
        .iter()
        .filter(|r| r.expr.iter().any(|e| matches!(e, Expr::Masquerade)))
        .filter_map(|r| marker::parse_forward(&r.comment).map(|tag| (tag.src_port, r.handle)))
        .collect();

    prerouting
        .iter()
        .filter_map(|rule| {
            let forward = decode_forward(rule)?;
            Some(ForwardingRule {
                post_handle: if forward.managed {
                    post_handles.get(&forward.src_port).copied()
                } else {
                    None
                },
                ..forward
            })
        })
        .collect()
}

fn decode_forward(rule: &NftRule) -> Option<ForwardingRule> {
    let nat = rule.dnat()?;
    let dst_ip = nat.addr.as_deref()?.parse::<Ipv4Addr>().ok()?;
    let dst_port = nat.port.filter(|p| *p != 0)?;
    let src_port = rule
        .ports(&["dport"])
        .first()
        .copied()
        .filter(|p| *p != 0)?;

    let (managed, comment, limit_mbps) = match marker::parse_forward(&rule.comment) {
        Some(tag) => (true, tag.comment, tag.limit_mbps),
        None => (false, rule.comment.clone(), 0),
    };

    Some(ForwardingRule {
        id: forward_id(src_port),
        src_port,
        dst_ip,
        dst_port,
        protocol: protocol_of(rule),
        enabled: true,
        managed,
        comment,
        limit_mbps,
        pre_handle: Some(rule.handle),
        post_handle: None,
    })
}

/// Bytes counted by shadow quota rules, keyed by the forward's source port.
pub fn shadow_usage(rules: &[NftRule]) -> HashMap<u16, u64> {
    let mut usage = HashMap::new();
    for rule in rules {
        if let Some(port) = marker::parse_forward_quota(&rule.comment)
            && let Some(quota) = rule.quota()
        {
            *usage.entry(port).or_insert(0) += quota.used_bytes();
        }
    }
    usage
}

/// Rules in `rules` whose comment tags the forward on `src_port`.
pub fn forward_rules_for(rules: &[NftRule], src_port: u16) -> Vec<NftRule> {
    rules
        .iter()
        .filter(|r| marker::is_forward_for(&r.comment, src_port))
        .cloned()
        .collect()
}

/// Shadow quota rules for `src_port`.
pub fn shadow_rules_for(rules: &[NftRule], src_port: u16) -> Vec<NftRule> {
    rules
        .iter()
        .filter(|r| marker::parse_forward_quota(&r.comment) == Some(src_port))
        .cloned()
        .collect()
}
