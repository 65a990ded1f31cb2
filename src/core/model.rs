//! Domain objects exposed to callers
//!
//! These are reconstructed from nft listings by [`crate::core::codec`] and turned back
//! into nft operations by [`crate::core::compiler`]. None of them is edited in place
//! inside the firewall: every change is a delete followed by an add.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Usage percentage at which a quota is reported as `warning`.
pub const WARNING_PERCENT: f64 = 70.0;

/// Upper bound for the descriptive bandwidth limit (100 Gbit/s).
pub const MAX_LIMIT_MBPS: u32 = 100_000;

/// Transport protocol selector for quotas and forwards
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    /// TCP and UDP together (`meta l4proto { tcp, udp }`)
    #[default]
    #[strum(serialize = "both")]
    Both,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        }
    }
}

/// Quota health derived from usage percentage
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    #[strum(serialize = "ok")]
    Ok,
    #[strum(serialize = "warning")]
    Warning,
    #[strum(serialize = "exceeded")]
    Exceeded,
}

impl QuotaStatus {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 100.0 {
            QuotaStatus::Exceeded
        } else if percent >= WARNING_PERCENT {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Ok
        }
    }
}

/// Fully qualified chain location (`family table chain`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainRef {
    pub family: String,
    pub table: String,
    pub chain: String,
}

impl ChainRef {
    pub fn new(family: &str, table: &str, chain: &str) -> Self {
        Self {
            family: family.to_string(),
            table: table.to_string(),
            chain: chain.to_string(),
        }
    }

    /// Arguments addressing this chain on the nft command line.
    pub fn args(&self) -> [&str; 3] {
        [&self.family, &self.table, &self.chain]
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.family, self.table, self.chain)
    }
}

/// A byte-counting rule on one source port.
///
/// A single firewall rule matching a port set yields one `QuotaRule` per port,
/// all sharing the same handle. Port 0 means the rule carries a quota but no
/// recognizable port predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRule {
    pub id: String,
    pub handle: u64,
    pub port: u16,
    /// Protocol of the port predicate, kept so Modify/Reset recreate the same match
    #[serde(default)]
    pub protocol: Protocol,
    pub quota_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
    pub status: QuotaStatus,
    pub comment: String,
}

impl QuotaRule {
    pub fn new(
        chain: &ChainRef,
        handle: u64,
        port: u16,
        protocol: Protocol,
        quota_bytes: u64,
        used_bytes: u64,
        comment: String,
    ) -> Self {
        let mut rule = Self {
            id: quota_id(chain, handle, port),
            handle,
            port,
            protocol,
            quota_bytes,
            used_bytes,
            usage_percent: 0.0,
            status: QuotaStatus::Ok,
            comment,
        };
        rule.refresh_usage();
        rule
    }

    /// Folds bytes counted elsewhere (the forward-chain shadow rule) into this quota.
    pub fn add_usage(&mut self, bytes: u64) {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
        self.refresh_usage();
    }

    fn refresh_usage(&mut self) {
        self.usage_percent = if self.quota_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.quota_bytes as f64 * 100.0
        };
        self.status = QuotaStatus::from_percent(self.usage_percent);
    }
}

pub fn quota_id(chain: &ChainRef, handle: u64, port: u16) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        chain.family, chain.table, chain.chain, handle, port
    )
}

/// An inbound accept rule for one destination port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedPort {
    pub port: u16,
    pub handle: u64,
    pub managed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

/// Validated parameters of a forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// Already sanitized
    pub comment: String,
    pub limit_mbps: u32,
}

/// A logical port forward (ingress DNAT + egress masquerade + loopback DNAT)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    #[serde(default)]
    pub id: String,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub managed: bool,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub limit_mbps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_handle: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_handle: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl ForwardingRule {
    /// Builds a disabled rule from validated parameters.
    pub fn disabled(spec: &ForwardSpec) -> Self {
        Self {
            id: forward_id(spec.src_port),
            src_port: spec.src_port,
            dst_ip: spec.dst_ip,
            dst_port: spec.dst_port,
            protocol: spec.protocol,
            enabled: false,
            managed: true,
            comment: spec.comment.clone(),
            limit_mbps: spec.limit_mbps,
            pre_handle: None,
            post_handle: None,
        }
    }

    pub fn spec(&self) -> ForwardSpec {
        ForwardSpec {
            src_port: self.src_port,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
            protocol: self.protocol,
            comment: self.comment.clone(),
            limit_mbps: self.limit_mbps,
        }
    }
}

pub fn forward_id(src_port: u16) -> String {
    format!("fwd_{src_port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ChainRef {
        ChainRef::new("inet", "filter", "output")
    }

    #[test]
    fn test_quota_status_thresholds() {
        assert_eq!(QuotaStatus::from_percent(0.0), QuotaStatus::Ok);
        assert_eq!(QuotaStatus::from_percent(69.9), QuotaStatus::Ok);
        assert_eq!(QuotaStatus::from_percent(70.0), QuotaStatus::Warning);
        assert_eq!(QuotaStatus::from_percent(99.99), QuotaStatus::Warning);
        assert_eq!(QuotaStatus::from_percent(100.0), QuotaStatus::Exceeded);
    }

    #[test]
    fn test_quota_rule_derives_usage() {
        let rule = QuotaRule::new(
            &chain(),
            7,
            8080,
            Protocol::Both,
            10_000_000,
            11_000_000,
            String::new(),
        );
        assert_eq!(rule.id, "inet_filter_output_7_8080");
        assert!((rule.usage_percent - 110.0).abs() < 1e-9);
        assert_eq!(rule.status, QuotaStatus::Exceeded);
    }

    #[test]
    fn test_zero_limit_reports_zero_percent() {
        let rule = QuotaRule::new(&chain(), 1, 80, Protocol::Tcp, 0, 5_000, String::new());
        assert_eq!(rule.usage_percent, 0.0);
        assert_eq!(rule.status, QuotaStatus::Ok);
    }

    #[test]
    fn test_add_usage_rederives_status() {
        let mut rule = QuotaRule::new(&chain(), 1, 80, Protocol::Both, 1_000, 500, String::new());
        assert_eq!(rule.status, QuotaStatus::Ok);
        rule.add_usage(250);
        assert_eq!(rule.status, QuotaStatus::Warning);
        assert_eq!(rule.used_bytes, 750);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("both".parse::<Protocol>().unwrap(), Protocol::Both);
        assert!("sctp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Udp.to_string(), "udp");
    }

    #[test]
    fn test_forwarding_rule_deserializes_without_identity() {
        let json = r#"{"src_port":9000,"dst_ip":"10.0.0.5","dst_port":22,"protocol":"tcp"}"#;
        let rule: ForwardingRule = serde_json::from_str(json).unwrap();
        assert!(rule.id.is_empty());
        assert!(rule.managed);
        assert!(!rule.enabled);
        assert_eq!(rule.limit_mbps, 0);
    }
}
