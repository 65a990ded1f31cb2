//! Input validation and sanitization functions for nftgate
//!
//! Everything here runs before an operation is compiled, so a rejected input
//! never reaches the control plane.

use crate::core::error::{Error, Result};
use crate::core::marker::forward_comment_budget;
use crate::core::model::{ForwardSpec, MAX_LIMIT_MBPS, Protocol};
use std::net::Ipv4Addr;

/// Maximum comment length (in characters) after sanitization.
pub const MAX_COMMENT_CHARS: usize = 100;

/// Sanitizes a quota comment for safe embedding in nft commands.
///
/// Keeps ASCII letters, digits, whitespace, hyphen, underscore and period.
///
/// # Examples
///
/// ```
/// use nftgate::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("web \"prod\"; drop"), "web prod drop");
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || is_comment_punct(*c))
        .take(MAX_COMMENT_CHARS)
        .collect()
}

/// Sanitizes a forwarding comment.
///
/// Same rules as [`sanitize_comment`], plus CJK unified ideographs (U+4E00..=U+9FFF)
/// so localized descriptions survive.
pub fn sanitize_forward_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || is_comment_punct(*c)
                || ('\u{4e00}'..='\u{9fff}').contains(c)
        })
        .take(MAX_COMMENT_CHARS)
        .collect()
}

fn is_comment_punct(c: char) -> bool {
    c.is_ascii_whitespace() || matches!(c, '-' | '_' | '.')
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(field: &str, port: u16) -> Result<u16> {
    if port == 0 {
        Err(Error::validation(field, "port must be between 1 and 65535"))
    } else {
        Ok(port)
    }
}

/// Parses a dotted-decimal IPv4 literal.
///
/// IPv6 forms, including IPv4-mapped addresses, are rejected.
pub fn validate_ipv4(input: &str) -> Result<Ipv4Addr> {
    let trimmed = input.trim();
    if trimmed.contains(':') {
        return Err(Error::validation(
            "dst_ip",
            format!("{input} is not an IPv4 address"),
        ));
    }
    trimmed
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::validation("dst_ip", format!("{input} is not an IPv4 address")))
}

/// Parses the protocol token (`tcp`, `udp` or `both`).
pub fn parse_protocol(input: &str) -> Result<Protocol> {
    input.trim().parse::<Protocol>().map_err(|_| {
        Error::validation(
            "protocol",
            format!("{input} is not one of tcp, udp, both"),
        )
    })
}

/// Validates a quota limit in bytes.
pub fn validate_quota_bytes(bytes: u64) -> Result<u64> {
    if bytes == 0 {
        Err(Error::validation("bytes", "quota limit must be positive"))
    } else {
        Ok(bytes)
    }
}

/// Validates the descriptive bandwidth limit (0 = unlimited).
pub fn validate_limit_mbps(limit: u32) -> Result<u32> {
    if limit > MAX_LIMIT_MBPS {
        Err(Error::validation(
            "limit_mbps",
            format!("limit exceeds {MAX_LIMIT_MBPS} Mbps"),
        ))
    } else {
        Ok(limit)
    }
}

/// Validates raw forwarding parameters into a [`ForwardSpec`].
pub fn validate_forward(
    src_port: u16,
    dst_ip: &str,
    dst_port: u16,
    protocol: &str,
    comment: &str,
    limit_mbps: u32,
) -> Result<ForwardSpec> {
    Ok(ForwardSpec {
        src_port: validate_port("src_port", src_port)?,
        dst_ip: validate_ipv4(dst_ip)?,
        dst_port: validate_port("dst_port", dst_port)?,
        protocol: parse_protocol(protocol)?,
        comment: forward_comment(comment, src_port, limit_mbps),
        limit_mbps: validate_limit_mbps(limit_mbps)?,
    })
}

/// Sanitized forwarding comment that fits the firewall's comment size once
/// encoded next to the marker for `src_port` and `limit_mbps`.
pub fn forward_comment(input: &str, src_port: u16, limit_mbps: u32) -> String {
    let normalized = normalize_whitespace(&sanitize_forward_comment(input));
    truncate_bytes(&normalized, forward_comment_budget(src_port, limit_mbps))
        .trim_end()
        .to_string()
}

/// Longest prefix of `input` within `max` bytes, cut on a char boundary.
pub fn truncate_bytes(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

/// Extracts the source port from a forwarding id (`fwd_<port>`).
pub fn parse_forward_id(id: &str) -> Result<u16> {
    id.strip_prefix("fwd_")
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::validation("id", format!("{id} is not a forwarding id (fwd_<port>)")))
}

/// Collapses whitespace runs to single spaces and trims both ends.
///
/// Forwarding comments are split on whitespace when read back from the firewall,
/// so they are stored in this form from the start.
pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validates an nft table/chain identifier taken from configuration.
///
/// Identifiers end up as separate argv entries, but restricting them keeps
/// listings and ids predictable.
pub fn validate_identifier(field: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::validation(field, "must be 1-64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(Error::validation(
            field,
            format!("{name} contains invalid characters (use a-z, 0-9, _, -)"),
        ));
    }
    Ok(())
}
