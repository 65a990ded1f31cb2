//! Comment markers identifying rules owned by nftgate
//!
//! Markers are matched token by token, never by string prefix, so the forward on
//! port 80 is never confused with the one on port 8080.

/// Exact comment of a managed allowed-port rule
pub const MANAGED: &str = "nftgate managed";

/// Prefix tokens of the three rules backing one forward
pub const FORWARD: &str = "nftgate fwd";

/// Prefix tokens of the shadow quota rule in the forward chain
pub const FORWARD_QUOTA: &str = "nftgate quota fwd";

const LIMIT_PREFIX: &str = "limit:";

/// Longest rule comment nft accepts, in bytes
pub const MAX_COMMENT_BYTES: usize = 128;

/// Decoded contents of a forwarding comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTag {
    pub src_port: u16,
    pub limit_mbps: u32,
    pub comment: String,
}

/// Builds `nftgate fwd <port>[ limit:<mbps>][ <comment>]`.
pub fn encode_forward(src_port: u16, limit_mbps: u32, comment: &str) -> String {
    let mut out = format!("{FORWARD} {src_port}");
    if limit_mbps > 0 {
        out.push(' ');
        out.push_str(LIMIT_PREFIX);
        out.push_str(&limit_mbps.to_string());
    }
    if !comment.is_empty() {
        out.push(' ');
        out.push_str(comment);
    }
    out
}

/// Bytes left for the user text once the marker, port and limit tokens are in place.
pub fn forward_comment_budget(src_port: u16, limit_mbps: u32) -> usize {
    MAX_COMMENT_BYTES.saturating_sub(encode_forward(src_port, limit_mbps, "").len() + 1)
}

/// Parses a forwarding comment; `None` if the comment is not one of ours.
pub fn parse_forward(comment: &str) -> Option<ForwardTag> {
    let rest = strip_tokens(comment, FORWARD)?;
    let mut tokens = rest.split_whitespace().peekable();
    let src_port = tokens.next()?.parse::<u16>().ok()?;

    let mut limit_mbps = 0;
    if let Some(limit) = tokens
        .peek()
        .and_then(|t| t.strip_prefix(LIMIT_PREFIX))
        .and_then(|v| v.parse::<u32>().ok())
    {
        limit_mbps = limit;
        tokens.next();
    }

    Some(ForwardTag {
        src_port,
        limit_mbps,
        comment: tokens.collect::<Vec<_>>().join(" "),
    })
}

/// True if `comment` tags one of the three rules of the forward on `src_port`.
pub fn is_forward_for(comment: &str, src_port: u16) -> bool {
    parse_forward(comment).is_some_and(|tag| tag.src_port == src_port)
}

pub fn encode_forward_quota(src_port: u16) -> String {
    format!("{FORWARD_QUOTA} {src_port}")
}

/// Source port of a shadow quota comment.
pub fn parse_forward_quota(comment: &str) -> Option<u16> {
    let rest = strip_tokens(comment, FORWARD_QUOTA)?;
    let mut tokens = rest.split_whitespace();
    let port = tokens.next()?.parse().ok()?;
    tokens.next().is_none().then_some(port)
}

pub fn is_managed(comment: &str) -> bool {
    comment == MANAGED
}

/// Strips the whitespace-separated `marker` tokens from the front of `comment`.
fn strip_tokens<'a>(comment: &'a str, marker: &str) -> Option<&'a str> {
    let mut rest = comment.trim_start();
    for token in marker.split_whitespace() {
        rest = rest.strip_prefix(token)?;
        if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
            return None;
        }
        rest = rest.trim_start();
    }
    Some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_forward() {
        assert_eq!(encode_forward(9000, 0, ""), "nftgate fwd 9000");
        assert_eq!(encode_forward(9000, 0, "ssh box"), "nftgate fwd 9000 ssh box");
        assert_eq!(
            encode_forward(9000, 50, "ssh"),
            "nftgate fwd 9000 limit:50 ssh"
        );
    }

    #[test]
    fn test_comment_budget_leaves_room_for_tokens() {
        assert_eq!(forward_comment_budget(9000, 0), 128 - "nftgate fwd 9000 ".len());
        assert_eq!(
            forward_comment_budget(65535, 100_000),
            128 - "nftgate fwd 65535 limit:100000 ".len()
        );
    }

    #[test]
    fn test_parse_forward() {
        let tag = parse_forward("nftgate fwd 9000 limit:50 ssh box").unwrap();
        assert_eq!(tag.src_port, 9000);
        assert_eq!(tag.limit_mbps, 50);
        assert_eq!(tag.comment, "ssh box");

        let tag = parse_forward("nftgate fwd 443").unwrap();
        assert_eq!(tag.limit_mbps, 0);
        assert!(tag.comment.is_empty());
    }

    #[test]
    fn test_port_tokens_do_not_prefix_match() {
        assert!(is_forward_for("nftgate fwd 80", 80));
        assert!(!is_forward_for("nftgate fwd 8080", 80));
        assert!(!is_forward_for("nftgate fwd 80", 8080));
    }

    #[test]
    fn test_foreign_comments_rejected() {
        assert!(parse_forward("my dnat rule").is_none());
        assert!(parse_forward("nftgate fwdx 80").is_none());
        assert!(parse_forward("nftgate fwd abc").is_none());
        assert!(parse_forward("nftgate quota fwd 80").is_none());
    }

    #[test]
    fn test_forward_quota_marker() {
        assert_eq!(encode_forward_quota(9000), "nftgate quota fwd 9000");
        assert_eq!(parse_forward_quota("nftgate quota fwd 9000"), Some(9000));
        assert_eq!(parse_forward_quota("nftgate fwd 9000"), None);
        assert_eq!(parse_forward_quota("nftgate quota fwd 9000 extra"), None);
    }

    #[test]
    fn test_managed_is_exact() {
        assert!(is_managed("nftgate managed"));
        assert!(!is_managed("nftgate managed ssh"));
        assert!(!is_managed("ssh"));
    }
}
