//! Access-log line parser.
//!
//! Parses one line of the VPN core's access log into a typed [`ParsedLine`]
//! or a [`RejectReason`]. The expected shape is:
//!
//! ```text
//! 2024/05/01 12:00:00.123456 from 10.0.0.1:54321 accepted tcp:example.com:443 [inbound >> direct] email: alice@x
//! ```
//!
//! The parser is a pure function: no state, no I/O, no clock reads.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;

use crate::models::{ParsedLine, RejectReason};

/// Anchored on the literal `from`, the `proto:host:port` triple and the
/// trailing `email:` token. The source may carry a `tcp:`/`udp:` prefix and
/// may be a bracketed IPv6 address. The routing tag is optional.
fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"^(?P<ts>\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d{1,6})?)\s+",
            r"from\s+(?:tcp:|udp:)?(?P<src>\[[0-9A-Fa-f:.]+\]|\d{1,3}(?:\.\d{1,3}){3}):\d+\s+",
            r"(?P<verb>\w+)\s+",
            r"(?P<proto>\w+):(?P<dst>\S+?):(?P<dport>\d{1,5})",
            r"(?:\s+\[(?P<tag>[^\]]*)\])?",
            r"\s+email:\s*(?P<email>\S+)",
        ))
        .expect("access-log pattern is valid")
    })
}

/// Parse a single access-log line.
///
/// Empty and control-prefixed lines reject with [`RejectReason::Empty`],
/// lines missing an `email:` token with [`RejectReason::NoEmail`], and
/// anything else that fails the grammar with [`RejectReason::Malformed`].
pub fn parse_line(line: &str) -> Result<ParsedLine, RejectReason> {
    let line = line.trim();
    if line.is_empty() || line.chars().next().is_some_and(|c| c.is_control()) {
        return Err(RejectReason::Empty);
    }
    if !line.contains("email:") {
        return Err(RejectReason::NoEmail);
    }

    let caps = line_pattern().captures(line).ok_or(RejectReason::Malformed)?;

    let source_ip = parse_source_ip(&caps["src"]).ok_or(RejectReason::Malformed)?;
    let dest_port: u16 = caps["dport"].parse().map_err(|_| RejectReason::Malformed)?;

    let email = caps["email"].trim().to_string();
    if email.is_empty() {
        return Err(RejectReason::NoEmail);
    }

    // The routing tag carries the real outcome (`[inbound >> direct]`,
    // `[... -> blocked]`); the verb before the destination is the fallback.
    let action = caps
        .name("tag")
        .map(|t| action_from_tag(t.as_str()))
        .unwrap_or_else(|| caps["verb"].to_string());

    Ok(ParsedLine {
        timestamp: parse_timestamp(&caps["ts"]),
        source_ip,
        protocol: caps["proto"].to_string(),
        destination: caps["dst"].to_string(),
        dest_port,
        action,
        email,
    })
}

fn parse_source_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')).unwrap_or(raw);
    raw.parse().ok()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Extract the outcome from a routing tag: the token after the last `>>` or
/// `->`, or the whole tag when no arrow is present.
fn action_from_tag(tag: &str) -> String {
    let after_arrow = tag
        .rsplit_once(">>")
        .or_else(|| tag.rsplit_once("->"))
        .map(|(_, rhs)| rhs)
        .unwrap_or(tag);
    after_arrow.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const LINE: &str = "2024/05/01 12:00:00.123456 from 10.0.0.1:54321 accepted tcp:example.com:443 [inbound >> direct] email: alice@x";

    #[test]
    fn test_parse_full_line() {
        let parsed = parse_line(LINE).unwrap();
        assert_eq!(parsed.source_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(parsed.protocol, "tcp");
        assert_eq!(parsed.destination, "example.com");
        assert_eq!(parsed.dest_port, 443);
        assert_eq!(parsed.action, "direct");
        assert_eq!(parsed.email, "alice@x");
        assert!(parsed.timestamp.is_some());
    }

    #[test]
    fn test_whitespace_is_insignificant() {
        let padded = "  2024/05/01 12:00:00.123456   from 10.0.0.1:54321  accepted   tcp:example.com:443   [inbound >> direct]   email:  alice@x  ";
        assert_eq!(parse_line(padded).unwrap(), parse_line(LINE).unwrap());
    }

    #[test]
    fn test_source_with_transport_prefix() {
        let line = "2024/05/01 12:00:00 from udp:10.0.0.9:5000 accepted udp:1.1.1.1:53 [dns -> blocked] email: bob@x";
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.source_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(parsed.protocol, "udp");
        assert_eq!(parsed.action, "blocked");
    }

    #[test]
    fn test_bracketed_ipv6_source() {
        let line = "2024/05/01 12:00:00 from [2001:db8::1]:443 accepted tcp:example.com:80 [in >> direct] email: v6@x";
        let parsed = parse_line(line).unwrap();
        assert_eq!(
            parsed.source_ip,
            IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_missing_tag_falls_back_to_verb() {
        let line = "2024/05/01 12:00:00 from 10.0.0.1:1 accepted tcp:h:80 email: a@x";
        assert_eq!(parse_line(line).unwrap().action, "accepted");
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(parse_line(""), Err(RejectReason::Empty));
        assert_eq!(parse_line("   "), Err(RejectReason::Empty));
        assert_eq!(parse_line("\x1b[0m junk"), Err(RejectReason::Empty));
    }

    #[test]
    fn test_rejects_no_email() {
        let line = "2024/05/01 12:00:00 from 10.0.0.1:1 accepted tcp:h:80 [x >> direct]";
        assert_eq!(parse_line(line), Err(RejectReason::NoEmail));
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(
            parse_line("total garbage but with email: a@x"),
            Err(RejectReason::Malformed)
        );
        // Unparseable source address
        let line = "2024/05/01 12:00:00 from 999.0.0.1:1 accepted tcp:h:80 email: a@x";
        assert_eq!(parse_line(line), Err(RejectReason::Malformed));
    }

    #[test]
    fn test_timestamp_without_fraction() {
        let line = "2024/05/01 12:00:00 from 10.0.0.1:1 accepted tcp:h:80 email: a@x";
        assert!(parse_line(line).unwrap().timestamp.is_some());
    }

    #[test]
    fn test_email_is_case_sensitive() {
        let line = "2024/05/01 12:00:00 from 10.0.0.1:1 accepted tcp:h:80 email: Alice@X";
        assert_eq!(parse_line(line).unwrap().email, "Alice@X");
    }
}
