use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Why a log line was refused by the parser or the ingest framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum RejectReason {
    #[error("empty or control-prefixed line")]
    Empty,
    #[error("no email token in line")]
    NoEmail,
    #[error("line does not match the access-log grammar")]
    Malformed,
    #[error("record exceeds the per-line size limit")]
    Oversize,
}

/// Fields extracted from a single access-log line.
///
/// The line timestamp is informational only; all window math keys off the
/// server's ingest clock so agent clocks are never trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub source_ip: IpAddr,
    pub protocol: String,
    pub destination: String,
    pub dest_port: u16,
    pub action: String,
    pub email: String,
}

/// One attributed connection event, as seen by the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub node_id: String,
    pub observed_at: DateTime<Utc>,
    pub source_ip: IpAddr,
    pub protocol: String,
    pub destination: String,
    pub dest_port: u16,
    pub action: String,
    pub email: String,
}

impl Event {
    pub fn from_parsed(parsed: ParsedLine, node_id: &str, observed_at: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.to_string(),
            observed_at,
            source_ip: parsed.source_ip,
            protocol: parsed.protocol,
            destination: parsed.destination,
            dest_port: parsed.dest_port,
            action: parsed.action,
            email: parsed.email,
        }
    }
}

/// One entry of a user's bounded request history ring.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub observed_at: DateTime<Utc>,
    pub source_ip: IpAddr,
    pub protocol: String,
    pub destination: String,
    pub dest_port: u16,
    pub action: String,
    pub node_id: String,
}

/// Derived classification stage for a user.
///
/// Ordering matters: a banlisted user stays banlisted no matter what the
/// window currently shows, a violator outranks a plain overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clean,
    OverLimit,
    Violator,
    Banlisted,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Clean => write!(f, "clean"),
            Stage::OverLimit => write!(f, "over_limit"),
            Stage::Violator => write!(f, "violator"),
            Stage::Banlisted => write!(f, "banlisted"),
        }
    }
}

/// One user as declared by the control panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub email: String,
    /// Declared device cap. Zero means unlimited.
    pub device_limit: u32,
    pub telegram_id: Option<String>,
    pub description: Option<String>,
    pub username: Option<String>,
    /// Entry was absent from the most recent successful panel pull.
    #[serde(default)]
    pub stale: bool,
}

/// Durable banlist row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanlistRecord {
    pub email: String,
    pub first_banlisted_at: DateTime<Utc>,
    pub last_seen_banlisted_at: DateTime<Utc>,
    pub reason: String,
}

/// Classification transitions emitted to the sink layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    ViolatorOnset {
        email: String,
        observed_ips: Vec<IpAddr>,
        limit: u32,
        at: DateTime<Utc>,
    },
    ViolatorCleared {
        email: String,
        at: DateTime<Utc>,
    },
    BanlistAdded {
        email: String,
        at: DateTime<Utc>,
    },
    /// Still over the banlist threshold in an ongoing run; rate limited.
    ViolationContinues {
        email: String,
        observed_ips: Vec<IpAddr>,
        limit: u32,
        at: DateTime<Utc>,
    },
    BanlistCleared {
        email: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn email(&self) -> &str {
        match self {
            DomainEvent::ViolatorOnset { email, .. }
            | DomainEvent::ViolatorCleared { email, .. }
            | DomainEvent::BanlistAdded { email, .. }
            | DomainEvent::ViolationContinues { email, .. }
            | DomainEvent::BanlistCleared { email, .. } => email,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::OverLimit.to_string(), "over_limit");
        assert_eq!(Stage::Banlisted.to_string(), "banlisted");
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::OverLimit).unwrap();
        assert_eq!(json, "\"over_limit\"");
    }

    #[test]
    fn test_domain_event_email() {
        let ev = DomainEvent::BanlistAdded {
            email: "a@x".to_string(),
            at: Utc::now(),
        };
        assert_eq!(ev.email(), "a@x");
    }
}
