use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration, read from the environment.
///
/// Every knob has a documented default; only the panel coordinates are
/// required. Parse failures are fatal at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Control panel base URL, e.g. `http://127.0.0.1:3000`.
    pub panel_url: String,
    /// Bearer token for panel requests.
    #[serde(skip)]
    pub panel_token: String,
    /// Shared secret for the query API. Empty disables auth.
    #[serde(skip)]
    pub api_token: String,

    /// TCP bind for collector connections.
    pub ingest_bind: SocketAddr,
    /// HTTP bind for the query API.
    pub api_bind: SocketAddr,

    /// Sliding window over which distinct source IPs are counted.
    pub concurrent_window_secs: u64,
    /// Window over which overflow triggers accumulate.
    pub trigger_period_secs: u64,
    /// Triggers within the period required for violator promotion.
    pub trigger_count: usize,
    /// Continuous violation time required for banlist promotion.
    pub banlist_threshold_secs: u64,
    /// Consecutive sub-limit ticks required to clear a violation run.
    /// 1 reproduces the single-tick clearing of the original deployment.
    pub clear_hysteresis_ticks: u32,
    /// Collapse IPv4 to /24 and IPv6 to /64 before counting.
    pub subnet_grouping: bool,
    /// Observation retention.
    pub retention_secs: u64,
    /// Classifier tick interval.
    pub classifier_tick_ms: u64,
    /// Panel roster refresh interval.
    pub panel_reload_secs: u64,
    /// Minimum spacing of repeat notifications per user.
    pub notify_interval_secs: u64,

    /// Emails never classified.
    pub whitelist: HashSet<String>,

    /// Banlist database path; presence enables the Persist sink.
    pub banlist_db: Option<String>,
    /// Webhook URL; presence enables the Notify sink.
    pub notify_webhook_url: Option<String>,
    /// Enables the ISP enrichment sink.
    pub isp_lookup: bool,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let panel_url = require("PANEL_URL")?;
        let panel_token = require("PANEL_TOKEN")?;

        let config = Self {
            panel_url,
            panel_token,
            api_token: optional("API_TOKEN").unwrap_or_default(),
            ingest_bind: parse_var("INGEST_BIND", "0.0.0.0:9999")?,
            api_bind: parse_var("API_BIND", "0.0.0.0:8080")?,
            concurrent_window_secs: parse_var("CONCURRENT_WINDOW", "2")?,
            trigger_period_secs: parse_var("TRIGGER_PERIOD", "30")?,
            trigger_count: parse_var("TRIGGER_COUNT", "5")?,
            banlist_threshold_secs: parse_var("BANLIST_THRESHOLD_SECONDS", "300")?,
            clear_hysteresis_ticks: parse_var("CLEAR_HYSTERESIS_TICKS", "1")?,
            subnet_grouping: parse_bool("SUBNET_GROUPING", false)?,
            retention_secs: parse_var("RETENTION_SECONDS", "3600")?,
            classifier_tick_ms: parse_var("CLASSIFIER_TICK_MS", "1000")?,
            panel_reload_secs: parse_var("PANEL_RELOAD_SECONDS", "60")?,
            notify_interval_secs: parse_var("NOTIFY_INTERVAL_SECONDS", "300")?,
            whitelist: parse_whitelist(&optional("WHITELIST_EMAILS").unwrap_or_default()),
            banlist_db: optional("BANLIST_DB"),
            notify_webhook_url: optional("NOTIFY_WEBHOOK_URL"),
            isp_lookup: parse_bool("ISP_LOOKUP", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.panel_url.trim().is_empty() {
            bail!("PANEL_URL must not be empty");
        }
        if self.panel_token.trim().is_empty() {
            bail!("PANEL_TOKEN must not be empty");
        }
        if self.trigger_count == 0 {
            bail!("TRIGGER_COUNT must be at least 1");
        }
        if self.clear_hysteresis_ticks == 0 {
            bail!("CLEAR_HYSTERESIS_TICKS must be at least 1");
        }
        if self.classifier_tick_ms == 0 {
            bail!("CLASSIFIER_TICK_MS must be at least 1");
        }
        Ok(())
    }

    pub fn concurrent_window(&self) -> Duration {
        Duration::from_secs(self.concurrent_window_secs)
    }

    pub fn trigger_period(&self) -> Duration {
        Duration::from_secs(self.trigger_period_secs)
    }

    pub fn banlist_threshold(&self) -> Duration {
        Duration::from_secs(self.banlist_threshold_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn classifier_tick(&self) -> Duration {
        Duration::from_millis(self.classifier_tick_ms)
    }

    pub fn panel_reload(&self) -> Duration {
        Duration::from_secs(self.panel_reload_secs)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_secs(self.notify_interval_secs)
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} must be set"))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{key}={raw} is not a valid value"))
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => bail!("{key}={raw} is not a valid boolean"),
        },
    }
}

fn parse_whitelist(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_parsing() {
        let set = parse_whitelist(" alice@x , bob@y ,, ");
        assert_eq!(set.len(), 2);
        assert!(set.contains("alice@x"));
        assert!(set.contains("bob@y"));
    }

    #[test]
    fn test_whitelist_empty() {
        assert!(parse_whitelist("").is_empty());
    }

    fn valid_config() -> Config {
        Config {
            panel_url: "http://panel".to_string(),
            panel_token: "t".to_string(),
            api_token: String::new(),
            ingest_bind: "0.0.0.0:9999".parse().unwrap(),
            api_bind: "0.0.0.0:8080".parse().unwrap(),
            concurrent_window_secs: 2,
            trigger_period_secs: 30,
            trigger_count: 5,
            banlist_threshold_secs: 300,
            clear_hysteresis_ticks: 1,
            subnet_grouping: false,
            retention_secs: 3600,
            classifier_tick_ms: 1000,
            panel_reload_secs: 60,
            notify_interval_secs: 300,
            whitelist: HashSet::new(),
            banlist_db: None,
            notify_webhook_url: None,
            isp_lookup: false,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_trigger_count() {
        let mut config = valid_config();
        config.trigger_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_panel_token() {
        let mut config = valid_config();
        config.panel_token = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_panel_url() {
        let mut config = valid_config();
        config.panel_url = String::new();
        assert!(config.validate().is_err());
    }
}
