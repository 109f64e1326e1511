//! Control-panel roster cache.
//!
//! A background worker polls the panel for the full user roster (email,
//! device limit, metadata) and swaps an immutable snapshot atomically.
//! Readers clone the `Arc` and never hold a lock. A failed fetch keeps the
//! last good snapshot and drops the `panel_loaded` flag; entries missing
//! from one successful pull are marked stale and removed only when the next
//! successful pull confirms their absence.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::RosterEntry;

const PAGE_SIZE: usize = 500;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Produces the full roster. The implementation owns auth and header
/// shaping; the cache only sees the result.
#[async_trait]
pub trait RosterFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RosterEntry>>;
}

/// One page of the panel's user listing.
#[derive(Debug, Deserialize)]
struct PanelPage {
    response: PanelPageBody,
}

#[derive(Debug, Deserialize)]
struct PanelPageBody {
    #[serde(default)]
    users: Vec<PanelUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PanelUser {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    hwid_device_limit: Option<u32>,
    #[serde(default)]
    telegram_id: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

impl PanelUser {
    fn into_entry(self) -> Option<RosterEntry> {
        let email = self
            .email
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| self.username.clone().filter(|u| !u.is_empty()))?;

        Some(RosterEntry {
            email,
            device_limit: self.hwid_device_limit.unwrap_or(1),
            telegram_id: self.telegram_id.map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
            description: self.description.filter(|d| !d.is_empty()),
            username: self.username,
            stale: false,
        })
    }
}

/// Paginated bearer-authed client for the panel's user listing.
pub struct PanelClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl PanelClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("banwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build panel HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }
}

#[async_trait]
impl RosterFetcher for PanelClient {
    async fn fetch(&self) -> Result<Vec<RosterEntry>> {
        let mut entries = Vec::new();
        let mut start = 0usize;

        loop {
            let url = format!(
                "{}/api/users?start={}&size={}",
                self.base_url, start, PAGE_SIZE
            );
            debug!(%url, "fetching roster page");

            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .header("X-Forwarded-For", "127.0.0.1")
                .header("X-Forwarded-Proto", "https")
                .header("X-Forwarded-Host", "localhost")
                .send()
                .await
                .context("panel request failed")?;

            if !resp.status().is_success() {
                bail!("panel returned HTTP {}", resp.status());
            }

            let page: PanelPage = resp.json().await.context("panel returned invalid JSON")?;
            let got = page.response.users.len();
            entries.extend(page.response.users.into_iter().filter_map(PanelUser::into_entry));

            if got < PAGE_SIZE {
                break;
            }
            start += PAGE_SIZE;
        }

        Ok(entries)
    }
}

/// The atomically swapped roster view.
#[derive(Debug, Default)]
pub struct RosterSnapshot {
    pub users: HashMap<String, RosterEntry>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Holder of the current snapshot plus the `panel_loaded` flag.
pub struct RosterCache {
    snapshot: RwLock<Arc<RosterSnapshot>>,
    loaded: AtomicBool,
}

impl RosterCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RosterSnapshot::default())),
            loaded: AtomicBool::new(false),
        }
    }

    /// Current snapshot; cheap, lock is held only for the `Arc` clone.
    pub fn snapshot(&self) -> Arc<RosterSnapshot> {
        self.snapshot.read().clone()
    }

    /// Whether the most recent fetch attempt succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Declared device limit for an email, if the roster knows it.
    pub fn limit_for(&self, email: &str) -> Option<u32> {
        self.snapshot().users.get(email).map(|e| e.device_limit)
    }

    /// Merge a successful fetch: fetched entries become fresh; entries only
    /// present in the previous snapshot survive one pull as stale.
    pub fn apply(&self, fetched: Vec<RosterEntry>) {
        let previous = self.snapshot();
        let mut users: HashMap<String, RosterEntry> =
            fetched.into_iter().map(|e| (e.email.clone(), e)).collect();

        let mut carried = 0usize;
        for (email, old) in previous.users.iter() {
            if !users.contains_key(email) && !old.stale {
                let mut kept = old.clone();
                kept.stale = true;
                users.insert(email.clone(), kept);
                carried += 1;
            }
        }

        let total = users.len();
        *self.snapshot.write() = Arc::new(RosterSnapshot {
            users,
            fetched_at: Some(Utc::now()),
        });
        self.loaded.store(true, Ordering::Relaxed);
        info!(total, carried_stale = carried, "roster snapshot swapped");
    }

    /// Record a failed fetch: keep the last snapshot, drop the flag.
    pub fn mark_failed(&self) {
        self.loaded.store(false, Ordering::Relaxed);
    }
}

impl Default for RosterCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic refresh worker; runs one fetch immediately, then on the
/// interval, until shutdown.
pub async fn refresh_loop(
    cache: Arc<RosterCache>,
    fetcher: Arc<dyn RosterFetcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match fetcher.fetch().await {
                    Ok(entries) => cache.apply(entries),
                    Err(e) => {
                        warn!(error = %e, "roster fetch failed, keeping last snapshot");
                        cache.mark_failed();
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("roster refresh stopping");
                    return;
                }
            }
        }
    }
}
