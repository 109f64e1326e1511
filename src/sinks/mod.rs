//! Optional capabilities behind narrow contracts.
//!
//! Persistence, outbound notification and IP enrichment are each
//! independently present or absent. Absent capabilities are replaced by
//! no-op implementations at construction time so the classifier never
//! branches on their presence.

pub mod enrich;
pub mod notify;
pub mod persist;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::models::{BanlistRecord, DomainEvent};

/// Durable banlist storage.
pub trait BanlistStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<BanlistRecord>>;
    fn upsert(&self, email: &str, now: DateTime<Utc>, reason: &str) -> Result<()>;
    fn delete(&self, email: &str) -> Result<()>;
    /// Returns the number of removed rows.
    fn clear(&self) -> Result<usize>;
}

/// Outbound notification. Fire and forget; implementations must not block
/// the caller on delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &DomainEvent);
}

/// ISP lookup for detail views. `None` when unknown or unavailable.
#[async_trait]
pub trait IspResolver: Send + Sync {
    async fn lookup_isp(&self, ip: IpAddr) -> Option<String>;
}

/// Banlist store that remembers nothing.
pub struct NoopStore;

impl BanlistStore for NoopStore {
    fn load_all(&self) -> Result<Vec<BanlistRecord>> {
        Ok(Vec::new())
    }

    fn upsert(&self, _email: &str, _now: DateTime<Utc>, _reason: &str) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _email: &str) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Notifier that drops everything.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _event: &DomainEvent) {}
}

/// Resolver that knows nothing.
pub struct NoopResolver;

#[async_trait]
impl IspResolver for NoopResolver {
    async fn lookup_isp(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// The capability bundle handed to the classifier and the query API.
#[derive(Clone)]
pub struct Sinks {
    pub store: Arc<dyn BanlistStore>,
    pub notifier: Arc<dyn Notifier>,
    pub resolver: Arc<dyn IspResolver>,
}

impl Sinks {
    /// All capabilities disabled.
    pub fn noop() -> Self {
        Self {
            store: Arc::new(NoopStore),
            notifier: Arc::new(NoopNotifier),
            resolver: Arc::new(NoopResolver),
        }
    }

    /// Select capabilities from configuration presence.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn BanlistStore> = match &config.banlist_db {
            Some(path) => {
                info!(path = %path, "banlist persistence enabled");
                Arc::new(persist::SqliteBanlist::open(path)?)
            }
            None => Arc::new(NoopStore),
        };

        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => {
                info!(url = %url, "webhook notifications enabled");
                Arc::new(notify::WebhookNotifier::spawn(url.clone())?)
            }
            None => Arc::new(NoopNotifier),
        };

        let resolver: Arc<dyn IspResolver> = if config.isp_lookup {
            info!("ISP enrichment enabled");
            Arc::new(enrich::IpApiResolver::new()?)
        } else {
            Arc::new(NoopResolver)
        };

        Ok(Self {
            store,
            notifier,
            resolver,
        })
    }
}
