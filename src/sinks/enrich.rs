//! ISP lookup via ip-api.com, with a process-lifetime cache.
//!
//! Lookups are best effort: any failure caches a `None` so the same address
//! is not retried on every detail view.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use super::IspResolver;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IpApiResolver {
    client: reqwest::Client,
    cache: RwLock<HashMap<IpAddr, Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    isp: Option<String>,
}

impl IpApiResolver {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .user_agent(concat!("banwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            cache: RwLock::new(HashMap::new()),
        })
    }

    async fn fetch(&self, ip: IpAddr) -> Option<String> {
        let url = format!("http://ip-api.com/json/{ip}?fields=status,message,isp");
        let resp: IpApiResponse = self.client.get(&url).send().await.ok()?.json().await.ok()?;
        if resp.status != "success" {
            return None;
        }
        resp.isp.filter(|isp| !isp.is_empty())
    }
}

#[async_trait]
impl IspResolver for IpApiResolver {
    async fn lookup_isp(&self, ip: IpAddr) -> Option<String> {
        if let Some(cached) = self.cache.read().get(&ip) {
            return cached.clone();
        }

        let result = self.fetch(ip).await;
        if result.is_none() {
            debug!(%ip, "ISP lookup returned nothing");
        }
        self.cache.write().insert(ip, result.clone());
        result
    }
}
