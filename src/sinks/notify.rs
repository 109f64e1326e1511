//! Webhook notification sink.
//!
//! Events are pushed into a bounded queue drained by one background worker
//! that POSTs them as JSON. A full queue or a failed delivery drops the
//! event with a warning; there is no retry.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Notifier;
use crate::models::DomainEvent;

const QUEUE_CAPACITY: usize = 256;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookNotifier {
    tx: mpsc::Sender<DomainEvent>,
}

impl WebhookNotifier {
    /// Build the notifier and spawn its delivery worker.
    pub fn spawn(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .user_agent(concat!("banwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let (tx, mut rx) = mpsc::channel::<DomainEvent>(QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match client.post(&url).json(&event).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(email = event.email(), "notification delivered");
                    }
                    Ok(resp) => {
                        warn!(
                            email = event.email(),
                            status = %resp.status(),
                            "webhook rejected notification"
                        );
                    }
                    Err(e) => {
                        warn!(email = event.email(), error = %e, "webhook delivery failed");
                    }
                }
            }
        });

        Ok(Self { tx })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, event: &DomainEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            warn!(email = event.email(), error = %e, "notification queue full, dropping");
        }
    }
}
