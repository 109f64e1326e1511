//! TCP ingest server for collector connections.
//!
//! Collectors hold one long-lived connection each and ship newline-delimited
//! records of the form `NODE_NAME|<raw log line>`. Lines are parsed and fed
//! to the tracker in arrival order; malformed lines are counted and dropped,
//! oversize records close the connection. There is no acknowledgement
//! protocol; a collector that reconnects reships from its own tail cursor.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::models::{Event, RejectReason};
use crate::parser;
use crate::tracker::UserTracker;

/// Records larger than this close the connection.
pub const MAX_LINE_BYTES: usize = 16 * 1024;
/// Connections silent for this long are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One live collector connection.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Registry of currently connected collectors, keyed by connection id.
/// A node is listed while its connection is open.
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<HashMap<u64, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self, conn_id: u64, peer: SocketAddr) {
        let now = Utc::now();
        self.inner.write().insert(
            conn_id,
            NodeInfo {
                node_id: format!("unknown-{}", peer.ip()),
                peer,
                connected_at: now,
                last_seen: now,
            },
        );
    }

    fn seen(&self, conn_id: u64, node_id: &str) {
        if let Some(info) = self.inner.write().get_mut(&conn_id) {
            if info.node_id != node_id {
                info!(node = node_id, peer = %info.peer, "node identified");
                info.node_id = node_id.to_string();
            }
            info.last_seen = Utc::now();
        }
    }

    fn disconnect(&self, conn_id: u64) -> Option<NodeInfo> {
        self.inner.write().remove(&conn_id)
    }

    /// Distinct node ids with an open connection.
    pub fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .inner
            .read()
            .values()
            .map(|info| info.node_id.clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().len()
    }
}

/// Ingest-side counters surfaced by the stats endpoint.
#[derive(Default)]
pub struct IngestStats {
    pub rejected_empty: AtomicU64,
    pub rejected_no_email: AtomicU64,
    pub rejected_malformed: AtomicU64,
    pub rejected_oversize: AtomicU64,
    pub io_errors: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_reject(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::Empty => &self.rejected_empty,
            RejectReason::NoEmail => &self.rejected_no_email,
            RejectReason::Malformed => &self.rejected_malformed,
            RejectReason::Oversize => &self.rejected_oversize,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_empty.load(Ordering::Relaxed)
            + self.rejected_no_email.load(Ordering::Relaxed)
            + self.rejected_malformed.load(Ordering::Relaxed)
            + self.rejected_oversize.load(Ordering::Relaxed)
    }
}

/// Bind the collector listener. Kept separate from the accept loop so an
/// unusable address fails startup instead of a background worker.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind ingest listener on {addr}"))
}

/// Accept loop over a bound listener; spawns one task per collector.
pub async fn run(
    listener: TcpListener,
    tracker: Arc<UserTracker>,
    registry: Arc<NodeRegistry>,
    stats: Arc<IngestStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "ingest server listening");
    }

    let mut conn_id: u64 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        conn_id += 1;
                        let id = conn_id;
                        let tracker = tracker.clone();
                        let registry = registry.clone();
                        let stats = stats.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_collector(id, stream, peer, tracker, &registry, stats, shutdown)
                                .await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("ingest server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_collector(
    conn_id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    tracker: Arc<UserTracker>,
    registry: &NodeRegistry,
    stats: Arc<IngestStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%peer, conn_id, "collector connected");
    registry.connect(conn_id, peer);

    let mut framed = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(IDLE_TIMEOUT, framed.next()) => next,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match next {
            Err(_) => {
                info!(%peer, conn_id, "collector idle, closing");
                break;
            }
            Ok(None) => {
                debug!(%peer, conn_id, "collector closed the connection");
                break;
            }
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                warn!(%peer, conn_id, "oversize record, closing connection");
                stats.count_reject(RejectReason::Oversize);
                break;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                warn!(%peer, conn_id, error = %e, "read error");
                stats.io_errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
            Ok(Some(Ok(record))) => {
                process_record(conn_id, &record, &tracker, registry, &stats);
            }
        }
    }

    if let Some(info) = registry.disconnect(conn_id) {
        info!(node = %info.node_id, %peer, "collector disconnected");
    }
}

/// Split one `NODE|line` record, parse and record the event.
fn process_record(
    conn_id: u64,
    record: &str,
    tracker: &UserTracker,
    registry: &NodeRegistry,
    stats: &IngestStats,
) {
    let Some((node_id, raw_line)) = record.split_once('|') else {
        stats.count_reject(RejectReason::Malformed);
        return;
    };

    let node_id = node_id.trim();
    if !valid_node_name(node_id) {
        stats.count_reject(RejectReason::Malformed);
        return;
    }
    registry.seen(conn_id, node_id);

    match parser::parse_line(raw_line) {
        Ok(parsed) => {
            let event = Event::from_parsed(parsed, node_id, Utc::now());
            tracker.record(event, Instant::now());
        }
        Err(reason) => {
            debug!(node = node_id, %reason, "line rejected");
            stats.count_reject(reason);
        }
    }
}

/// `NODE_NAME` is `[A-Za-z0-9._-]{1,64}`.
fn valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerConfig;

    const LINE: &str = "2024/05/01 12:00:00.123456 from 10.0.0.1:54321 accepted tcp:example.com:443 [inbound >> direct] email: alice@x";

    #[test]
    fn test_valid_node_names() {
        assert!(valid_node_name("node-1"));
        assert!(valid_node_name("eu.west_2"));
        assert!(!valid_node_name(""));
        assert!(!valid_node_name("bad name"));
        assert!(!valid_node_name("pipe|name"));
        assert!(!valid_node_name(&"x".repeat(65)));
    }

    #[test]
    fn test_process_record_feeds_tracker() {
        let tracker = UserTracker::new(TrackerConfig::default());
        let registry = NodeRegistry::new();
        registry.connect(1, "127.0.0.1:9000".parse().unwrap());
        let stats = IngestStats::new();

        process_record(1, &format!("node-1|{LINE}"), &tracker, &registry, &stats);

        assert_eq!(tracker.user_count(), 1);
        assert_eq!(tracker.total_requests(), 1);
        assert_eq!(registry.connected_nodes(), vec!["node-1".to_string()]);
        assert_eq!(stats.rejected_total(), 0);
    }

    #[test]
    fn test_process_record_counts_rejects() {
        let tracker = UserTracker::new(TrackerConfig::default());
        let registry = NodeRegistry::new();
        registry.connect(1, "127.0.0.1:9000".parse().unwrap());
        let stats = IngestStats::new();

        // No separator at all.
        process_record(1, "no separator here", &tracker, &registry, &stats);
        assert_eq!(stats.rejected_malformed.load(Ordering::Relaxed), 1);

        // Bad node name.
        process_record(1, &format!("bad node|{LINE}"), &tracker, &registry, &stats);
        assert_eq!(stats.rejected_malformed.load(Ordering::Relaxed), 2);

        // Line without an email token.
        process_record(
            1,
            "node-1|2024/05/01 12:00:00 from 10.0.0.1:1 accepted tcp:h:80 [x >> direct]",
            &tracker,
            &registry,
            &stats,
        );
        assert_eq!(stats.rejected_no_email.load(Ordering::Relaxed), 1);

        assert_eq!(tracker.user_count(), 0);
    }

    #[test]
    fn test_registry_connect_identify_disconnect() {
        let registry = NodeRegistry::new();
        let peer: SocketAddr = "10.1.1.1:5000".parse().unwrap();

        registry.connect(7, peer);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.connected_nodes(), vec!["unknown-10.1.1.1".to_string()]);

        registry.seen(7, "edge-fr-1");
        assert_eq!(registry.connected_nodes(), vec!["edge-fr-1".to_string()]);

        let info = registry.disconnect(7).unwrap();
        assert_eq!(info.node_id, "edge-fr-1");
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_registry_dedups_node_ids() {
        let registry = NodeRegistry::new();
        registry.connect(1, "10.1.1.1:5000".parse().unwrap());
        registry.connect(2, "10.1.1.2:5000".parse().unwrap());
        registry.seen(1, "edge-1");
        registry.seen(2, "edge-1");
        assert_eq!(registry.connected_nodes(), vec!["edge-1".to_string()]);
        assert_eq!(registry.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_end_to_end_over_tcp() {
        use tokio::io::AsyncWriteExt;

        let tracker = Arc::new(UserTracker::new(TrackerConfig::default()));
        let registry = Arc::new(NodeRegistry::new());
        let stats = Arc::new(IngestStats::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(run(
            listener,
            tracker.clone(),
            registry.clone(),
            stats.clone(),
            shutdown_rx,
        ));

        // Ship one good and one malformed record.
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(format!("node-1|{LINE}\n").as_bytes())
            .await
            .unwrap();
        conn.write_all(b"node-1|garbage email: but wrong\n").await.unwrap();
        conn.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.total_requests(), 1);
        assert_eq!(stats.rejected_malformed.load(Ordering::Relaxed), 1);
        assert_eq!(registry.connected_nodes(), vec!["node-1".to_string()]);

        drop(conn);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.connection_count(), 0);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
