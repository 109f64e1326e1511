//! Per-user sliding-window IP tracking.
//!
//! Maintains one [`UserState`] per email seen in the ingest stream:
//! time-stamped IP observations, a bounded ring of recent requests for the
//! detail view, and the classifier's per-user staging fields. All window
//! arithmetic runs on a monotonic clock passed in explicitly; wall-clock
//! timestamps are carried alongside only for display.

use chrono::{DateTime, Utc};
use ipnetwork::{Ipv4Network, Ipv6Network};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::models::{Event, RequestLog, Stage};

/// Requests kept per user for the detail view.
pub const RECENT_REQUESTS_CAP: usize = 200;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Observations older than this are evicted.
    pub retention: Duration,
    /// Canonicalize IPv4 to /24 and IPv6 to /64 before counting.
    pub subnet_grouping: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            subnet_grouping: false,
        }
    }
}

/// Last sighting of one source IP for one user.
#[derive(Debug, Clone)]
pub struct IpObservation {
    pub last_seen: Instant,
    pub last_seen_wall: DateTime<Utc>,
    pub node_id: String,
    pub request_count: u64,
}

/// Everything known about one email.
#[derive(Debug)]
pub struct UserState {
    pub email: String,
    /// IP (canonicalized when subnet grouping is on) -> last sighting.
    pub observations: HashMap<IpAddr, IpObservation>,
    /// Bounded ring of raw requests; source IPs here are never canonicalized.
    pub recent_requests: VecDeque<RequestLog>,
    /// Monotonic instants of concurrent-window overflows, pruned to the
    /// trigger period by the classifier.
    pub trigger_times: Vec<Instant>,
    pub violator_since: Option<Instant>,
    pub violator_since_wall: Option<DateTime<Utc>>,
    pub banlisted_since: Option<DateTime<Utc>>,
    /// Every IP observed while the user was in violator stage.
    pub violation_ips: HashSet<IpAddr>,
    /// Consecutive classifier ticks at or under the limit.
    pub clean_ticks: u32,
    pub request_count: u64,
    pub blocked_count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserState {
    fn new(email: String) -> Self {
        Self {
            email,
            observations: HashMap::new(),
            recent_requests: VecDeque::with_capacity(32),
            trigger_times: Vec::new(),
            violator_since: None,
            violator_since_wall: None,
            banlisted_since: None,
            violation_ips: HashSet::new(),
            clean_ticks: 0,
            request_count: 0,
            blocked_count: 0,
            first_seen: None,
            last_seen: None,
        }
    }

    /// IPs seen within `window` of `now`. A zero window keeps only
    /// observations stamped at the query instant.
    pub fn recent_ips(&self, window: Duration, now: Instant) -> HashSet<IpAddr> {
        self.observations
            .iter()
            .filter(|(_, obs)| now.duration_since(obs.last_seen) <= window)
            .map(|(ip, _)| *ip)
            .collect()
    }

    /// IP -> request count, over the same window as [`Self::recent_ips`].
    pub fn recent_ip_counts(&self, window: Duration, now: Instant) -> BTreeMap<IpAddr, u64> {
        self.observations
            .iter()
            .filter(|(_, obs)| now.duration_since(obs.last_seen) <= window)
            .map(|(ip, obs)| (*ip, obs.request_count))
            .collect()
    }

    /// Derive the stage from the staging fields plus the current
    /// concurrent count and limit. `limit` of `None` means unlimited or
    /// unknown; zero likewise never classifies.
    pub fn stage(&self, concurrent: usize, limit: Option<u32>) -> Stage {
        if self.banlisted_since.is_some() {
            Stage::Banlisted
        } else if self.violator_since.is_some() {
            Stage::Violator
        } else if matches!(limit, Some(l) if l > 0 && concurrent > l as usize) {
            Stage::OverLimit
        } else {
            Stage::Clean
        }
    }

    /// Drop observations older than `retention`. Returns how many were
    /// removed.
    fn prune_observations(&mut self, retention: Duration, now: Instant) -> usize {
        let before = self.observations.len();
        self.observations
            .retain(|_, obs| now.duration_since(obs.last_seen) <= retention);
        before - self.observations.len()
    }

    /// Whether prune may evict this user entirely: nothing observed and
    /// no non-clean stage to preserve.
    fn evictable(&self) -> bool {
        self.observations.is_empty()
            && self.violator_since.is_none()
            && self.banlisted_since.is_none()
    }
}

/// Tracker over all known users.
///
/// The map sits behind a single reader-writer lock; `record` takes the
/// write path and is O(1) amortized, the query surface and the classifier
/// take snapshots through [`UserTracker::with_users`]. The lock is never
/// held across an await point.
pub struct UserTracker {
    cfg: TrackerConfig,
    users: RwLock<HashMap<String, UserState>>,
    total_requests: AtomicU64,
    total_blocked: AtomicU64,
}

impl UserTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            users: RwLock::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    /// Record one attributed event. Creates the user on first sight.
    pub fn record(&self, event: Event, now: Instant) {
        let key_ip = if self.cfg.subnet_grouping {
            canonical_ip(event.source_ip)
        } else {
            event.source_ip
        };
        let blocked = event.action.eq_ignore_ascii_case("block")
            || event.action.eq_ignore_ascii_case("blocked");

        let mut users = self.users.write();
        let user = users
            .entry(event.email.clone())
            .or_insert_with(|| UserState::new(event.email.clone()));

        match user.observations.get_mut(&key_ip) {
            Some(obs) => {
                obs.last_seen = now;
                obs.last_seen_wall = event.observed_at;
                obs.node_id = event.node_id.clone();
                obs.request_count += 1;
            }
            None => {
                user.observations.insert(
                    key_ip,
                    IpObservation {
                        last_seen: now,
                        last_seen_wall: event.observed_at,
                        node_id: event.node_id.clone(),
                        request_count: 1,
                    },
                );
            }
        }

        if user.violator_since.is_some() {
            user.violation_ips.insert(key_ip);
        }

        user.request_count += 1;
        if blocked {
            user.blocked_count += 1;
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
        }
        if user.first_seen.is_none() {
            user.first_seen = Some(event.observed_at);
        }
        user.last_seen = Some(event.observed_at);

        if user.recent_requests.len() >= RECENT_REQUESTS_CAP {
            user.recent_requests.pop_front();
        }
        user.recent_requests.push_back(RequestLog {
            observed_at: event.observed_at,
            source_ip: event.source_ip,
            protocol: event.protocol,
            destination: event.destination,
            dest_port: event.dest_port,
            action: event.action,
            node_id: event.node_id,
        });

        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Distinct IPs for `email` within `window` of `now`.
    pub fn recent_ips(&self, email: &str, window: Duration, now: Instant) -> HashSet<IpAddr> {
        self.users
            .read()
            .get(email)
            .map(|u| u.recent_ips(window, now))
            .unwrap_or_default()
    }

    /// Evict stale observations and empty clean users.
    pub fn prune(&self, now: Instant) -> usize {
        let retention = self.cfg.retention;
        let mut users = self.users.write();
        for user in users.values_mut() {
            user.prune_observations(retention, now);
        }
        let before = users.len();
        users.retain(|_, user| !user.evictable());
        before - users.len()
    }

    /// IPs used by more than one email within the retention window.
    pub fn shared_ips(&self, now: Instant) -> BTreeMap<IpAddr, BTreeSet<String>> {
        let retention = self.cfg.retention;
        let users = self.users.read();
        let mut by_ip: BTreeMap<IpAddr, BTreeSet<String>> = BTreeMap::new();
        for user in users.values() {
            for ip in user.recent_ips(retention, now) {
                by_ip.entry(ip).or_default().insert(user.email.clone());
            }
        }
        by_ip.retain(|_, emails| emails.len() > 1);
        by_ip
    }

    /// Run `f` against the user map under the read lock. `f` must not
    /// block; the guard is released when it returns.
    pub fn with_users<R>(&self, f: impl FnOnce(&HashMap<String, UserState>) -> R) -> R {
        f(&self.users.read())
    }

    /// Run `f` against the user map under the write lock. Classifier only.
    pub fn with_users_mut<R>(&self, f: impl FnOnce(&mut HashMap<String, UserState>) -> R) -> R {
        f(&mut self.users.write())
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }
}

/// Collapse an address to its subnet network address: /24 for IPv4, /64
/// for IPv6.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => Ipv4Network::new(v4, 24)
            .map(|net| IpAddr::V4(net.network()))
            .unwrap_or(ip),
        IpAddr::V6(v6) => Ipv6Network::new(v6, 64)
            .map(|net| IpAddr::V6(net.network()))
            .unwrap_or(ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(email: &str, ip: &str, action: &str) -> Event {
        Event {
            node_id: "node-1".to_string(),
            observed_at: Utc::now(),
            source_ip: ip.parse().unwrap(),
            protocol: "tcp".to_string(),
            destination: "example.com".to_string(),
            dest_port: 443,
            action: action.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn test_record_and_recent_ips() {
        let tracker = UserTracker::new(TrackerConfig::default());
        let t0 = Instant::now();

        tracker.record(event("alice@x", "10.0.0.1", "direct"), t0);
        tracker.record(event("alice@x", "10.0.0.2", "direct"), t0 + Duration::from_secs(1));

        let ips = tracker.recent_ips("alice@x", Duration::from_secs(2), t0 + Duration::from_secs(2));
        assert_eq!(ips.len(), 2);

        // Outside the 2 s window only the later IP remains.
        let ips = tracker.recent_ips("alice@x", Duration::from_secs(2), t0 + Duration::from_millis(2500));
        assert_eq!(ips.len(), 1);
        assert!(ips.contains(&"10.0.0.2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_zero_window_counts_exact_instant_only() {
        let tracker = UserTracker::new(TrackerConfig::default());
        let t0 = Instant::now();
        tracker.record(event("a@x", "10.0.0.1", "direct"), t0);

        assert_eq!(tracker.recent_ips("a@x", Duration::ZERO, t0).len(), 1);
        assert_eq!(
            tracker
                .recent_ips("a@x", Duration::ZERO, t0 + Duration::from_nanos(1))
                .len(),
            0
        );
    }

    #[test]
    fn test_ring_is_bounded() {
        let tracker = UserTracker::new(TrackerConfig::default());
        let t0 = Instant::now();
        for i in 0..RECENT_REQUESTS_CAP + 50 {
            let mut ev = event("a@x", "10.0.0.1", "direct");
            ev.destination = format!("host-{i}");
            tracker.record(ev, t0);
        }
        tracker.with_users(|users| {
            let user = users.get("a@x").unwrap();
            assert_eq!(user.recent_requests.len(), RECENT_REQUESTS_CAP);
            // Oldest entries dropped first.
            assert_eq!(user.recent_requests.front().unwrap().destination, "host-50");
        });
    }

    #[test]
    fn test_prune_evicts_stale_clean_users() {
        let tracker = UserTracker::new(TrackerConfig {
            retention: Duration::from_secs(60),
            subnet_grouping: false,
        });
        let t0 = Instant::now();
        tracker.record(event("a@x", "10.0.0.1", "direct"), t0);

        assert_eq!(tracker.prune(t0 + Duration::from_secs(30)), 0);
        assert_eq!(tracker.user_count(), 1);

        assert_eq!(tracker.prune(t0 + Duration::from_secs(61)), 1);
        assert_eq!(tracker.user_count(), 0);
    }

    #[test]
    fn test_prune_retains_banlisted_users() {
        let tracker = UserTracker::new(TrackerConfig {
            retention: Duration::from_secs(60),
            subnet_grouping: false,
        });
        let t0 = Instant::now();
        tracker.record(event("a@x", "10.0.0.1", "direct"), t0);
        tracker.with_users_mut(|users| {
            users.get_mut("a@x").unwrap().banlisted_since = Some(Utc::now());
        });

        tracker.prune(t0 + Duration::from_secs(3600));
        assert_eq!(tracker.user_count(), 1);
        tracker.with_users(|users| {
            assert!(users.get("a@x").unwrap().observations.is_empty());
        });
    }

    #[test]
    fn test_shared_ips() {
        let tracker = UserTracker::new(TrackerConfig::default());
        let t0 = Instant::now();
        tracker.record(event("alice@x", "10.0.0.9", "direct"), t0);
        tracker.record(event("bob@x", "10.0.0.9", "direct"), t0);
        tracker.record(event("bob@x", "10.0.0.7", "direct"), t0);

        let shared = tracker.shared_ips(t0 + Duration::from_secs(1));
        assert_eq!(shared.len(), 1);
        let emails = shared.get(&"10.0.0.9".parse::<IpAddr>().unwrap()).unwrap();
        assert!(emails.contains("alice@x") && emails.contains("bob@x"));
    }

    #[test]
    fn test_subnet_grouping_collapses_neighbors() {
        let tracker = UserTracker::new(TrackerConfig {
            retention: Duration::from_secs(3600),
            subnet_grouping: true,
        });
        let t0 = Instant::now();
        tracker.record(event("a@x", "79.137.136.214", "direct"), t0);
        tracker.record(event("a@x", "79.137.136.215", "direct"), t0);
        tracker.record(event("a@x", "8.8.8.8", "direct"), t0);

        let ips = tracker.recent_ips("a@x", Duration::from_secs(2), t0);
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&"79.137.136.0".parse::<IpAddr>().unwrap()));

        // The ring keeps the raw addresses.
        tracker.with_users(|users| {
            let user = users.get("a@x").unwrap();
            assert!(user
                .recent_requests
                .iter()
                .any(|r| r.source_ip == "79.137.136.215".parse::<IpAddr>().unwrap()));
        });
    }

    #[test]
    fn test_canonical_ip_v6() {
        let ip: IpAddr = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        assert_eq!(canonical_ip(ip), "2001:db8:1:2::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_blocked_counter() {
        let tracker = UserTracker::new(TrackerConfig::default());
        let t0 = Instant::now();
        tracker.record(event("a@x", "10.0.0.1", "blocked"), t0);
        tracker.record(event("a@x", "10.0.0.1", "direct"), t0);
        assert_eq!(tracker.total_blocked(), 1);
        assert_eq!(tracker.total_requests(), 2);
        tracker.with_users(|users| {
            assert_eq!(users.get("a@x").unwrap().blocked_count, 1);
        });
    }
}
