//! Staged violation classifier.
//!
//! Runs on a fixed tick. For every tracked user it counts distinct source
//! IPs inside the concurrent window, compares against the panel limit and
//! walks the staged machine: overflow ticks accumulate as triggers, enough
//! triggers inside the trigger period promote to violator, a violator held
//! continuously past the banlist threshold is promoted to the banlist and
//! written through to the Persist sink. Any tick at or under the limit
//! (after the configured hysteresis) clears the run; banlist membership is
//! sticky until the admin clears it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::models::{BanlistRecord, DomainEvent};
use crate::panel::RosterCache;
use crate::sinks::Sinks;
use crate::tracker::UserTracker;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub concurrent_window: Duration,
    pub trigger_period: Duration,
    pub trigger_count: usize,
    pub banlist_threshold: Duration,
    /// Consecutive sub-limit ticks required to clear a violation run.
    pub clear_hysteresis_ticks: u32,
    /// Minimum spacing of repeat banlist refreshes and notifications.
    pub notify_interval: Duration,
    pub whitelist: HashSet<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            concurrent_window: Duration::from_secs(2),
            trigger_period: Duration::from_secs(30),
            trigger_count: 5,
            banlist_threshold: Duration::from_secs(300),
            clear_hysteresis_ticks: 1,
            notify_interval: Duration::from_secs(300),
            whitelist: HashSet::new(),
        }
    }
}

/// A banlist write queued while the user map lock was held.
struct PendingUpsert {
    email: String,
    at: DateTime<Utc>,
    reason: String,
    new: bool,
}

pub struct Classifier {
    cfg: ClassifierConfig,
    tracker: Arc<UserTracker>,
    roster: Arc<RosterCache>,
    sinks: Sinks,
    /// In-memory banlist, hydrated from the Persist sink at startup.
    banlist: RwLock<HashMap<String, BanlistRecord>>,
    /// Last banlist write/notification per user, for rate limiting.
    last_ban_touch: Mutex<HashMap<String, Instant>>,
    persist_failures: AtomicU64,
}

impl Classifier {
    pub fn new(
        cfg: ClassifierConfig,
        tracker: Arc<UserTracker>,
        roster: Arc<RosterCache>,
        sinks: Sinks,
    ) -> Self {
        Self {
            cfg,
            tracker,
            roster,
            sinks,
            banlist: RwLock::new(HashMap::new()),
            last_ban_touch: Mutex::new(HashMap::new()),
            persist_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.cfg
    }

    /// Load the persisted banlist. Called once at startup.
    pub fn hydrate(&self) -> anyhow::Result<usize> {
        let records = self.sinks.store.load_all()?;
        let count = records.len();
        let mut banlist = self.banlist.write();
        for record in records {
            banlist.insert(record.email.clone(), record);
        }
        if count > 0 {
            info!(count, "hydrated banlist from store");
        }
        Ok(count)
    }

    pub fn banlist_snapshot(&self) -> Vec<BanlistRecord> {
        let mut records: Vec<_> = self.banlist.read().values().cloned().collect();
        records.sort_by(|a, b| a.email.cmp(&b.email));
        records
    }

    pub fn banlist_len(&self) -> usize {
        self.banlist.read().len()
    }

    pub fn is_banlisted(&self, email: &str) -> bool {
        self.banlist.read().contains_key(email)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// One classification pass. Returns the emitted domain events.
    pub async fn tick(&self, now: Instant, wall: DateTime<Utc>) -> Vec<DomainEvent> {
        let roster = self.roster.snapshot();
        let mut events: Vec<DomainEvent> = Vec::new();
        let mut upserts: Vec<PendingUpsert> = Vec::new();

        self.tracker.with_users_mut(|users| {
            let banlist = self.banlist.read();
            let mut touched = self.last_ban_touch.lock();

            for (email, user) in users.iter_mut() {
                // Restore stickiness for users hydrated from the store.
                if user.banlisted_since.is_none() {
                    if let Some(record) = banlist.get(email) {
                        user.banlisted_since = Some(record.first_banlisted_at);
                    }
                }

                // Triggers only live inside the trigger period.
                user.trigger_times
                    .retain(|t| now.duration_since(*t) < self.cfg.trigger_period);

                let entry = roster.users.get(email);
                let whitelisted = self.cfg.whitelist.contains(email);
                let unlimited = matches!(entry, Some(e) if e.device_limit == 0);

                if whitelisted || unlimited {
                    user.trigger_times.clear();
                    user.clean_ticks = 0;
                    user.violation_ips.clear();
                    if user.violator_since.take().is_some() {
                        user.violator_since_wall = None;
                        if user.banlisted_since.is_none() {
                            events.push(DomainEvent::ViolatorCleared {
                                email: email.clone(),
                                at: wall,
                            });
                        }
                    }
                    continue;
                }

                let concurrent = user.recent_ips(self.cfg.concurrent_window, now);
                // Unknown users count as unlimited until the roster learns
                // them; the next tick picks up any limit change.
                let over = match entry {
                    Some(e) => concurrent.len() > e.device_limit as usize,
                    None => false,
                };

                if over {
                    let limit = entry.map(|e| e.device_limit).unwrap_or(0);
                    user.clean_ticks = 0;
                    user.trigger_times.push(now);

                    if user.trigger_times.len() >= self.cfg.trigger_count {
                        if user.violator_since.is_none() {
                            user.violator_since = Some(now);
                            user.violator_since_wall = Some(wall);
                            user.violation_ips = concurrent.clone();
                            events.push(DomainEvent::ViolatorOnset {
                                email: email.clone(),
                                observed_ips: sorted(&concurrent),
                                limit,
                                at: wall,
                            });
                            info!(
                                email = %email,
                                ips = concurrent.len(),
                                limit,
                                "violator onset"
                            );
                        } else {
                            user.violation_ips.extend(concurrent.iter().copied());
                        }
                    }

                    if let Some(since) = user.violator_since {
                        if now.duration_since(since) >= self.cfg.banlist_threshold {
                            let duration = now.duration_since(since).as_secs();
                            let reason = format!(
                                "{} IPs over limit {} for {}s",
                                user.violation_ips.len().max(concurrent.len()),
                                limit,
                                duration
                            );

                            if user.banlisted_since.is_none() {
                                user.banlisted_since = Some(wall);
                                touched.insert(email.clone(), now);
                                events.push(DomainEvent::BanlistAdded {
                                    email: email.clone(),
                                    at: wall,
                                });
                                upserts.push(PendingUpsert {
                                    email: email.clone(),
                                    at: wall,
                                    reason,
                                    new: true,
                                });
                                warn!(email = %email, limit, "banlisted");
                            } else {
                                // Ongoing run: refresh last-seen and nag, but
                                // at most once per notify interval.
                                let due = touched.get(email).map_or(true, |t| {
                                    now.duration_since(*t) >= self.cfg.notify_interval
                                });
                                if due {
                                    touched.insert(email.clone(), now);
                                    events.push(DomainEvent::ViolationContinues {
                                        email: email.clone(),
                                        observed_ips: sorted(&user.violation_ips),
                                        limit,
                                        at: wall,
                                    });
                                    upserts.push(PendingUpsert {
                                        email: email.clone(),
                                        at: wall,
                                        reason,
                                        new: false,
                                    });
                                }
                            }
                        }
                    }
                } else {
                    user.clean_ticks = user.clean_ticks.saturating_add(1);
                    if user.clean_ticks >= self.cfg.clear_hysteresis_ticks {
                        user.trigger_times.clear();
                        if user.violator_since.take().is_some() {
                            user.violator_since_wall = None;
                            user.violation_ips.clear();
                            if user.banlisted_since.is_none() {
                                events.push(DomainEvent::ViolatorCleared {
                                    email: email.clone(),
                                    at: wall,
                                });
                                info!(email = %email, "violation run cleared");
                            }
                        }
                    }
                }
            }
        });

        // Lock released; write through and fan out.
        for upsert in &upserts {
            {
                let mut banlist = self.banlist.write();
                banlist
                    .entry(upsert.email.clone())
                    .and_modify(|record| {
                        record.last_seen_banlisted_at = upsert.at;
                        record.reason = upsert.reason.clone();
                    })
                    .or_insert_with(|| BanlistRecord {
                        email: upsert.email.clone(),
                        first_banlisted_at: upsert.at,
                        last_seen_banlisted_at: upsert.at,
                        reason: upsert.reason.clone(),
                    });
            }
            self.persist_with_retry(&upsert.email, upsert.at, &upsert.reason, upsert.new)
                .await;
        }

        for event in &events {
            self.sinks.notifier.send(event).await;
        }

        events
    }

    /// Admin path: empty the banlist, reset user stickiness and emit one
    /// `BanlistCleared` per former member.
    pub async fn clear_banlist(&self, wall: DateTime<Utc>) -> Vec<String> {
        let emails: Vec<String> = {
            let mut banlist = self.banlist.write();
            let emails = banlist.keys().cloned().collect();
            banlist.clear();
            emails
        };
        self.last_ban_touch.lock().clear();

        self.tracker.with_users_mut(|users| {
            for user in users.values_mut() {
                user.banlisted_since = None;
            }
        });

        match self.sinks.store.clear() {
            Ok(rows) => info!(rows, emails = emails.len(), "banlist cleared"),
            Err(e) => {
                error!(error = %e, "failed to clear persisted banlist");
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        for email in &emails {
            self.sinks
                .notifier
                .send(&DomainEvent::BanlistCleared {
                    email: email.clone(),
                    at: wall,
                })
                .await;
        }

        emails
    }

    /// Write one banlist row, retrying with exponential backoff. A final
    /// failure surfaces as a counter; the in-memory promotion stands.
    async fn persist_with_retry(&self, email: &str, at: DateTime<Utc>, reason: &str, new: bool) {
        let mut delay = PERSIST_BACKOFF;
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.sinks.store.upsert(email, at, reason) {
                Ok(()) => return,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        email,
                        attempt,
                        error = %e,
                        "banlist persist failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(email, new, error = %e, "banlist persist failed permanently");
                    self.persist_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

fn sorted(ips: &HashSet<IpAddr>) -> Vec<IpAddr> {
    let mut out: Vec<IpAddr> = ips.iter().copied().collect();
    out.sort();
    out
}

/// Tick worker: drives [`Classifier::tick`] on the configured interval and
/// prunes the tracker once per retention sweep.
pub async fn tick_loop(
    classifier: Arc<Classifier>,
    tracker: Arc<UserTracker>,
    tick: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    const PRUNE_EVERY: u32 = 30;
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                classifier.tick(Instant::now(), Utc::now()).await;
                ticks = ticks.wrapping_add(1);
                if ticks % PRUNE_EVERY == 0 {
                    let evicted = tracker.prune(Instant::now());
                    if evicted > 0 {
                        tracing::debug!(evicted, "pruned idle users");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
