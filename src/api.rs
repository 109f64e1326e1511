//! Read-mostly HTTP query surface.
//!
//! Every endpoint sits behind bearer-token auth against the configured
//! shared secret and a per-request deadline. Views are assembled from one
//! read-lock acquisition over the user map plus the current roster and
//! banlist snapshots, so each response is internally consistent.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::config::Config;
use crate::ingest::{IngestStats, NodeRegistry};
use crate::models::{BanlistRecord, RequestLog, Stage};
use crate::panel::RosterCache;
use crate::sinks::Sinks;
use crate::tracker::UserTracker;

const HANDLER_DEADLINE: Duration = Duration::from_secs(5);
/// Cap on per-view ISP lookups, matching the original batch limits.
const VIOLATOR_ISP_LOOKUPS: usize = 20;
const DETAIL_ISP_LOOKUPS: usize = 10;

/// Shared state behind every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub tracker: Arc<UserTracker>,
    pub roster: Arc<RosterCache>,
    pub classifier: Arc<Classifier>,
    pub nodes: Arc<NodeRegistry>,
    pub ingest_stats: Arc<IngestStats>,
    pub sinks: Sinks,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/stats", get(stats))
        .route("/api/users", get(users))
        .route("/api/violators", get(violators))
        .route("/api/banlist", get(banlist))
        .route("/api/banlist/clear", post(clear_banlist))
        .route("/api/user/{email}", get(user_detail))
        .route("/api/nodes", get(nodes))
        .route("/api/shared_ips", get(shared_ips))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .layer(middleware::from_fn(deadline))
        .with_state(state)
}

/// Bind the query API listener. Separate from [`serve`] so an unusable
/// address fails startup instead of a background worker.
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind query API on {addr}"))
}

/// Serve over a bound listener until the shutdown flag flips.
pub async fn serve(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "query API listening");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("query API server failed")
}

async fn auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let expected = &state.config.api_token;
    if expected.is_empty() {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response(),
    }
}

async fn deadline(req: Request, next: Next) -> Response {
    match tokio::time::timeout(HANDLER_DEADLINE, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => {
            warn!("request exceeded handler deadline");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "deadline exceeded"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    total_users: usize,
    total_requests: u64,
    total_blocked: u64,
    rejected_lines: u64,
    connected_nodes: Vec<String>,
    violators_count: usize,
    banlist_count: usize,
    panel_loaded: bool,
    panel_users_count: usize,
    persist_failures: u64,
    concurrent_window: u64,
    trigger_period: u64,
    trigger_count: usize,
    banlist_threshold: u64,
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let violators_count = state.tracker.with_users(|users| {
        users
            .values()
            .filter(|u| u.violator_since.is_some() || u.banlisted_since.is_some())
            .count()
    });

    Json(StatsResponse {
        total_users: state.tracker.user_count(),
        total_requests: state.tracker.total_requests(),
        total_blocked: state.tracker.total_blocked(),
        rejected_lines: state.ingest_stats.rejected_total(),
        connected_nodes: state.nodes.connected_nodes(),
        violators_count,
        banlist_count: state.classifier.banlist_len(),
        panel_loaded: state.roster.is_loaded(),
        panel_users_count: state.roster.snapshot().users.len(),
        persist_failures: state.classifier.persist_failures(),
        concurrent_window: state.config.concurrent_window_secs,
        trigger_period: state.config.trigger_period_secs,
        trigger_count: state.config.trigger_count,
        banlist_threshold: state.config.banlist_threshold_secs,
    })
}

#[derive(Debug, Serialize)]
struct UserSummary {
    email: String,
    device_limit: Option<u32>,
    recent_ip_count: usize,
    ips: Vec<IpAddr>,
    stage: Stage,
    request_count: u64,
    blocked_count: u64,
    trigger_count: usize,
    last_seen: Option<DateTime<Utc>>,
}

async fn users(State(state): State<Arc<AppState>>) -> Json<Vec<UserSummary>> {
    let roster = state.roster.snapshot();
    let window = state.config.concurrent_window();
    let now = Instant::now();

    let mut summaries = state.tracker.with_users(|users| {
        users
            .values()
            .map(|user| {
                let limit = roster.users.get(&user.email).map(|e| e.device_limit);
                let ips = user.recent_ips(window, now);
                let mut ips: Vec<IpAddr> = ips.into_iter().collect();
                ips.sort();
                UserSummary {
                    email: user.email.clone(),
                    device_limit: limit,
                    recent_ip_count: ips.len(),
                    stage: user.stage(ips.len(), limit),
                    ips,
                    request_count: user.request_count,
                    blocked_count: user.blocked_count,
                    trigger_count: user.trigger_times.len(),
                    last_seen: user.last_seen,
                }
            })
            .collect::<Vec<_>>()
    });

    summaries.sort_by(|a, b| {
        b.recent_ip_count
            .cmp(&a.recent_ip_count)
            .then_with(|| a.email.cmp(&b.email))
    });
    Json(summaries)
}

#[derive(Debug, Serialize)]
struct ViolatorView {
    email: String,
    stage: Stage,
    device_limit: Option<u32>,
    concurrent_ip_count: usize,
    concurrent_ips: Vec<IpAddr>,
    violation_ip_count: usize,
    violation_ips: Vec<IpAddr>,
    nodes: Vec<String>,
    trigger_count: usize,
    time_in_violation_secs: u64,
    time_to_ban_secs: u64,
    telegram_id: Option<String>,
    description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    ip_providers: BTreeMap<IpAddr, String>,
}

async fn violators(State(state): State<Arc<AppState>>) -> Json<Vec<ViolatorView>> {
    let roster = state.roster.snapshot();
    let window = state.config.concurrent_window();
    let threshold = state.config.banlist_threshold();
    let now = Instant::now();

    let mut views = state.tracker.with_users(|users| {
        users
            .values()
            .filter(|u| u.violator_since.is_some() || u.banlisted_since.is_some())
            .map(|user| {
                let entry = roster.users.get(&user.email);
                let concurrent = user.recent_ips(window, now);
                let mut concurrent_ips: Vec<IpAddr> = concurrent.into_iter().collect();
                concurrent_ips.sort();

                let mut violation_ips: Vec<IpAddr> = user.violation_ips.iter().copied().collect();
                violation_ips.sort();

                let mut nodes: Vec<String> = user
                    .recent_requests
                    .iter()
                    .map(|r| r.node_id.clone())
                    .collect();
                nodes.sort();
                nodes.dedup();

                let in_violation = user
                    .violator_since
                    .map(|since| now.duration_since(since).as_secs())
                    .unwrap_or(0);
                let to_ban = if user.banlisted_since.is_some() {
                    0
                } else {
                    threshold.as_secs().saturating_sub(in_violation)
                };

                ViolatorView {
                    email: user.email.clone(),
                    stage: user.stage(concurrent_ips.len(), entry.map(|e| e.device_limit)),
                    device_limit: entry.map(|e| e.device_limit),
                    concurrent_ip_count: concurrent_ips.len(),
                    concurrent_ips,
                    violation_ip_count: violation_ips.len(),
                    violation_ips,
                    nodes,
                    trigger_count: user.trigger_times.len(),
                    time_in_violation_secs: in_violation,
                    time_to_ban_secs: to_ban,
                    telegram_id: entry.and_then(|e| e.telegram_id.clone()),
                    description: entry.and_then(|e| e.description.clone()),
                    ip_providers: BTreeMap::new(),
                }
            })
            .collect::<Vec<_>>()
    });

    views.sort_by(|a, b| b.time_in_violation_secs.cmp(&a.time_in_violation_secs));

    // Enrichment happens outside the lock and is best effort.
    let mut looked_up = 0usize;
    for view in views.iter_mut() {
        for ip in view.violation_ips.clone() {
            if looked_up >= VIOLATOR_ISP_LOOKUPS {
                break;
            }
            looked_up += 1;
            if let Some(isp) = state.sinks.resolver.lookup_isp(ip).await {
                view.ip_providers.insert(ip, isp);
            }
        }
    }

    Json(views)
}

async fn banlist(State(state): State<Arc<AppState>>) -> Json<Vec<BanlistRecord>> {
    Json(state.classifier.banlist_snapshot())
}

async fn clear_banlist(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let emails = state.classifier.clear_banlist(Utc::now()).await;
    info!(cleared = emails.len(), "banlist cleared via API");
    Json(json!({ "cleared": emails.len(), "emails": emails }))
}

#[derive(Debug, Serialize)]
struct UserDetail {
    email: String,
    stage: Stage,
    device_limit: Option<u32>,
    recent_ip_count: usize,
    concurrent_ips: Vec<IpAddr>,
    ip_request_counts: BTreeMap<IpAddr, u64>,
    all_ips: Vec<IpAddr>,
    violation_ips: Vec<IpAddr>,
    trigger_count: usize,
    trigger_threshold: usize,
    time_in_violation_secs: u64,
    is_banlisted: bool,
    banlisted_since: Option<DateTime<Utc>>,
    violator_since: Option<DateTime<Utc>>,
    request_count: u64,
    blocked_count: u64,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    telegram_id: Option<String>,
    description: Option<String>,
    username: Option<String>,
    recent_requests: Vec<RequestLog>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    ip_providers: BTreeMap<IpAddr, String>,
}

async fn user_detail(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Result<Json<UserDetail>, StatusCode> {
    let roster = state.roster.snapshot();
    let window = state.config.concurrent_window();
    let now = Instant::now();

    let detail = state.tracker.with_users(|users| {
        let user = users.get(&email)?;
        let entry = roster.users.get(&email);

        let mut concurrent_ips: Vec<IpAddr> = user.recent_ips(window, now).into_iter().collect();
        concurrent_ips.sort();
        let mut all_ips: Vec<IpAddr> = user.observations.keys().copied().collect();
        all_ips.sort();
        let mut violation_ips: Vec<IpAddr> = user.violation_ips.iter().copied().collect();
        violation_ips.sort();

        Some(UserDetail {
            email: user.email.clone(),
            stage: user.stage(concurrent_ips.len(), entry.map(|e| e.device_limit)),
            device_limit: entry.map(|e| e.device_limit),
            recent_ip_count: concurrent_ips.len(),
            ip_request_counts: user.recent_ip_counts(window, now),
            concurrent_ips,
            all_ips,
            violation_ips,
            trigger_count: user.trigger_times.len(),
            trigger_threshold: state.config.trigger_count,
            time_in_violation_secs: user
                .violator_since
                .map(|since| now.duration_since(since).as_secs())
                .unwrap_or(0),
            is_banlisted: user.banlisted_since.is_some(),
            banlisted_since: user.banlisted_since,
            violator_since: user.violator_since_wall,
            request_count: user.request_count,
            blocked_count: user.blocked_count,
            first_seen: user.first_seen,
            last_seen: user.last_seen,
            telegram_id: entry.and_then(|e| e.telegram_id.clone()),
            description: entry.and_then(|e| e.description.clone()),
            username: entry.and_then(|e| e.username.clone()),
            recent_requests: user.recent_requests.iter().cloned().collect(),
            ip_providers: BTreeMap::new(),
        })
    });

    let Some(mut detail) = detail else {
        return Err(StatusCode::NOT_FOUND);
    };

    for ip in detail.all_ips.iter().take(DETAIL_ISP_LOOKUPS).copied().collect::<Vec<_>>() {
        if let Some(isp) = state.sinks.resolver.lookup_isp(ip).await {
            detail.ip_providers.insert(ip, isp);
        }
    }

    Ok(Json(detail))
}

async fn nodes(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.nodes.connected_nodes())
}

#[derive(Debug, Serialize)]
struct SharedIpView {
    ip: IpAddr,
    emails: Vec<String>,
}

async fn shared_ips(State(state): State<Arc<AppState>>) -> Json<Vec<SharedIpView>> {
    let shared = state.tracker.shared_ips(Instant::now());
    Json(
        shared
            .into_iter()
            .map(|(ip, emails)| SharedIpView {
                ip,
                emails: emails.into_iter().collect(),
            })
            .collect(),
    )
}
