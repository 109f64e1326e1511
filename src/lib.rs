pub mod api;
pub mod classifier;
pub mod config;
pub mod ingest;
pub mod models;
pub mod panel;
pub mod parser;
pub mod sinks;
pub mod tracker;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use api::AppState;
use classifier::{Classifier, ClassifierConfig};
use config::Config;
use ingest::{IngestStats, NodeRegistry};
use panel::{PanelClient, RosterCache, RosterFetcher};
use sinks::Sinks;
use tracker::{TrackerConfig, UserTracker};

/// The assembled detection engine.
///
/// Owns every subsystem and runs the worker set: the ingest accept loop,
/// the classifier tick, the roster refresh and the query API. Shutdown is
/// cooperative through a watch flag flipped on SIGINT/SIGTERM.
pub struct Banwatch {
    config: Arc<Config>,
    tracker: Arc<UserTracker>,
    roster: Arc<RosterCache>,
    classifier: Arc<Classifier>,
    sinks: Sinks,
    nodes: Arc<NodeRegistry>,
    ingest_stats: Arc<IngestStats>,
    fetcher: Arc<dyn RosterFetcher>,
}

impl Banwatch {
    pub fn new(config: Config) -> Result<Self> {
        let fetcher: Arc<dyn RosterFetcher> =
            Arc::new(PanelClient::new(&config.panel_url, &config.panel_token)?);
        Self::with_fetcher(config, fetcher)
    }

    /// Wire the engine with a custom roster fetcher (tests, alternate panels).
    pub fn with_fetcher(config: Config, fetcher: Arc<dyn RosterFetcher>) -> Result<Self> {
        if config.api_token.is_empty() {
            warn!("API_TOKEN is empty; the query API runs without auth");
        }

        let sinks = Sinks::from_config(&config)?;
        let tracker = Arc::new(UserTracker::new(TrackerConfig {
            retention: config.retention(),
            subnet_grouping: config.subnet_grouping,
        }));
        let roster = Arc::new(RosterCache::new());
        let classifier = Arc::new(Classifier::new(
            ClassifierConfig {
                concurrent_window: config.concurrent_window(),
                trigger_period: config.trigger_period(),
                trigger_count: config.trigger_count,
                banlist_threshold: config.banlist_threshold(),
                clear_hysteresis_ticks: config.clear_hysteresis_ticks,
                notify_interval: config.notify_interval(),
                whitelist: config.whitelist.clone(),
            },
            tracker.clone(),
            roster.clone(),
            sinks.clone(),
        ));

        let hydrated = classifier.hydrate()?;
        if hydrated > 0 {
            info!(hydrated, "banlist loaded from persistence");
        }

        Ok(Self {
            config: Arc::new(config),
            tracker,
            roster,
            classifier,
            sinks,
            nodes: Arc::new(NodeRegistry::new()),
            ingest_stats: Arc::new(IngestStats::new()),
            fetcher,
        })
    }

    /// Run all workers until a termination signal arrives.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            ingest = %self.config.ingest_bind,
            api = %self.config.api_bind,
            concurrent_window = self.config.concurrent_window_secs,
            trigger_period = self.config.trigger_period_secs,
            trigger_count = self.config.trigger_count,
            banlist_threshold = self.config.banlist_threshold_secs,
            subnet_grouping = self.config.subnet_grouping,
            "starting"
        );
        if !self.config.whitelist.is_empty() {
            info!(whitelisted = self.config.whitelist.len(), "whitelist active");
        }

        // Bind both listeners before spawning anything: an unusable bind is
        // a fatal configuration error, not a dead background worker.
        let ingest_listener = ingest::bind(self.config.ingest_bind).await?;
        let api_listener = api::bind(self.config.api_bind).await?;

        let roster_worker = tokio::spawn(panel::refresh_loop(
            self.roster.clone(),
            self.fetcher.clone(),
            self.config.panel_reload(),
            shutdown_rx.clone(),
        ));

        let classifier_worker = tokio::spawn(classifier::tick_loop(
            self.classifier.clone(),
            self.tracker.clone(),
            self.config.classifier_tick(),
            shutdown_rx.clone(),
        ));

        let mut ingest_worker = tokio::spawn(ingest::run(
            ingest_listener,
            self.tracker.clone(),
            self.nodes.clone(),
            self.ingest_stats.clone(),
            shutdown_rx.clone(),
        ));

        let state = Arc::new(AppState {
            config: self.config.clone(),
            tracker: self.tracker.clone(),
            roster: self.roster.clone(),
            classifier: self.classifier.clone(),
            nodes: self.nodes.clone(),
            ingest_stats: self.ingest_stats.clone(),
            sinks: self.sinks.clone(),
        });
        let mut api_worker = tokio::spawn(api::serve(state, api_listener, shutdown_rx));

        // Run until a signal arrives; a server worker that stops on its own
        // is a failure and must take the process down with it.
        let mut ingest_done = false;
        let mut api_done = false;
        let mut result: Result<()> = Ok(());

        tokio::select! {
            _ = wait_for_signal() => {
                info!("shutdown signal received, draining");
            }
            res = &mut ingest_worker => {
                ingest_done = true;
                result = Err(worker_failure("ingest server", res));
            }
            res = &mut api_worker => {
                api_done = true;
                result = Err(worker_failure("query API", res));
            }
        }

        let _ = shutdown_tx.send(true);

        let _ = roster_worker.await;
        let _ = classifier_worker.await;
        if !ingest_done {
            if let Ok(Err(e)) = ingest_worker.await {
                warn!(error = %e, "ingest worker exited with error");
            }
        }
        if !api_done {
            if let Ok(Err(e)) = api_worker.await {
                warn!(error = %e, "query API exited with error");
            }
        }

        if result.is_ok() {
            info!("shutdown complete");
        }
        result
    }
}

fn worker_failure(name: &str, res: Result<Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match res {
        Ok(Ok(())) => anyhow::anyhow!("{name} exited unexpectedly"),
        Ok(Err(e)) => e.context(format!("{name} failed")),
        Err(e) => anyhow::anyhow!("{name} panicked: {e}"),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
