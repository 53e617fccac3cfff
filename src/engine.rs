// src/engine.rs
//! # Poll Engine
//! The scheduling engine that drives channel polling. One engine instance
//! runs in one of two modes: **continuous** wraps the rotation forever and
//! also keeps a listing-resync loop and a health-report loop alive;
//! **single-pass** visits every active channel exactly once, then fires the
//! digest completion hook and returns.
//!
//! Every source type gets its own loop task. Loops share the channel
//! directory behind a `Mutex` that is only ever held between suspension
//! points, so cursor moves and counter folds stay atomic with respect to the
//! other loops. Cancellation is cooperative through `CancellationToken`s:
//! one root token per run, one child token per source loop so a single
//! source can be restarted without touching its siblings.

use crate::channel::{ChannelRecord, PollOutcome, SourceType};
use crate::config::ConfigHandle;
use crate::digest::{Cadence, DigestScheduler};
use crate::directory::ChannelDirectory;
use crate::poller::PollerRegistry;
use crate::store::ChannelStore;
use crate::sync::DirectorySync;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("poll_visits_total", "Channel visits attempted.");
        describe_counter!("poll_failures_total", "Channel visits that failed.");
        describe_counter!("poll_items_total", "Items collected across all visits.");
        describe_gauge!("poll_channels_active", "Active channels per source type.");
    });
}

/// Operating policy of a [`PollEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Wrap the rotation forever; resync and health loops run alongside.
    Continuous,
    /// Visit each active channel once, publish the daily digest, stop.
    SinglePass,
}

impl PollMode {
    pub fn wraps(&self) -> bool {
        matches!(self, PollMode::Continuous)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollMode::Continuous => "continuous",
            PollMode::SinglePass => "single_pass",
        }
    }
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated counters for one source type.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub total_channels: usize,
    pub active_channels: usize,
    pub inactive_channels: usize,
    /// `success / (success + failure) * 100`, one decimal; 0 with no attempts.
    pub success_rate: f64,
    pub total_success: u64,
    pub total_failure: u64,
    pub total_items_collected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: PollMode,
    pub running: bool,
    pub finished: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<String>,
    pub sources: BTreeMap<SourceType, SourceStats>,
    pub active_tasks: Vec<TaskStatus>,
}

/// Uptime rendered as `HH:MM:SS`.
pub fn format_uptime(since: DateTime<Utc>) -> String {
    let total = Utc::now().signed_duration_since(since).num_seconds().max(0);
    let (hours, rem) = (total / 3600, total % 3600);
    format!("{:02}:{:02}:{:02}", hours, rem / 60, rem % 60)
}

struct SourceTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PollEngine {
    mode: PollMode,
    config: ConfigHandle,
    registry: PollerRegistry,
    store: Arc<dyn ChannelStore>,
    sync: Arc<DirectorySync>,
    directory: Mutex<ChannelDirectory>,
    /// Completion hook target (single-pass mode).
    digest: Option<Arc<DigestScheduler>>,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    cancel: Mutex<CancellationToken>,
    source_tasks: Mutex<HashMap<SourceType, SourceTask>>,
    aux_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollEngine {
    pub fn new(
        mode: PollMode,
        config: ConfigHandle,
        registry: PollerRegistry,
        store: Arc<dyn ChannelStore>,
        sync: Arc<DirectorySync>,
        digest: Option<Arc<DigestScheduler>>,
    ) -> Self {
        ensure_metrics_described();
        Self {
            mode,
            config,
            registry,
            store,
            sync,
            directory: Mutex::new(ChannelDirectory::new()),
            digest,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            source_tasks: Mutex::new(HashMap::new()),
            aux_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().expect("engine mutex poisoned")
    }

    /// Enabled sources that actually have a registered poller.
    fn enabled_sources(&self) -> Vec<SourceType> {
        let cfg = self.config.current();
        let mut sources = Vec::new();
        for source in &cfg.enabled_sources {
            if self.registry.get(*source).is_some() {
                sources.push(*source);
            } else {
                tracing::warn!(source = %source, "enabled source has no poller, skipping");
            }
        }
        sources
    }

    /// Forced listing sync + directory rebuild; logs per-source counts.
    pub async fn initialize(&self) {
        tracing::info!(mode = %self.mode, "initializing poll engine");
        let channels = self.sync.sync(true).await;
        for (source, list) in &channels {
            tracing::info!(source = %source, channels = list.len(), "loaded channels");
        }
        self.directory
            .lock()
            .expect("engine mutex poisoned")
            .refresh(channels);
    }

    /// Run the engine until it is stopped or — in single-pass mode — until
    /// every active channel has been visited once, at which point the daily
    /// digest is published through the retry path before returning.
    ///
    /// A second concurrent `run` on the same instance is refused.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(mode = %self.mode, "engine already running, start refused");
            return;
        }
        *self.started_at.lock().expect("engine mutex poisoned") = Some(Utc::now());
        let root = CancellationToken::new();
        *self.cancel.lock().expect("engine mutex poisoned") = root.clone();

        self.initialize().await;

        let sources = self.enabled_sources();
        for source in &sources {
            self.spawn_source_task(*source, &root);
        }
        tracing::info!(mode = %self.mode, sources = sources.len(), "poll engine started");

        if self.mode.wraps() {
            let mut aux = self.aux_tasks.lock().expect("engine mutex poisoned");
            let engine = Arc::clone(&self);
            let token = root.clone();
            aux.push(tokio::spawn(async move { engine.resync_loop(token).await }));
            let engine = Arc::clone(&self);
            let token = root.clone();
            aux.push(tokio::spawn(async move { engine.health_loop(token).await }));
        }

        // Supervising wait: poll once a second for stop or completion.
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            if self.mode == PollMode::SinglePass && self.pass_finished(&sources) {
                tracing::info!("single pass complete across all sources");
                if let Some(digest) = &self.digest {
                    digest.execute_with_retry(Cadence::Daily, false).await;
                }
                break;
            }
        }

        self.teardown();
        tracing::info!(mode = %self.mode, "poll engine stopped");
    }

    fn pass_finished(&self, sources: &[SourceType]) -> bool {
        self.directory
            .lock()
            .expect("engine mutex poisoned")
            .all_exhausted(sources)
    }

    /// Cancel every task spawned by this engine. Returns immediately; the
    /// loops observe the cancellation at their next suspension point. The
    /// running flag drops here, not in the loops, so a caller that aborts
    /// the supervising task still sees a stopped engine.
    pub fn stop(&self) {
        tracing::info!(mode = %self.mode, "stopping poll engine");
        self.cancel.lock().expect("engine mutex poisoned").cancel();
        self.running.store(false, Ordering::SeqCst);
        *self.started_at.lock().expect("engine mutex poisoned") = None;
    }

    fn teardown(&self) {
        let mut tasks = self.source_tasks.lock().expect("engine mutex poisoned");
        for (source, task) in tasks.drain() {
            task.token.cancel();
            task.handle.abort();
            tracing::debug!(source = %source, "source task cancelled");
        }
        for handle in self.aux_tasks.lock().expect("engine mutex poisoned").drain(..) {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn spawn_source_task(self: &Arc<Self>, source: SourceType, root: &CancellationToken) {
        let token = root.child_token();
        let engine = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { engine.source_loop(source, loop_token).await });
        self.source_tasks
            .lock()
            .expect("engine mutex poisoned")
            .insert(source, SourceTask { token, handle });
        tracing::info!(source = %source, "source task spawned");
    }

    /// Reset one source (cursor, failure counters, reactivation) and respawn
    /// only its loop. Other source loops are untouched.
    pub async fn restart_source(self: &Arc<Self>, source: SourceType) {
        tracing::info!(source = %source, "restarting source");

        let reset: Vec<ChannelRecord> = {
            let mut dir = self.directory.lock().expect("engine mutex poisoned");
            dir.reset_source(source);
            dir.iter()
                .filter(|(s, _)| **s == source)
                .flat_map(|(_, list)| list.iter().cloned())
                .collect()
        };
        for record in &reset {
            if let Err(e) = self.store.update_channel(record).await {
                tracing::warn!(source = %source, error = ?e, "persisting reset channel failed");
            }
        }

        if let Some(task) = self
            .source_tasks
            .lock()
            .expect("engine mutex poisoned")
            .remove(&source)
        {
            task.token.cancel();
            task.handle.abort();
        }
        if self.is_running() {
            let root = self.cancel.lock().expect("engine mutex poisoned").clone();
            self.spawn_source_task(source, &root);
        }
        tracing::info!(source = %source, "source restarted");
    }

    async fn source_loop(self: Arc<Self>, source: SourceType, token: CancellationToken) {
        tracing::info!(source = %source, "source loop started");
        let wrap = self.mode.wraps();

        loop {
            if token.is_cancelled() {
                break;
            }
            let cfg = self.config.current();

            // Majority-unhealthy guard: cool down instead of selecting.
            let unhealthy = self
                .directory
                .lock()
                .expect("engine mutex poisoned")
                .unhealthy(source, cfg.failure_threshold);
            if unhealthy {
                tracing::warn!(source = %source, "majority of channels failing, cooling down");
                if Self::pause(&token, cfg.unhealthy_cooldown()).await {
                    break;
                }
                continue;
            }

            let picked = self
                .directory
                .lock()
                .expect("engine mutex poisoned")
                .next_channel(source, wrap);

            let channel = match picked {
                Some(channel) => channel,
                None if wrap => {
                    // Nothing active right now; a resync may bring channels back.
                    if Self::pause(&token, cfg.poll_interval(source)).await {
                        break;
                    }
                    continue;
                }
                None => {
                    tracing::info!(source = %source, "all channels visited, pass done");
                    break;
                }
            };

            let outcome = self.poll_channel(source, &channel).await;
            counter!("poll_visits_total", "source" => source.as_str()).increment(1);
            if !outcome.success {
                counter!("poll_failures_total", "source" => source.as_str()).increment(1);
            }
            counter!("poll_items_total", "source" => source.as_str())
                .increment(outcome.item_count);

            let updated = self
                .directory
                .lock()
                .expect("engine mutex poisoned")
                .record_outcome(source, &channel.url, &outcome, cfg.failure_threshold);

            match updated {
                Some(record) => {
                    // Bookkeeping failure, not a channel failure: the fold is
                    // already in memory, so keep retrying this record's write
                    // after a backoff until it lands or the loop is cancelled.
                    while let Err(e) = self.store.update_channel(&record).await {
                        tracing::error!(source = %source, error = ?e, "persisting poll outcome failed");
                        if Self::pause(&token, cfg.error_backoff()).await {
                            tracing::info!(source = %source, "source loop ended");
                            return;
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        source = %source,
                        channel = %channel.external_id,
                        "channel disappeared from directory during poll"
                    );
                }
            }

            // Per-source throttle between channel visits.
            if Self::pause(&token, cfg.poll_interval(source)).await {
                break;
            }
        }
        tracing::info!(source = %source, "source loop ended");
    }

    /// Run the full per-channel pipeline; any error becomes a failed outcome.
    async fn poll_channel(&self, source: SourceType, channel: &ChannelRecord) -> PollOutcome {
        tracing::info!(source = %source, channel = %channel.external_id, "polling channel");

        let Some(poller) = self.registry.get(source) else {
            tracing::error!(source = %source, "no poller registered");
            return PollOutcome::failure();
        };

        match poller.process(&channel.url, &channel.external_id).await {
            Ok(outcome) => {
                tracing::info!(
                    source = %source,
                    channel = %channel.external_id,
                    items = outcome.item_count,
                    avg_score = outcome.avg_item_score,
                    "channel polled"
                );
                outcome
            }
            Err(e) => {
                tracing::warn!(
                    source = %source,
                    channel = %channel.external_id,
                    error = ?e,
                    "channel poll failed"
                );
                PollOutcome::failure()
            }
        }
    }

    /// Cancellable sleep; returns true when the token fired.
    async fn pause(token: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Periodic listing resync (continuous mode). Resets rotation cursors.
    async fn resync_loop(self: Arc<Self>, token: CancellationToken) {
        tracing::info!("resync loop started");
        loop {
            let period = self.config.current().resync_period();
            if Self::pause(&token, period).await {
                break;
            }
            tracing::info!("periodic channel listing resync");
            let channels = self.sync.sync(false).await;
            self.directory
                .lock()
                .expect("engine mutex poisoned")
                .refresh(channels);
        }
        tracing::info!("resync loop ended");
    }

    /// Periodic health report (continuous mode). Pure side effect: log lines
    /// and gauges, no state changes.
    async fn health_loop(self: Arc<Self>, token: CancellationToken) {
        tracing::info!("health report loop started");
        loop {
            let period = self.config.current().health_report_period();
            if Self::pause(&token, period).await {
                break;
            }
            for (source, stats) in self.source_stats_from_directory() {
                gauge!("poll_channels_active", "source" => source.as_str())
                    .set(stats.active_channels as f64);
                tracing::info!(
                    source = %source,
                    active = stats.active_channels,
                    total = stats.total_channels,
                    success_rate = stats.success_rate,
                    items = stats.total_items_collected,
                    "source health"
                );
            }
        }
        tracing::info!("health report loop ended");
    }

    fn source_stats_from_directory(&self) -> BTreeMap<SourceType, SourceStats> {
        let dir = self.directory.lock().expect("engine mutex poisoned");
        let mut out = BTreeMap::new();
        for (source, channels) in dir.iter() {
            out.insert(*source, Self::stats_of(channels));
        }
        out
    }

    fn stats_of(channels: &[ChannelRecord]) -> SourceStats {
        let active = channels.iter().filter(|ch| ch.is_active).count();
        let success: u64 = channels.iter().map(|ch| ch.success_count).sum();
        let failure: u64 = channels.iter().map(|ch| ch.failure_count).sum();
        let items: u64 = channels.iter().map(|ch| ch.items_collected).sum();
        let attempts = success + failure;
        let rate = if attempts == 0 {
            0.0
        } else {
            (success as f64 / attempts as f64 * 1000.0).round() / 10.0
        };
        SourceStats {
            total_channels: channels.len(),
            active_channels: active,
            inactive_channels: channels.len() - active,
            success_rate: rate,
            total_success: success,
            total_failure: failure,
            total_items_collected: items,
        }
    }

    /// Aggregate status from the persisted records (the store is the source
    /// of truth; the directory only covers channels loaded for this run).
    pub async fn status(&self) -> EngineStatus {
        let mut sources: BTreeMap<SourceType, Vec<ChannelRecord>> = BTreeMap::new();
        match self.store.load_all().await {
            Ok(records) => {
                for record in records {
                    sources.entry(record.source_type).or_default().push(record);
                }
            }
            Err(e) => tracing::error!(error = ?e, "loading channels for status failed"),
        }
        let stats = sources
            .into_iter()
            .map(|(source, channels)| (source, Self::stats_of(&channels)))
            .collect();

        let started_at = self.started_at();
        let running = self.is_running();
        let active_tasks = {
            let tasks = self.source_tasks.lock().expect("engine mutex poisoned");
            tasks
                .iter()
                .map(|(source, task)| TaskStatus {
                    name: source.to_string(),
                    running: !task.handle.is_finished(),
                })
                .collect()
        };

        EngineStatus {
            mode: self.mode,
            running,
            finished: self.mode == PollMode::SinglePass
                && self.pass_finished(&self.enabled_sources()),
            started_at,
            uptime: started_at.filter(|_| running).map(format_uptime),
            sources: stats,
            active_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_renders_hh_mm_ss() {
        let since = Utc::now() - chrono::Duration::seconds(3_725);
        let rendered = format_uptime(since);
        assert!(
            rendered == "01:02:05" || rendered == "01:02:06",
            "unexpected uptime {rendered}"
        );
    }

    #[test]
    fn stats_round_success_rate_to_one_decimal() {
        let mut a = ChannelRecord::new(SourceType::Twitter, "a", "a");
        a.success_count = 2;
        a.failure_count = 1;
        let stats = PollEngine::stats_of(&[a]);
        assert_eq!(stats.success_rate, 66.7);
        assert_eq!(stats.total_success, 2);
        assert_eq!(stats.total_failure, 1);
    }

    #[test]
    fn stats_with_no_attempts_report_zero_rate() {
        let a = ChannelRecord::new(SourceType::Twitter, "a", "a");
        let stats = PollEngine::stats_of(&[a]);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.active_channels, 1);
    }
}
