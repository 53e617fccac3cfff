// src/digest.rs
//! # Digest Scheduler
//! Cron-like job runner for digest publication. Holds one trigger rule per
//! cadence (daily/weekly/monthly); enabled cadences each get a loop that
//! sleeps until the next chrono-computed occurrence and then runs the digest
//! through `execute_with_retry`. One execution at a time per scheduler: a
//! request arriving while another runs is dropped with a warning, never
//! queued. Publish failures are retried a bounded number of times, then the
//! run is abandoned with full diagnostics — nothing here is fatal to the
//! process.

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("digest_attempts_total", "Digest publication attempts.");
        describe_counter!("digest_published_total", "Successfully published digests.");
        describe_counter!(
            "digest_abandoned_total",
            "Digest runs abandoned after exhausting retries."
        );
        describe_counter!(
            "digest_dropped_total",
            "Digest requests dropped by the single-flight guard."
        );
    });
}

/// Publication cadence of one digest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Daily, Cadence::Weekly, Cadence::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cron-like trigger for one cadence: fire at `hour:minute`, additionally
/// constrained by `weekday` (weekly, 0 = Monday) or `day_of_month` (monthly).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceRule {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
    /// Weekly only. 0 = Monday ... 6 = Sunday.
    pub weekday: u8,
    /// Monthly only. Months without this day are skipped (a rule for the
    /// 31st fires only in 31-day months).
    pub day_of_month: u32,
}

impl Default for CadenceRule {
    fn default() -> Self {
        Self {
            enabled: false,
            hour: 20,
            minute: 0,
            weekday: 0,
            day_of_month: 1,
        }
    }
}

impl CadenceRule {
    /// First occurrence strictly after `after`, or `None` when the rule is
    /// disabled or malformed (e.g. hour 25).
    pub fn next_after(&self, cadence: Cadence, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0)?;

        match cadence {
            Cadence::Daily => {
                let today = after.date_naive().and_time(time).and_utc();
                if today > after {
                    Some(today)
                } else {
                    let next = after.date_naive().succ_opt()?;
                    Some(next.and_time(time).and_utc())
                }
            }
            Cadence::Weekly => {
                for offset in 0..=7u64 {
                    let date = after.date_naive() + chrono::Days::new(offset);
                    if date.weekday().num_days_from_monday() == self.weekday as u32 {
                        let candidate = date.and_time(time).and_utc();
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                }
                None
            }
            Cadence::Monthly => {
                let mut year = after.year();
                let mut month = after.month();
                // Scan forward; two years covers every skip pattern.
                for _ in 0..24 {
                    if let Some(date) =
                        chrono::NaiveDate::from_ymd_opt(year, month, self.day_of_month)
                    {
                        let candidate = date.and_time(time).and_utc();
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                None
            }
        }
    }
}

/// Digest publication settings: retry policy plus one trigger per cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub daily: CadenceRule,
    pub weekly: CadenceRule,
    pub monthly: CadenceRule,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 300,
            daily: CadenceRule {
                enabled: true,
                ..CadenceRule::default()
            },
            weekly: CadenceRule::default(),
            monthly: CadenceRule::default(),
        }
    }
}

impl DigestConfig {
    pub fn rule(&self, cadence: Cadence) -> &CadenceRule {
        match cadence {
            Cadence::Daily => &self.daily,
            Cadence::Weekly => &self.weekly,
            Cadence::Monthly => &self.monthly,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// One assembled digest ready for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub text: String,
    /// Identifiers of the collected items folded into the text; marked as
    /// used once the digest is published.
    pub item_ids: Vec<i64>,
}

#[async_trait::async_trait]
pub trait DigestAssembler: Send + Sync {
    /// Build the digest for one cadence from eligible collected items.
    /// `Ok(None)` (or an empty item list) means there is nothing to publish —
    /// a clean no-op, not an error.
    async fn build(&self, cadence: Cadence, is_test: bool) -> Result<Option<Digest>>;
}

#[async_trait::async_trait]
pub trait DigestPublisher: Send + Sync {
    /// Ship the rendered digest. `Ok(false)` is a delivery failure.
    async fn publish(&self, text: &str) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait UsageMarker: Send + Sync {
    /// Mark the consumed items as used for the cadence; returns the number
    /// of items updated.
    async fn mark_used(&self, item_ids: &[i64], cadence: Cadence) -> Result<usize>;
}

/// Clears the single-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DigestScheduler {
    config: DigestConfig,
    assembler: Arc<dyn DigestAssembler>,
    publisher: Arc<dyn DigestPublisher>,
    marker: Arc<dyn UsageMarker>,
    in_flight: AtomicBool,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    cancel: Mutex<CancellationToken>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl DigestScheduler {
    pub fn new(
        config: DigestConfig,
        assembler: Arc<dyn DigestAssembler>,
        publisher: Arc<dyn DigestPublisher>,
        marker: Arc<dyn UsageMarker>,
    ) -> Self {
        ensure_metrics_described();
        Self {
            config,
            assembler,
            publisher,
            marker,
            in_flight: AtomicBool::new(false),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().expect("digest mutex poisoned")
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().expect("digest mutex poisoned").clone()
    }

    /// Register the cron loops for every enabled cadence. Disabled cadences
    /// are simply never registered. Each start takes a fresh cancellation
    /// token, so a stopped scheduler can be started again; loops from an
    /// earlier start stay bound to their old, cancelled token.
    pub fn start(self: &Arc<Self>) {
        tracing::info!("starting digest scheduler");
        self.running.store(true, Ordering::SeqCst);
        *self.started_at.lock().expect("digest mutex poisoned") = Some(Utc::now());
        let token = CancellationToken::new();
        *self.cancel.lock().expect("digest mutex poisoned") = token.clone();

        let mut jobs = self.jobs.lock().expect("digest mutex poisoned");
        for cadence in Cadence::ALL {
            let rule = self.config.rule(cadence);
            if !rule.enabled {
                continue;
            }
            match rule.next_after(cadence, Utc::now()) {
                Some(next) => {
                    tracing::info!(cadence = %cadence, next_run = %next, "digest job scheduled")
                }
                None => {
                    tracing::warn!(cadence = %cadence, "digest rule never fires, skipping");
                    continue;
                }
            }
            let scheduler = Arc::clone(self);
            let token = token.clone();
            jobs.push(tokio::spawn(async move {
                scheduler.cron_loop(cadence, token).await;
            }));
        }
    }

    /// Start the cron loops and park until the scheduler is stopped.
    /// This is the supervised entry point used by the orchestrator.
    pub async fn run(self: Arc<Self>) {
        self.start();
        self.cancel_token().cancelled().await;
        tracing::info!("digest scheduler loop ended");
    }

    /// Shut the cron loops down without waiting for an in-flight execution;
    /// a retry delay in progress observes the cancellation and gives up.
    pub fn stop(&self) {
        tracing::info!("stopping digest scheduler");
        self.cancel.lock().expect("digest mutex poisoned").cancel();
        for job in self.jobs.lock().expect("digest mutex poisoned").drain(..) {
            job.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        *self.started_at.lock().expect("digest mutex poisoned") = None;
    }

    async fn cron_loop(self: Arc<Self>, cadence: Cadence, token: CancellationToken) {
        loop {
            let now = Utc::now();
            let Some(next) = self.config.rule(cadence).next_after(cadence, now) else {
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(cadence = %cadence, next_run = %next, "digest job sleeping");

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.execute_with_retry(cadence, false).await;
        }
        tracing::info!(cadence = %cadence, "digest job cancelled");
    }

    /// Manual/administrative trigger, bypassing the cron rules.
    pub async fn force_execute(&self, cadence: Cadence) {
        tracing::info!(cadence = %cadence, "forced digest execution");
        self.execute_with_retry(cadence, false).await;
    }

    /// Build, publish, and mark one digest, retrying publication failures up
    /// to the configured bound. Concurrent requests are dropped, not queued.
    pub async fn execute_with_retry(&self, cadence: Cadence, is_test: bool) {
        // The guard must be taken before the first suspension point.
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!(cadence = %cadence, "digest already executing, request dropped");
            counter!("digest_dropped_total").increment(1);
            return;
        }
        let _flight = FlightGuard(&self.in_flight);
        let cancel = self.cancel_token();

        let max_attempts = self.config.max_attempts;
        for attempt in 1..=max_attempts {
            tracing::info!(cadence = %cadence, attempt, max_attempts, is_test, "digest attempt");
            counter!("digest_attempts_total").increment(1);

            let failure = match self.assembler.build(cadence, is_test).await {
                Ok(None) => {
                    tracing::warn!(cadence = %cadence, "no digest data, nothing to publish");
                    return;
                }
                Ok(Some(digest)) if digest.item_ids.is_empty() => {
                    tracing::warn!(cadence = %cadence, "digest has no items, nothing to publish");
                    return;
                }
                Ok(Some(digest)) => match self.publisher.publish(&digest.text).await {
                    Ok(true) => {
                        self.mark_published(&digest, cadence, is_test).await;
                        counter!("digest_published_total").increment(1);
                        tracing::info!(cadence = %cadence, items = digest.item_ids.len(), "digest published");
                        return;
                    }
                    Ok(false) => anyhow::anyhow!("publisher declined the digest"),
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if attempt < max_attempts {
                let delay = self.config.retry_delay();
                tracing::warn!(
                    cadence = %cadence,
                    attempt,
                    error = ?failure,
                    retry_in_secs = delay.as_secs(),
                    "digest attempt failed, will retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(cadence = %cadence, "digest retry cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                counter!("digest_abandoned_total").increment(1);
                tracing::error!(
                    cadence = %cadence,
                    attempts = max_attempts,
                    error = %format!("{failure:#}"),
                    "digest abandoned after exhausting retries"
                );
            }
        }
    }

    async fn mark_published(&self, digest: &Digest, cadence: Cadence, is_test: bool) {
        if is_test {
            tracing::info!(cadence = %cadence, "test digest, items left unmarked");
            return;
        }
        match self.marker.mark_used(&digest.item_ids, cadence).await {
            Ok(updated) => {
                tracing::info!(cadence = %cadence, updated, "items marked as used");
            }
            Err(e) => {
                // The digest is out; re-publishing would duplicate it.
                tracing::error!(cadence = %cadence, error = ?e, "marking items as used failed");
            }
        }
    }
}
