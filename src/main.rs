//! Digestflow — Binary Entrypoint
//! Demo wiring of the scheduling core against in-memory collaborators:
//! a static channel listing, fixture pollers, and a digest pipeline that
//! prints to the log instead of a messenger. Run mode is chosen with
//! `DIGESTFLOW_MODE` (`continuous`, the default, or `single_pass`).

use anyhow::Result;
use async_trait::async_trait;
use digestflow::digest::{Cadence, Digest, DigestAssembler, DigestPublisher, UsageMarker};
use digestflow::poller::{FixturePoller, PollerRegistry};
use digestflow::store::MemoryStore;
use digestflow::sync::{ChannelListing, ListedChannel, StaticListing};
use digestflow::{ConfigHandle, Orchestrator, PollMode, SchedulerConfig, SourceType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("digestflow=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

/// Folds a running item count into a one-line digest.
struct DemoAssembler {
    items_seen: AtomicU64,
}

#[async_trait]
impl DigestAssembler for DemoAssembler {
    async fn build(&self, cadence: Cadence, _is_test: bool) -> Result<Option<Digest>> {
        let seen = self.items_seen.fetch_add(3, Ordering::SeqCst) + 3;
        Ok(Some(Digest {
            text: format!("{cadence} digest: {seen} items collected so far"),
            item_ids: vec![seen as i64 - 2, seen as i64 - 1, seen as i64],
        }))
    }
}

/// Prints the digest to the log instead of delivering it anywhere.
struct LogPublisher;

#[async_trait]
impl DigestPublisher for LogPublisher {
    async fn publish(&self, text: &str) -> Result<bool> {
        tracing::info!(%text, "digest published");
        Ok(true)
    }
}

struct NoopMarker;

#[async_trait]
impl UsageMarker for NoopMarker {
    async fn mark_used(&self, item_ids: &[i64], _cadence: Cadence) -> Result<usize> {
        Ok(item_ids.len())
    }
}

fn demo_listing() -> ChannelListing {
    let mut listing = BTreeMap::new();
    listing.insert(
        SourceType::Telegram,
        vec![
            ListedChannel::new("https://t.me/demo_markets", "demo_markets"),
            ListedChannel::new("https://t.me/demo_tech", "demo_tech"),
        ],
    );
    listing.insert(
        SourceType::Youtube,
        vec![ListedChannel::new(
            "https://youtube.com/@demo_channel",
            "demo_channel",
        )],
    );
    listing
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op elsewhere.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = ConfigHandle::new(SchedulerConfig::load_default()?);

    let registry = PollerRegistry::new()
        .register(
            SourceType::Telegram,
            Arc::new(FixturePoller::new("telegram-demo", 2, 0.4)),
        )
        .register(
            SourceType::Youtube,
            Arc::new(FixturePoller::new("youtube-demo", 1, 0.7)),
        );

    let orchestrator = Orchestrator::new(
        config,
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(StaticListing::new(demo_listing())),
        Arc::new(DemoAssembler {
            items_seen: AtomicU64::new(0),
        }),
        Arc::new(LogPublisher),
        Arc::new(NoopMarker),
    );

    let mode = match std::env::var("DIGESTFLOW_MODE").as_deref() {
        Ok("single_pass") => PollMode::SinglePass,
        _ => PollMode::Continuous,
    };
    tracing::info!(%mode, "starting digestflow");
    orchestrator.start_all(Some(mode))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    if let Ok(status) = serde_json::to_string(&orchestrator.status()) {
        tracing::info!(%status, "final engine status");
    }
    orchestrator.stop_all().await;
    Ok(())
}
