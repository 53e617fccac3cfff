// src/poller.rs
//! # Channel Pollers
//! One capability per source type: `process(url, id)` runs the whole
//! fetch → normalize → dedupe → relevance-filter → persist pipeline for one
//! channel and reports a [`PollOutcome`]. The engine treats the call as
//! opaque and may suspend inside it; errors are per-channel and folded into
//! the channel record as failures.
//!
//! Implementations are selected through a [`PollerRegistry`] keyed on
//! [`SourceType`] — one flat registry, no inheritance chains.

use crate::channel::{PollOutcome, SourceType};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait ChannelPoller: Send + Sync {
    /// Run the full per-channel pipeline for one endpoint.
    async fn process(&self, url: &str, external_id: &str) -> Result<PollOutcome>;
    fn name(&self) -> &'static str;
}

/// Registry of poller implementations keyed by source type.
#[derive(Default, Clone)]
pub struct PollerRegistry {
    pollers: HashMap<SourceType, Arc<dyn ChannelPoller>>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, source: SourceType, poller: Arc<dyn ChannelPoller>) -> Self {
        self.pollers.insert(source, poller);
        self
    }

    pub fn get(&self, source: SourceType) -> Option<Arc<dyn ChannelPoller>> {
        self.pollers.get(&source).cloned()
    }

    /// Source types with a registered poller, in stable order.
    pub fn sources(&self) -> Vec<SourceType> {
        let mut sources: Vec<SourceType> = self.pollers.keys().copied().collect();
        sources.sort();
        sources
    }
}

/// Deterministic poller for demos and smoke runs: every visit "collects" a
/// fixed number of items at a fixed average score.
pub struct FixturePoller {
    name: &'static str,
    item_count: u64,
    avg_item_score: f64,
}

impl FixturePoller {
    pub fn new(name: &'static str, item_count: u64, avg_item_score: f64) -> Self {
        Self {
            name,
            item_count,
            avg_item_score,
        }
    }
}

#[async_trait::async_trait]
impl ChannelPoller for FixturePoller {
    async fn process(&self, _url: &str, external_id: &str) -> Result<PollOutcome> {
        tracing::debug!(poller = self.name, channel = external_id, "fixture poll");
        Ok(PollOutcome::success(self.item_count, self.avg_item_score))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

// --- Test helper ---
/// Replays a scripted sequence of outcomes and logs every call. Once the
/// script is exhausted it keeps returning successful empty polls.
pub struct ScriptedPoller {
    script: std::sync::Mutex<std::collections::VecDeque<Result<PollOutcome>>>,
    pub calls: std::sync::Mutex<Vec<String>>,
}

impl ScriptedPoller {
    pub fn new(script: Vec<Result<PollOutcome>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into_iter().collect()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("scripted poller mutex poisoned").len()
    }
}

#[async_trait::async_trait]
impl ChannelPoller for ScriptedPoller {
    async fn process(&self, url: &str, _external_id: &str) -> Result<PollOutcome> {
        self.calls
            .lock()
            .expect("scripted poller mutex poisoned")
            .push(url.to_string());
        self.script
            .lock()
            .expect("scripted poller mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(PollOutcome::success(0, 0.0)))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn registry_routes_by_source_type() {
        let registry = PollerRegistry::new()
            .register(SourceType::Twitter, Arc::new(FixturePoller::new("tw", 2, 0.7)))
            .register(SourceType::Reddit, Arc::new(FixturePoller::new("rd", 1, 0.3)));

        assert_eq!(
            registry.sources(),
            vec![SourceType::Twitter, SourceType::Reddit]
        );
        assert!(registry.get(SourceType::Youtube).is_none());

        let outcome = registry
            .get(SourceType::Twitter)
            .unwrap()
            .process("u", "id")
            .await
            .unwrap();
        assert_eq!(outcome.item_count, 2);
    }

    #[tokio::test]
    async fn scripted_poller_replays_then_idles() {
        let poller = ScriptedPoller::new(vec![
            Ok(PollOutcome::success(1, 0.5)),
            Err(anyhow!("boom")),
        ]);

        assert!(poller.process("a", "a").await.unwrap().success);
        assert!(poller.process("b", "b").await.is_err());
        let idle = poller.process("c", "c").await.unwrap();
        assert!(idle.success && idle.item_count == 0);
        assert_eq!(poller.call_count(), 3);
    }
}
