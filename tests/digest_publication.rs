// tests/digest_publication.rs
//! Publication pipeline behavior: single-flight, clean no-ops, bounded
//! retry, and usage marking.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use digestflow::digest::{
    Cadence, Digest, DigestAssembler, DigestConfig, DigestPublisher, DigestScheduler, UsageMarker,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

struct FixedAssembler {
    digest: Option<Digest>,
    builds: AtomicUsize,
}

impl FixedAssembler {
    fn some(text: &str, item_ids: Vec<i64>) -> Self {
        Self {
            digest: Some(Digest {
                text: text.to_string(),
                item_ids,
            }),
            builds: AtomicUsize::new(0),
        }
    }

    fn none() -> Self {
        Self {
            digest: None,
            builds: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DigestAssembler for FixedAssembler {
    async fn build(&self, _cadence: Cadence, _is_test: bool) -> Result<Option<Digest>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.digest.clone())
    }
}

/// Replays scripted delivery results; after the script it always succeeds.
struct ScriptedPublisher {
    script: Mutex<VecDeque<Result<bool>>>,
    calls: AtomicUsize,
}

impl ScriptedPublisher {
    fn new(script: Vec<Result<bool>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    fn always_ok() -> Self {
        Self::new(Vec::new())
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DigestPublisher for ScriptedPublisher {
    async fn publish(&self, _text: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("publisher mutex poisoned")
            .pop_front()
            .unwrap_or(Ok(true))
    }
}

/// Blocks deliveries on a semaphore so a test can hold one in flight.
struct GatedPublisher {
    gate: Arc<Semaphore>,
    calls: AtomicUsize,
}

#[async_trait]
impl DigestPublisher for GatedPublisher {
    async fn publish(&self, _text: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await?;
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingMarker {
    marked: Mutex<Vec<(Vec<i64>, Cadence)>>,
}

impl RecordingMarker {
    fn mark_count(&self) -> usize {
        self.marked.lock().expect("marker mutex poisoned").len()
    }
}

#[async_trait]
impl UsageMarker for RecordingMarker {
    async fn mark_used(&self, item_ids: &[i64], cadence: Cadence) -> Result<usize> {
        self.marked
            .lock()
            .expect("marker mutex poisoned")
            .push((item_ids.to_vec(), cadence));
        Ok(item_ids.len())
    }
}

fn fast_config(max_attempts: u32) -> DigestConfig {
    DigestConfig {
        max_attempts,
        retry_delay_secs: 0,
        ..DigestConfig::default()
    }
}

#[tokio::test]
async fn two_rapid_executions_publish_once() {
    let gate = Arc::new(Semaphore::new(0));
    let assembler = Arc::new(FixedAssembler::some("daily digest", vec![1, 2]));
    let publisher = Arc::new(GatedPublisher {
        gate: gate.clone(),
        calls: AtomicUsize::new(0),
    });
    let marker = Arc::new(RecordingMarker::default());
    let scheduler = Arc::new(DigestScheduler::new(
        fast_config(3),
        assembler.clone(),
        publisher.clone(),
        marker.clone(),
    ));

    // First execution parks inside publish().
    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.execute_with_retry(Cadence::Daily, false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second request arrives while the first is in flight: dropped, not queued.
    scheduler.execute_with_retry(Cadence::Daily, false).await;

    gate.add_permits(1);
    first.await.unwrap();

    assert_eq!(assembler.builds.load(Ordering::SeqCst), 1);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(marker.mark_count(), 1);
}

#[tokio::test]
async fn empty_digest_is_a_clean_noop() {
    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let marker = Arc::new(RecordingMarker::default());
    let scheduler = DigestScheduler::new(
        fast_config(3),
        Arc::new(FixedAssembler::none()),
        publisher.clone(),
        marker.clone(),
    );

    scheduler.execute_with_retry(Cadence::Weekly, false).await;

    assert_eq!(publisher.call_count(), 0, "nothing to publish, nothing sent");
    assert_eq!(marker.mark_count(), 0);
}

#[tokio::test]
async fn delivery_failures_retry_then_mark_once() {
    let publisher = Arc::new(ScriptedPublisher::new(vec![
        Ok(false),
        Err(anyhow!("messenger timeout")),
        Ok(true),
    ]));
    let marker = Arc::new(RecordingMarker::default());
    let scheduler = DigestScheduler::new(
        fast_config(3),
        Arc::new(FixedAssembler::some("weekly digest", vec![7, 8, 9])),
        publisher.clone(),
        marker.clone(),
    );

    scheduler.execute_with_retry(Cadence::Weekly, false).await;

    assert_eq!(publisher.call_count(), 3, "two failures, then success");
    let marked = marker.marked.lock().unwrap();
    assert_eq!(marked.len(), 1, "items marked exactly once, after success");
    assert_eq!(marked[0], (vec![7, 8, 9], Cadence::Weekly));
}

#[tokio::test]
async fn exhausted_retries_abandon_without_marking() {
    let publisher = Arc::new(ScriptedPublisher::new(vec![Ok(false), Ok(false)]));
    let marker = Arc::new(RecordingMarker::default());
    let scheduler = DigestScheduler::new(
        fast_config(2),
        Arc::new(FixedAssembler::some("monthly digest", vec![4])),
        publisher.clone(),
        marker.clone(),
    );

    scheduler.execute_with_retry(Cadence::Monthly, false).await;

    assert_eq!(publisher.call_count(), 2, "bounded by max_attempts");
    assert_eq!(marker.mark_count(), 0, "abandoned digests mark nothing");
}

#[tokio::test]
async fn stop_then_start_keeps_retries_and_marking_alive() {
    let publisher = Arc::new(ScriptedPublisher::new(vec![Ok(false)]));
    let marker = Arc::new(RecordingMarker::default());
    let scheduler = Arc::new(DigestScheduler::new(
        fast_config(3),
        Arc::new(FixedAssembler::some("daily digest", vec![1, 2])),
        publisher.clone(),
        marker.clone(),
    ));

    scheduler.start();
    scheduler.stop();
    scheduler.start();
    assert!(scheduler.is_running());

    // The restarted instance must not treat retry delays as cancelled.
    scheduler.execute_with_retry(Cadence::Daily, false).await;

    assert_eq!(publisher.call_count(), 2, "failed delivery retried after restart");
    assert_eq!(marker.mark_count(), 1);
    scheduler.stop();
}

#[tokio::test]
async fn test_runs_skip_the_usage_marker() {
    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let marker = Arc::new(RecordingMarker::default());
    let scheduler = DigestScheduler::new(
        fast_config(3),
        Arc::new(FixedAssembler::some("trial digest", vec![1])),
        publisher.clone(),
        marker.clone(),
    );

    scheduler.execute_with_retry(Cadence::Daily, true).await;

    assert_eq!(publisher.call_count(), 1, "test digests are still delivered");
    assert_eq!(marker.mark_count(), 0, "test digests never consume items");
}
