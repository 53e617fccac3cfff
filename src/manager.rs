// src/manager.rs
//! # Orchestrator
//! Process-level owner of the engines: at most one continuous engine, one
//! single-pass engine, and the digest scheduler, each supervised as a
//! background task in a central registry. The orchestrator enforces the one
//! cross-engine invariant of the system: the continuous and single-pass
//! engines never run at the same time — a conflicting start is rejected with
//! a typed error and no state change.
//!
//! This is an explicitly constructed, dependency-injected instance created
//! once at process start; nothing in here is a global.

use crate::config::ConfigHandle;
use crate::digest::{DigestAssembler, DigestPublisher, DigestScheduler, UsageMarker};
use crate::engine::{format_uptime, PollEngine, PollMode};
use crate::poller::PollerRegistry;
use crate::store::ChannelStore;
use crate::sync::{ChannelListProvider, DirectorySync};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const TASK_CONTINUOUS: &str = "continuous";
const TASK_SINGLE_PASS: &str = "single_pass";
const TASK_DIGEST: &str = "digest_publisher";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A polling engine is still live — the other member of the exclusive
    /// pair, or a same-mode engine that was already started.
    #[error("cannot start the {requested} engine: the {active} engine is already running, stop it first")]
    ModeConflict {
        requested: PollMode,
        active: PollMode,
    },
}

/// Status summary for one managed engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub kind: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<String>,
    pub name: &'static str,
    pub description: &'static str,
}

/// Which member of the exclusive pair is live, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ExclusiveStatus {
    pub group: [&'static str; 2],
    pub description: &'static str,
    pub active: Option<PollMode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub engines: Vec<EngineSummary>,
    pub exclusive: ExclusiveStatus,
}

pub struct Orchestrator {
    config: ConfigHandle,
    registry: PollerRegistry,
    store: Arc<dyn ChannelStore>,
    sync: Arc<DirectorySync>,
    assembler: Arc<dyn DigestAssembler>,
    publisher: Arc<dyn DigestPublisher>,
    marker: Arc<dyn UsageMarker>,
    digest: Mutex<Arc<DigestScheduler>>,
    continuous: Mutex<Option<Arc<PollEngine>>>,
    single_pass: Mutex<Option<Arc<PollEngine>>>,
    tasks: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigHandle,
        registry: PollerRegistry,
        store: Arc<dyn ChannelStore>,
        provider: Arc<dyn ChannelListProvider>,
        assembler: Arc<dyn DigestAssembler>,
        publisher: Arc<dyn DigestPublisher>,
        marker: Arc<dyn UsageMarker>,
    ) -> Self {
        let sync = Arc::new(DirectorySync::new(
            provider,
            store.clone(),
            config.current().resync_period(),
        ));
        let digest = Arc::new(DigestScheduler::new(
            config.current().digest.clone(),
            assembler.clone(),
            publisher.clone(),
            marker.clone(),
        ));
        tracing::info!("orchestrator constructed");
        Self {
            config,
            registry,
            store,
            sync,
            assembler,
            publisher,
            marker,
            digest: Mutex::new(digest),
            continuous: Mutex::new(None),
            single_pass: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn digest_scheduler(&self) -> Arc<DigestScheduler> {
        self.digest.lock().expect("orchestrator mutex poisoned").clone()
    }

    pub fn engine(&self, mode: PollMode) -> Option<Arc<PollEngine>> {
        match mode {
            PollMode::Continuous => self.continuous.lock(),
            PollMode::SinglePass => self.single_pass.lock(),
        }
        .expect("orchestrator mutex poisoned")
        .clone()
    }

    fn make_engine(&self, mode: PollMode) -> Arc<PollEngine> {
        // Only the single-pass engine gets the completion hook.
        let digest = match mode {
            PollMode::SinglePass => Some(self.digest_scheduler()),
            PollMode::Continuous => None,
        };
        Arc::new(PollEngine::new(
            mode,
            self.config.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.sync.clone(),
            digest,
        ))
    }

    fn make_digest(&self) -> Arc<DigestScheduler> {
        Arc::new(DigestScheduler::new(
            self.config.current().digest.clone(),
            self.assembler.clone(),
            self.publisher.clone(),
            self.marker.clone(),
        ))
    }

    fn task_alive(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .expect("orchestrator mutex poisoned")
            .get(key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Live member of the exclusive pair. Consults both the task registry
    /// and the engines' own running flags, so a finished task object lying
    /// around does not block a start and a still-running engine does not
    /// slip through.
    pub fn active_poll_mode(&self) -> Option<PollMode> {
        if self.task_alive(TASK_CONTINUOUS) {
            return Some(PollMode::Continuous);
        }
        if self.task_alive(TASK_SINGLE_PASS) {
            return Some(PollMode::SinglePass);
        }
        if let Some(engine) = self.engine(PollMode::Continuous) {
            if engine.is_running() {
                return Some(PollMode::Continuous);
            }
        }
        if let Some(engine) = self.engine(PollMode::SinglePass) {
            if engine.is_running() {
                return Some(PollMode::SinglePass);
            }
        }
        None
    }

    pub fn is_polling_active(&self) -> bool {
        self.active_poll_mode().is_some()
    }

    fn check_exclusive(&self, requested: PollMode) -> Result<(), OrchestratorError> {
        // Any live engine blocks a start. A same-mode double start would
        // spawn a run task the engine refuses and overwrite the live task's
        // registry handle with the dead one.
        match self.active_poll_mode() {
            Some(active) => Err(OrchestratorError::ModeConflict { requested, active }),
            None => Ok(()),
        }
    }

    fn spawn_engine_task(&self, key: &'static str, engine: &Arc<PollEngine>) {
        let handle = tokio::spawn(Arc::clone(engine).run());
        self.tasks
            .lock()
            .expect("orchestrator mutex poisoned")
            .insert(key, handle);
        tracing::info!(task = key, "engine task created");
    }

    pub fn start_continuous(&self) -> Result<EngineSummary, OrchestratorError> {
        self.check_exclusive(PollMode::Continuous)?;

        let engine = {
            let mut slot = self.continuous.lock().expect("orchestrator mutex poisoned");
            slot.get_or_insert_with(|| self.make_engine(PollMode::Continuous))
                .clone()
        };
        self.spawn_engine_task(TASK_CONTINUOUS, &engine);
        Ok(self.engine_summary(PollMode::Continuous))
    }

    pub fn stop_continuous(&self) -> EngineSummary {
        if let Some(handle) = self
            .tasks
            .lock()
            .expect("orchestrator mutex poisoned")
            .remove(TASK_CONTINUOUS)
        {
            handle.abort();
        }
        if let Some(engine) = self.engine(PollMode::Continuous) {
            engine.stop();
        }
        tracing::info!("continuous engine stopped");
        self.engine_summary(PollMode::Continuous)
    }

    pub fn start_single_pass(&self) -> Result<EngineSummary, OrchestratorError> {
        self.check_exclusive(PollMode::SinglePass)?;

        let engine = {
            let mut slot = self.single_pass.lock().expect("orchestrator mutex poisoned");
            slot.get_or_insert_with(|| self.make_engine(PollMode::SinglePass))
                .clone()
        };
        self.spawn_engine_task(TASK_SINGLE_PASS, &engine);
        Ok(self.engine_summary(PollMode::SinglePass))
    }

    pub fn stop_single_pass(&self) -> EngineSummary {
        if let Some(engine) = self.engine(PollMode::SinglePass) {
            engine.stop();
        }
        if let Some(handle) = self
            .tasks
            .lock()
            .expect("orchestrator mutex poisoned")
            .remove(TASK_SINGLE_PASS)
        {
            handle.abort();
        }
        // A single-pass engine is one-shot; drop it so the next start gets
        // a fresh rotation.
        *self.single_pass.lock().expect("orchestrator mutex poisoned") = None;
        tracing::info!("single-pass engine stopped");
        EngineSummary {
            kind: PollMode::SinglePass.to_string(),
            running: false,
            started_at: None,
            uptime: None,
            name: engine_name(TASK_SINGLE_PASS),
            description: engine_description(TASK_SINGLE_PASS),
        }
    }

    pub fn start_digest(&self) -> EngineSummary {
        let digest = self.digest_scheduler();
        let handle = tokio::spawn(Arc::clone(&digest).run());
        self.tasks
            .lock()
            .expect("orchestrator mutex poisoned")
            .insert(TASK_DIGEST, handle);
        tracing::info!("digest scheduler task created");
        self.digest_summary()
    }

    pub fn stop_digest(&self) -> EngineSummary {
        if let Some(handle) = self
            .tasks
            .lock()
            .expect("orchestrator mutex poisoned")
            .remove(TASK_DIGEST)
        {
            handle.abort();
        }
        self.digest_scheduler().stop();
        tracing::info!("digest scheduler stopped");
        self.digest_summary()
    }

    /// Discard the digest scheduler and rebuild it from the current
    /// configuration (used after a schedule change). Polling engines are
    /// not touched.
    pub fn restart_digest(&self) -> EngineSummary {
        tracing::info!("restarting digest scheduler");
        self.stop_digest();
        *self.digest.lock().expect("orchestrator mutex poisoned") = self.make_digest();
        self.start_digest()
    }

    /// Start the digest scheduler plus the polling engine for `mode`
    /// (when given). Returns the resulting summaries.
    pub fn start_all(&self, mode: Option<PollMode>) -> Result<Vec<EngineSummary>, OrchestratorError> {
        let mut summaries = vec![self.start_digest()];
        match mode {
            Some(PollMode::Continuous) => summaries.push(self.start_continuous()?),
            Some(PollMode::SinglePass) => summaries.push(self.start_single_pass()?),
            None => tracing::warn!("no polling mode configured, digest scheduler only"),
        }
        tracing::info!(tasks = summaries.len(), "orchestrator started");
        Ok(summaries)
    }

    /// Cancel every supervised task with a short grace pause per task, then
    /// stop the engines themselves. Fire-and-forget: in-flight pipeline
    /// calls may briefly outlive this call.
    pub async fn stop_all(&self) {
        let handles: Vec<(&'static str, JoinHandle<()>)> = self
            .tasks
            .lock()
            .expect("orchestrator mutex poisoned")
            .drain()
            .collect();
        tracing::info!(tasks = handles.len(), "stopping all engine tasks");

        for (name, handle) in handles {
            if !handle.is_finished() {
                tracing::info!(task = name, "cancelling task");
                handle.abort();
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        if let Some(engine) = self.engine(PollMode::Continuous) {
            engine.stop();
        }
        if let Some(engine) = self.engine(PollMode::SinglePass) {
            engine.stop();
        }
        self.digest_scheduler().stop();
        tracing::info!("all engine tasks stopped");
    }

    fn engine_summary(&self, mode: PollMode) -> EngineSummary {
        let key = match mode {
            PollMode::Continuous => TASK_CONTINUOUS,
            PollMode::SinglePass => TASK_SINGLE_PASS,
        };
        let engine = self.engine(mode);
        let running = engine
            .as_ref()
            .map(|e| e.is_running())
            .unwrap_or_else(|| self.task_alive(key));
        let started_at = engine.as_ref().and_then(|e| e.started_at());
        EngineSummary {
            kind: mode.to_string(),
            running,
            started_at,
            uptime: started_at.filter(|_| running).map(format_uptime),
            name: engine_name(key),
            description: engine_description(key),
        }
    }

    fn digest_summary(&self) -> EngineSummary {
        let digest = self.digest_scheduler();
        let running = digest.is_running();
        let started_at = digest.started_at();
        EngineSummary {
            kind: TASK_DIGEST.to_string(),
            running,
            started_at,
            uptime: started_at.filter(|_| running).map(format_uptime),
            name: engine_name(TASK_DIGEST),
            description: engine_description(TASK_DIGEST),
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            engines: vec![
                self.engine_summary(PollMode::Continuous),
                self.engine_summary(PollMode::SinglePass),
                self.digest_summary(),
            ],
            exclusive: ExclusiveStatus {
                group: [TASK_CONTINUOUS, TASK_SINGLE_PASS],
                description: "only one of the continuous or single-pass engines may run at a time",
                active: self.active_poll_mode(),
            },
        }
    }
}

fn engine_name(key: &str) -> &'static str {
    match key {
        TASK_CONTINUOUS => "Continuous collector",
        TASK_SINGLE_PASS => "Single-pass collector",
        TASK_DIGEST => "Digest publisher",
        _ => "Unknown",
    }
}

fn engine_description(key: &str) -> &'static str {
    match key {
        TASK_CONTINUOUS => "Polls all active channels in rotation, forever",
        TASK_SINGLE_PASS => "Visits every active channel once, then publishes the daily digest",
        TASK_DIGEST => "Publishes digests on the configured schedule",
        _ => "",
    }
}
