// src/config.rs
//! # Scheduler Configuration
//! One immutable [`SchedulerConfig`] struct covering the whole scheduling
//! core: enabled sources, per-source poll intervals, failure/health
//! constants, resync and health-report periods, and the digest cadences.
//! Runtime changes go through [`ConfigHandle::reload`], which swaps the
//! whole struct atomically — fields are never patched piecemeal.

use crate::channel::SourceType;
use crate::digest::DigestConfig;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const ENV_PATH: &str = "DIGESTFLOW_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Source types the engines poll. Sources without a registered poller
    /// are skipped with a warning at start.
    pub enabled_sources: Vec<SourceType>,
    /// Per-source throttle between channel visits, seconds.
    pub poll_interval_secs: BTreeMap<SourceType, u64>,
    /// Fallback throttle for sources missing from the map.
    pub default_poll_interval_secs: u64,
    /// Consecutive-failure count that deactivates a channel.
    pub failure_threshold: u64,
    /// Pause when a majority of a source's channels are failing, seconds.
    pub unhealthy_cooldown_secs: u64,
    /// Backoff after a bookkeeping error in a source loop, seconds.
    pub error_backoff_secs: u64,
    /// Period of the continuous engine's listing resync loop, seconds.
    pub resync_period_secs: u64,
    /// Period of the continuous engine's health-report loop, seconds.
    pub health_report_secs: u64,
    pub digest: DigestConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled_sources: SourceType::ALL.to_vec(),
            poll_interval_secs: BTreeMap::new(),
            default_poll_interval_secs: 300,
            failure_threshold: 3,
            unhealthy_cooldown_secs: 60,
            error_backoff_secs: 60,
            resync_period_secs: 24 * 3600,
            health_report_secs: 300,
            digest: DigestConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self, source: SourceType) -> Duration {
        let secs = self
            .poll_interval_secs
            .get(&source)
            .copied()
            .unwrap_or(self.default_poll_interval_secs);
        Duration::from_secs(secs)
    }

    pub fn unhealthy_cooldown(&self) -> Duration {
        Duration::from_secs(self.unhealthy_cooldown_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn health_report_period(&self) -> Duration {
        Duration::from_secs(self.health_report_secs)
    }

    /// Load from an explicit TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scheduler config from {}", path.display()))?;
        let cfg: Self = toml::from_str(&content)
            .with_context(|| format!("parsing scheduler config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using env var + fallback:
    /// 1) $DIGESTFLOW_CONFIG_PATH
    /// 2) config/digestflow.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("DIGESTFLOW_CONFIG_PATH points to non-existent path"));
        }
        let toml_p = PathBuf::from("config/digestflow.toml");
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be at least 1"));
        }
        if self.digest.max_attempts == 0 {
            return Err(anyhow!("digest.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Shared handle over the current configuration. Readers take a cheap
/// snapshot (`Arc` clone); `reload` swaps the snapshot for all future
/// readers without disturbing in-flight ones.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<SchedulerConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<SchedulerConfig> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    pub fn reload(&self, config: SchedulerConfig) {
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
        tracing::info!("scheduler configuration reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.unhealthy_cooldown_secs, 60);
        assert_eq!(cfg.resync_period_secs, 24 * 3600);
        assert_eq!(cfg.health_report_secs, 300);
        assert_eq!(cfg.digest.max_attempts, 3);
        assert_eq!(cfg.digest.retry_delay_secs, 300);
        assert_eq!(cfg.poll_interval(SourceType::Twitter), Duration::from_secs(300));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let toml = r#"
            enabled_sources = ["telegram", "reddit"]
            failure_threshold = 5

            [poll_interval_secs]
            telegram = 30

            [digest.daily]
            enabled = true
            hour = 9
            minute = 30
        "#;
        let cfg: SchedulerConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            cfg.enabled_sources,
            vec![SourceType::Telegram, SourceType::Reddit]
        );
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.poll_interval(SourceType::Telegram), Duration::from_secs(30));
        // Unlisted sources fall back to the default interval.
        assert_eq!(cfg.poll_interval(SourceType::Reddit), Duration::from_secs(300));
        assert!(cfg.digest.daily.enabled);
        assert_eq!((cfg.digest.daily.hour, cfg.digest.daily.minute), (9, 30));
    }

    #[serial_test::serial]
    #[test]
    fn load_default_honors_env_path() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("digestflow.toml");
        std::fs::write(&p, "failure_threshold = 4\n").unwrap();

        std::env::set_var(ENV_PATH, p.display().to_string());
        let cfg = SchedulerConfig::load_default().unwrap();
        assert_eq!(cfg.failure_threshold, 4);
        std::env::remove_var(ENV_PATH);
    }

    #[test]
    fn handle_reload_swaps_atomically() {
        let handle = ConfigHandle::new(SchedulerConfig::default());
        let before = handle.current();

        let mut next = SchedulerConfig::default();
        next.failure_threshold = 9;
        handle.reload(next);

        // The old snapshot is untouched; new readers see the swap.
        assert_eq!(before.failure_threshold, 3);
        assert_eq!(handle.current().failure_threshold, 9);
    }

    #[test]
    fn zero_attempt_config_is_rejected() {
        let mut cfg = SchedulerConfig::default();
        cfg.digest.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
