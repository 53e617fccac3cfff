// src/channel.rs
//! # Channel Records
//! Core data types for polled channels: the source-type enumeration, the
//! per-channel record with its rolling statistics, and the ephemeral outcome
//! of a single poll. Outcome folding lives here so the bookkeeping rules
//! (weighted score mean, failure-threshold deactivation) are testable without
//! any scheduler running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of channel. Each source type shares one poller implementation
/// and one poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Telegram,
    Twitter,
    Youtube,
    Reddit,
}

impl SourceType {
    /// All known source types, in stable order.
    pub const ALL: [SourceType; 4] = [
        SourceType::Telegram,
        SourceType::Twitter,
        SourceType::Youtube,
        SourceType::Reddit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Telegram => "telegram",
            SourceType::Twitter => "twitter",
            SourceType::Youtube => "youtube",
            SourceType::Reddit => "reddit",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telegram" => Ok(SourceType::Telegram),
            "twitter" => Ok(SourceType::Twitter),
            "youtube" => Ok(SourceType::Youtube),
            "reddit" => Ok(SourceType::Reddit),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

/// Ephemeral result of one channel visit. Folded into the [`ChannelRecord`]
/// immediately; never persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOutcome {
    pub success: bool,
    pub item_count: u64,
    /// Average relevance score of the items collected in this poll.
    pub avg_item_score: f64,
}

impl PollOutcome {
    pub fn failure() -> Self {
        Self {
            success: false,
            item_count: 0,
            avg_item_score: 0.0,
        }
    }

    pub fn success(item_count: u64, avg_item_score: f64) -> Self {
        Self {
            success: true,
            item_count,
            avg_item_score,
        }
    }
}

/// One polled source endpoint and its rolling statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub source_type: SourceType,
    pub url: String,
    /// Identifier extracted from the URL (account handle, channel id, ...).
    pub external_id: String,
    pub is_active: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub items_collected: u64,
    /// Running weighted mean of per-poll average relevance.
    pub avg_score: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    // Provenance only; never used for scheduling decisions.
    pub origin_sheet: String,
    pub origin_row: u32,
}

impl ChannelRecord {
    pub fn new(source_type: SourceType, url: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source_type,
            url: url.into(),
            external_id: external_id.into(),
            is_active: true,
            success_count: 0,
            failure_count: 0,
            items_collected: 0,
            avg_score: 0.0,
            last_processed_at: None,
            last_synced_at: None,
            origin_sheet: String::new(),
            origin_row: 0,
        }
    }

    pub fn with_origin(mut self, sheet: impl Into<String>, row: u32) -> Self {
        self.origin_sheet = sheet.into();
        self.origin_row = row;
        self
    }

    /// Fold one poll outcome into this record.
    ///
    /// On success the score mean is reweighted by item counts:
    /// `(prev_avg * prev_items + new_avg * new_count) / total_items`.
    /// On failure the counter is bumped and, once it reaches
    /// `failure_threshold`, the channel is deactivated exactly once; an
    /// already-inactive channel is never deactivated (or logged) again.
    pub fn apply_outcome(&mut self, outcome: &PollOutcome, failure_threshold: u64) {
        self.last_processed_at = Some(Utc::now());

        if outcome.success {
            self.success_count += 1;

            if outcome.item_count > 0 {
                let prev_items = self.items_collected;
                self.items_collected += outcome.item_count;
                let total = self.avg_score * prev_items as f64
                    + outcome.avg_item_score * outcome.item_count as f64;
                self.avg_score = total / self.items_collected as f64;
            }
            return;
        }

        self.failure_count += 1;
        if self.failure_count >= failure_threshold && self.is_active {
            self.is_active = false;
            tracing::warn!(
                source = %self.source_type,
                channel = %self.external_id,
                failures = self.failure_count,
                "channel deactivated after repeated failures"
            );
        }
    }

    /// Success rate in percent over all attempts; 0.0 with no attempts.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64 * 100.0
        }
    }
}
