// src/sync.rs
//! # Directory Sync
//! Reconciles the channel store against an external channel-list provider
//! (in production a spreadsheet; here anything implementing
//! [`ChannelListProvider`]). A failed fetch is never an error for the
//! caller: the directory falls back to the last state persisted in the
//! store, and the failure is logged as a warning.

use crate::channel::{ChannelRecord, SourceType};
use crate::store::ChannelStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One row of the external channel listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedChannel {
    pub url: String,
    pub external_id: String,
    pub origin_sheet: String,
    pub origin_row: u32,
}

impl ListedChannel {
    pub fn new(url: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            external_id: external_id.into(),
            origin_sheet: String::new(),
            origin_row: 0,
        }
    }

    pub fn with_origin(mut self, sheet: impl Into<String>, row: u32) -> Self {
        self.origin_sheet = sheet.into();
        self.origin_row = row;
        self
    }
}

/// Per-source listing as returned by the external provider.
pub type ChannelListing = BTreeMap<SourceType, Vec<ListedChannel>>;

#[async_trait::async_trait]
pub trait ChannelListProvider: Send + Sync {
    /// Fetch the full channel listing. May fail; the sync layer falls back
    /// to the persisted state.
    async fn fetch_all(&self) -> Result<ChannelListing>;
}

/// Fixed listing for demos and tests.
pub struct StaticListing {
    listing: ChannelListing,
}

impl StaticListing {
    pub fn new(listing: ChannelListing) -> Self {
        Self { listing }
    }
}

#[async_trait::async_trait]
impl ChannelListProvider for StaticListing {
    async fn fetch_all(&self) -> Result<ChannelListing> {
        Ok(self.listing.clone())
    }
}

/// Keeps the store in step with the external listing and hands out the
/// active projection the directory is rebuilt from.
pub struct DirectorySync {
    provider: Arc<dyn ChannelListProvider>,
    store: Arc<dyn ChannelStore>,
    sync_period: Duration,
    last_synced_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl DirectorySync {
    pub fn new(
        provider: Arc<dyn ChannelListProvider>,
        store: Arc<dyn ChannelStore>,
        sync_period: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            sync_period,
            last_synced_at: std::sync::Mutex::new(None),
        }
    }

    /// A sync is due on first use, after `sync_period`, or when forced.
    pub fn needs_sync(&self, force: bool) -> bool {
        if force {
            return true;
        }
        let last = self.last_synced_at.lock().expect("sync mutex poisoned");
        match *last {
            None => true,
            Some(at) => {
                let elapsed = Utc::now().signed_duration_since(at);
                elapsed.num_seconds() >= self.sync_period.as_secs() as i64
            }
        }
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.last_synced_at.lock().expect("sync mutex poisoned")
    }

    /// Reconcile (when due) and return the active projection. Fetch and
    /// persistence failures degrade to the last known state.
    pub async fn sync(&self, force: bool) -> BTreeMap<SourceType, Vec<ChannelRecord>> {
        if !self.needs_sync(force) {
            tracing::debug!("listing sync not due, loading persisted state");
            return self.load_active().await;
        }

        match self.provider.fetch_all().await {
            Ok(listing) if !listing.is_empty() => {
                match self.store.reconcile(&listing).await {
                    Ok(created) => {
                        *self.last_synced_at.lock().expect("sync mutex poisoned") =
                            Some(Utc::now());
                        tracing::info!(created, "channel listing reconciled");
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "listing reconciliation failed, keeping prior state");
                    }
                }
            }
            Ok(_) => {
                tracing::warn!("provider returned an empty listing, keeping prior state");
            }
            Err(e) => {
                tracing::warn!(error = ?e, "listing fetch failed, keeping prior state");
            }
        }

        self.load_active().await
    }

    async fn load_active(&self) -> BTreeMap<SourceType, Vec<ChannelRecord>> {
        match self.store.load_active().await {
            Ok(channels) => {
                let total: usize = channels.values().map(Vec::len).sum();
                tracing::debug!(total, "loaded active channels from store");
                channels
            }
            Err(e) => {
                tracing::error!(error = ?e, "loading channels from store failed");
                BTreeMap::new()
            }
        }
    }
}
