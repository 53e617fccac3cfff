// src/store.rs
//! # Channel Store
//! Persistence seam for channel records. The scheduling core only needs four
//! operations: bulk reconciliation against an external listing, the active
//! projection per source type, the full list for status reporting, and a
//! single-record update after each poll. The store is assumed durable and
//! consistent across restarts; the in-memory directory is a cache rebuilt
//! from it.

use crate::channel::{ChannelRecord, SourceType};
use crate::sync::ChannelListing;
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;

#[async_trait::async_trait]
pub trait ChannelStore: Send + Sync {
    /// Upsert every channel present in the listing (counters preserved,
    /// marked active) and deactivate records no longer listed. Channels are
    /// never deleted. Returns the number of newly created records.
    async fn reconcile(&self, listing: &ChannelListing) -> Result<usize>;

    /// Active channels grouped by source type.
    async fn load_active(&self) -> Result<BTreeMap<SourceType, Vec<ChannelRecord>>>;

    /// Every known channel, active or not.
    async fn load_all(&self) -> Result<Vec<ChannelRecord>>;

    /// Persist one record after its counters changed.
    async fn update_channel(&self, record: &ChannelRecord) -> Result<()>;
}

/// In-memory store for tests and the demo binary. Keyed by
/// `(source type, url)`, matching the reconciliation identity.
#[derive(Default)]
pub struct MemoryStore {
    channels: std::sync::Mutex<BTreeMap<(SourceType, String), ChannelRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with pre-built records (tests).
    pub fn with_channels(records: Vec<ChannelRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.channels.lock().expect("memory store mutex poisoned");
            for record in records {
                map.insert((record.source_type, record.url.clone()), record);
            }
        }
        store
    }

    pub fn get(&self, source: SourceType, url: &str) -> Option<ChannelRecord> {
        self.channels
            .lock()
            .expect("memory store mutex poisoned")
            .get(&(source, url.to_string()))
            .cloned()
    }
}

#[async_trait::async_trait]
impl ChannelStore for MemoryStore {
    async fn reconcile(&self, listing: &ChannelListing) -> Result<usize> {
        let mut map = self.channels.lock().expect("memory store mutex poisoned");
        let mut created = 0usize;
        let mut seen: Vec<(SourceType, String)> = Vec::new();
        let now = Utc::now();

        for (source, listed) in listing {
            for entry in listed {
                let key = (*source, entry.url.clone());
                seen.push(key.clone());
                match map.get_mut(&key) {
                    Some(existing) => {
                        existing.external_id = entry.external_id.clone();
                        existing.origin_sheet = entry.origin_sheet.clone();
                        existing.origin_row = entry.origin_row;
                        existing.last_synced_at = Some(now);
                        existing.is_active = true;
                    }
                    None => {
                        let mut record =
                            ChannelRecord::new(*source, entry.url.clone(), entry.external_id.clone())
                                .with_origin(entry.origin_sheet.clone(), entry.origin_row);
                        record.last_synced_at = Some(now);
                        map.insert(key, record);
                        created += 1;
                    }
                }
            }
        }

        // Channels that vanished from the listing stay on record, inactive.
        for (key, record) in map.iter_mut() {
            if !seen.contains(key) {
                record.is_active = false;
            }
        }

        Ok(created)
    }

    async fn load_active(&self) -> Result<BTreeMap<SourceType, Vec<ChannelRecord>>> {
        let map = self.channels.lock().expect("memory store mutex poisoned");
        let mut out: BTreeMap<SourceType, Vec<ChannelRecord>> = BTreeMap::new();
        for record in map.values().filter(|r| r.is_active) {
            out.entry(record.source_type).or_default().push(record.clone());
        }
        Ok(out)
    }

    async fn load_all(&self) -> Result<Vec<ChannelRecord>> {
        let map = self.channels.lock().expect("memory store mutex poisoned");
        Ok(map.values().cloned().collect())
    }

    async fn update_channel(&self, record: &ChannelRecord) -> Result<()> {
        let mut map = self.channels.lock().expect("memory store mutex poisoned");
        map.insert((record.source_type, record.url.clone()), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ListedChannel;

    fn listing(urls: &[&str]) -> ChannelListing {
        let listed = urls
            .iter()
            .map(|u| ListedChannel::new(*u, *u).with_origin("sheet1", 1))
            .collect();
        BTreeMap::from([(SourceType::Telegram, listed)])
    }

    #[tokio::test]
    async fn reconcile_upserts_and_preserves_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.reconcile(&listing(&["a", "b"])).await.unwrap(), 2);

        // Accumulate some history on "a".
        let mut rec = store.get(SourceType::Telegram, "a").unwrap();
        rec.success_count = 7;
        store.update_channel(&rec).await.unwrap();

        // Second pass drops "b", keeps "a".
        assert_eq!(store.reconcile(&listing(&["a"])).await.unwrap(), 0);

        let a = store.get(SourceType::Telegram, "a").unwrap();
        assert!(a.is_active);
        assert_eq!(a.success_count, 7);

        let b = store.get(SourceType::Telegram, "b").unwrap();
        assert!(!b.is_active, "unlisted channel is deactivated, not deleted");

        let active = store.load_active().await.unwrap();
        assert_eq!(active[&SourceType::Telegram].len(), 1);
        assert_eq!(store.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn relisting_reactivates_a_deactivated_channel() {
        let store = MemoryStore::new();
        store.reconcile(&listing(&["a"])).await.unwrap();

        let mut rec = store.get(SourceType::Telegram, "a").unwrap();
        rec.is_active = false;
        rec.failure_count = 3;
        store.update_channel(&rec).await.unwrap();

        store.reconcile(&listing(&["a"])).await.unwrap();
        let a = store.get(SourceType::Telegram, "a").unwrap();
        assert!(a.is_active);
        assert_eq!(a.failure_count, 3, "counters survive reconciliation");
    }
}
