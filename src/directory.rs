// src/directory.rs
//! # Channel Directory
//! In-memory projection of the persisted channel records, grouped by source
//! type, with one rotation cursor per source. This is a plain struct with no
//! interior locking: the poll engine wraps it in a `Mutex` and every mutating
//! call completes without suspension, which is what makes cursor updates
//! atomic with respect to the other source loops.

use crate::channel::{ChannelRecord, PollOutcome, SourceType};
use std::collections::BTreeMap;

/// `source type -> ordered channel list` plus per-source rotation cursors.
///
/// The cursor for a source is always within `[0, active_len]`. It resets to 0
/// whenever the lists are refreshed and, in wrapping mode, on wraparound.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    channels: BTreeMap<SourceType, Vec<ChannelRecord>>,
    cursors: BTreeMap<SourceType, usize>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the per-source lists with a freshly loaded projection and
    /// reset every cursor to the start of its rotation.
    pub fn refresh(&mut self, channels: BTreeMap<SourceType, Vec<ChannelRecord>>) {
        self.cursors.clear();
        for source in channels.keys() {
            self.cursors.insert(*source, 0);
        }
        self.channels = channels;
    }

    /// Deterministic round-robin selection.
    ///
    /// Returns `None` when the source has no active channels, or — with
    /// `wrap=false` — when every active channel has already been served once
    /// since the last refresh. With `wrap=true` the cursor resets to 0 at the
    /// end of the list and rotation continues forever.
    pub fn next_channel(&mut self, source: SourceType, wrap: bool) -> Option<ChannelRecord> {
        let channels = self.channels.get(&source)?;
        let active: Vec<&ChannelRecord> = channels.iter().filter(|ch| ch.is_active).collect();
        if active.is_empty() {
            tracing::warn!(source = %source, "no active channels");
            return None;
        }

        let cursor = self.cursors.entry(source).or_insert(0);
        if *cursor >= active.len() {
            if wrap {
                *cursor = 0;
            } else {
                tracing::debug!(source = %source, "all channels served for this pass");
                return None;
            }
        }

        let picked = active[*cursor].clone();
        tracing::debug!(
            source = %source,
            channel = %picked.external_id,
            index = *cursor,
            of = active.len(),
            "next channel"
        );
        *cursor += 1;
        Some(picked)
    }

    /// True iff every requested source present in the directory has served
    /// all of its active channels since the last refresh.
    pub fn all_exhausted(&self, sources: &[SourceType]) -> bool {
        for source in sources {
            let Some(channels) = self.channels.get(source) else {
                continue;
            };
            let active_len = channels.iter().filter(|ch| ch.is_active).count();
            let cursor = self.cursors.get(source).copied().unwrap_or(0);
            if cursor < active_len {
                return false;
            }
        }
        true
    }

    /// Fold a poll outcome into the matching record and return the updated
    /// copy so the caller can persist it.
    pub fn record_outcome(
        &mut self,
        source: SourceType,
        url: &str,
        outcome: &PollOutcome,
        failure_threshold: u64,
    ) -> Option<ChannelRecord> {
        let channel = self
            .channels
            .get_mut(&source)?
            .iter_mut()
            .find(|ch| ch.url == url)?;
        channel.apply_outcome(outcome, failure_threshold);
        Some(channel.clone())
    }

    /// Reset one source for a fresh start: cursor back to 0, failure counters
    /// cleared, every channel reactivated. Backs `restart_source`.
    pub fn reset_source(&mut self, source: SourceType) {
        self.cursors.insert(source, 0);
        if let Some(channels) = self.channels.get_mut(&source) {
            for ch in channels.iter_mut() {
                ch.failure_count = 0;
                ch.is_active = true;
            }
        }
    }

    /// Majority-unhealthy check: true iff more than half of the source's
    /// channels have accumulated `failure_threshold` or more failures.
    pub fn unhealthy(&self, source: SourceType, failure_threshold: u64) -> bool {
        let Some(channels) = self.channels.get(&source) else {
            return false;
        };
        if channels.is_empty() {
            return false;
        }
        let failing = channels
            .iter()
            .filter(|ch| ch.failure_count >= failure_threshold)
            .count();
        failing * 2 > channels.len()
    }

    /// `(total, active)` channel counts for one source.
    pub fn counts(&self, source: SourceType) -> (usize, usize) {
        match self.channels.get(&source) {
            Some(channels) => {
                let active = channels.iter().filter(|ch| ch.is_active).count();
                (channels.len(), active)
            }
            None => (0, 0),
        }
    }

    /// Iterate the per-source lists (status aggregation).
    pub fn iter(&self) -> impl Iterator<Item = (&SourceType, &Vec<ChannelRecord>)> {
        self.channels.iter()
    }

    pub fn sources(&self) -> Vec<SourceType> {
        self.channels.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(urls: &[&str]) -> ChannelDirectory {
        let mut dir = ChannelDirectory::new();
        let list = urls
            .iter()
            .map(|u| ChannelRecord::new(SourceType::Twitter, *u, *u))
            .collect();
        dir.refresh(BTreeMap::from([(SourceType::Twitter, list)]));
        dir
    }

    #[test]
    fn wrapping_rotation_cycles_without_skips_or_repeats() {
        let mut dir = directory(&["a", "b", "c"]);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(dir.next_channel(SourceType::Twitter, true).unwrap().url);
        }
        assert_eq!(seen, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn non_wrapping_exhausts_after_one_full_pass() {
        let mut dir = directory(&["a", "b"]);
        assert!(!dir.all_exhausted(&[SourceType::Twitter]));

        assert!(dir.next_channel(SourceType::Twitter, false).is_some());
        assert!(dir.next_channel(SourceType::Twitter, false).is_some());
        assert!(dir.next_channel(SourceType::Twitter, false).is_none());
        assert!(dir.all_exhausted(&[SourceType::Twitter]));

        // A refresh resets the pass.
        let list = vec![ChannelRecord::new(SourceType::Twitter, "a", "a")];
        dir.refresh(BTreeMap::from([(SourceType::Twitter, list)]));
        assert!(!dir.all_exhausted(&[SourceType::Twitter]));
        assert!(dir.next_channel(SourceType::Twitter, false).is_some());
    }

    #[test]
    fn empty_source_yields_none() {
        let mut dir = ChannelDirectory::new();
        assert!(dir.next_channel(SourceType::Reddit, true).is_none());

        dir.refresh(BTreeMap::from([(SourceType::Reddit, Vec::new())]));
        assert!(dir.next_channel(SourceType::Reddit, true).is_none());
        // A source with no channels does not block exhaustion.
        assert!(dir.all_exhausted(&[SourceType::Reddit]));
    }

    #[test]
    fn inactive_channels_are_skipped_by_selection() {
        let mut dir = ChannelDirectory::new();
        let mut b = ChannelRecord::new(SourceType::Twitter, "b", "b");
        b.is_active = false;
        let list = vec![
            ChannelRecord::new(SourceType::Twitter, "a", "a"),
            b,
            ChannelRecord::new(SourceType::Twitter, "c", "c"),
        ];
        dir.refresh(BTreeMap::from([(SourceType::Twitter, list)]));

        let first = dir.next_channel(SourceType::Twitter, false).unwrap();
        let second = dir.next_channel(SourceType::Twitter, false).unwrap();
        assert_eq!(first.url, "a");
        assert_eq!(second.url, "c");
        assert!(dir.next_channel(SourceType::Twitter, false).is_none());
    }

    #[test]
    fn outcome_folding_goes_through_the_directory() {
        let mut dir = directory(&["a"]);
        let updated = dir
            .record_outcome(SourceType::Twitter, "a", &PollOutcome::success(2, 0.5), 3)
            .unwrap();
        assert_eq!(updated.success_count, 1);
        assert_eq!(updated.items_collected, 2);

        assert!(dir
            .record_outcome(SourceType::Twitter, "nope", &PollOutcome::failure(), 3)
            .is_none());
    }

    #[test]
    fn unhealthy_needs_a_strict_majority() {
        let mut dir = directory(&["a", "b", "c", "d"]);
        for url in ["a", "b"] {
            for _ in 0..3 {
                dir.record_outcome(SourceType::Twitter, url, &PollOutcome::failure(), 3);
            }
        }
        // 2 of 4 failing is not a majority.
        assert!(!dir.unhealthy(SourceType::Twitter, 3));

        for _ in 0..3 {
            dir.record_outcome(SourceType::Twitter, "c", &PollOutcome::failure(), 3);
        }
        assert!(dir.unhealthy(SourceType::Twitter, 3));
    }

    #[test]
    fn reset_source_reactivates_and_rewinds() {
        let mut dir = directory(&["a", "b"]);
        for _ in 0..3 {
            dir.record_outcome(SourceType::Twitter, "a", &PollOutcome::failure(), 3);
        }
        dir.next_channel(SourceType::Twitter, false);
        dir.reset_source(SourceType::Twitter);

        let (total, active) = dir.counts(SourceType::Twitter);
        assert_eq!((total, active), (2, 2));
        assert_eq!(
            dir.next_channel(SourceType::Twitter, false).unwrap().url,
            "a"
        );
    }
}
