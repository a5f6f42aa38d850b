//! In-process store with the same commit semantics as the PostgreSQL backend.
//!
//! Used by tests and the integration suite. Supports fault injection on
//! commits and counts every mutation so callers can assert on write volume.

use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;

use super::{EntityTotal, PresenceSample, RollupCommit, StoreError, TotalsStore};
use crate::rollup::quorum::{bucket_samples, HourBucket};
use crate::rollup::watermark::{check_advance, epoch, hour_is_pending};

#[derive(Debug, Default)]
struct Inner {
    samples: Vec<PresenceSample>,
    totals: BTreeMap<String, EntityTotal>,
    writes: u64,
    failing_entities: HashSet<String>,
    unavailable: bool,
    clock: Option<NaiveDateTime>,
}

/// In-memory samples and totals.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends samples, as the external producer would.
    pub fn insert_samples<I>(&self, samples: I)
    where
        I: IntoIterator<Item = PresenceSample>,
    {
        self.inner.lock().samples.extend(samples);
    }

    /// Installs a totals row directly, bypassing the rollup.
    pub fn put_total(&self, total: EntityTotal) {
        self.inner
            .lock()
            .totals
            .insert(total.entity_id.clone(), total);
    }

    /// Snapshot of all totals rows, ordered by entity.
    pub fn totals(&self) -> Vec<EntityTotal> {
        self.inner.lock().totals.values().cloned().collect()
    }

    /// Number of committed mutations so far.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }

    /// Makes every commit for `entity_id` fail until cleared.
    pub fn fail_commits_for(&self, entity_id: &str) {
        self.inner
            .lock()
            .failing_entities
            .insert(entity_id.to_string());
    }

    /// Pins the store clock; until set, it follows UTC wall time.
    pub fn set_now(&self, now: NaiveDateTime) {
        self.inner.lock().clock = Some(now);
    }

    /// Makes every operation fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock();
        inner.failing_entities.clear();
        inner.unavailable = false;
    }
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn watermark(&self, entity_id: &str) -> NaiveDateTime {
        self.totals
            .get(entity_id)
            .map(|t| t.watermark)
            .unwrap_or_else(epoch)
    }
}

impl TotalsStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        self.inner.lock().check_available()
    }

    async fn now(&self) -> Result<NaiveDateTime, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.clock.unwrap_or_else(|| Utc::now().naive_utc()))
    }

    async fn pending_buckets(&self, cutoff: NaiveDateTime) -> Result<Vec<HourBucket>, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;

        let pending = inner.samples.iter().filter(|s| {
            let watermark = inner.watermark(&s.entity_id);
            s.sample_time > watermark
                && hour_is_pending(s.calendar_date, s.hour_of_day, watermark, cutoff)
        });

        Ok(bucket_samples(pending))
    }

    async fn read_watermark(&self, entity_id: &str) -> Result<NaiveDateTime, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.watermark(entity_id))
    }

    async fn commit(&self, commit: &RollupCommit) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        if inner.failing_entities.contains(&commit.entity_id) {
            return Err(StoreError::Unavailable(format!(
                "injected commit failure for {}",
                commit.entity_id
            )));
        }

        // All checks happen before any mutation, so a rejected commit leaves
        // the row exactly as it was.
        let current = inner.watermark(&commit.entity_id);
        check_advance(&commit.entity_id, current, commit.watermark)?;

        let row = inner
            .totals
            .entry(commit.entity_id.clone())
            .or_insert_with(|| EntityTotal {
                entity_id: commit.entity_id.clone(),
                total_hours: 0,
                watermark: epoch(),
                updated_at: commit.updated_at,
            });
        row.total_hours += commit.delta_hours;
        row.watermark = commit.watermark;
        row.updated_at = commit.updated_at;
        inner.writes += 1;

        Ok(())
    }

    async fn total(&self, entity_id: &str) -> Result<Option<EntityTotal>, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.totals.get(entity_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ts(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .expect("valid time")
    }

    fn sample(entity: &str, hour: u32, minute: u32) -> PresenceSample {
        let t = ts(hour, minute);
        PresenceSample {
            entity_id: entity.to_string(),
            calendar_date: t.date(),
            hour_of_day: hour as u8,
            sample_time: t,
        }
    }

    fn commit(entity: &str, delta: i64, watermark: NaiveDateTime) -> RollupCommit {
        RollupCommit {
            entity_id: entity.to_string(),
            delta_hours: delta,
            watermark,
            updated_at: ts(23, 0),
        }
    }

    #[tokio::test]
    async fn test_pending_buckets_by_hour_key() {
        let store = MemoryStore::new();
        store.insert_samples([
            sample("b", 9, 0),
            sample("a", 9, 30),
            sample("a", 9, 10),
            sample("a", 10, 5),
            sample("a", 10, 15),
            sample("a", 11, 0),
        ]);
        store
            .commit(&commit("a", 0, ts(9, 10)))
            .await
            .expect("commit");

        // Hour 9 of "a" holds the watermark, so its 9:30 sample stays closed.
        let pending = store.pending_buckets(ts(12, 10)).await.expect("pending");
        let keys: Vec<(&str, u8, u32)> = pending
            .iter()
            .map(|b| (b.key.entity_id.as_str(), b.key.hour_of_day, b.sample_count))
            .collect();
        assert_eq!(keys, vec![("a", 10, 2), ("a", 11, 1), ("b", 9, 1)]);
        assert_eq!(pending[0].bucket_time, ts(10, 15));

        let bounded = store.pending_buckets(ts(11, 0)).await.expect("pending");
        assert_eq!(bounded.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_skips_invalid_hours() {
        let store = MemoryStore::new();
        let mut bad = sample("a", 9, 0);
        bad.hour_of_day = 24;
        store.insert_samples([bad, sample("a", 9, 5)]);

        let pending = store.pending_buckets(ts(12, 0)).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sample_count, 1);
    }

    #[tokio::test]
    async fn test_clock_can_be_pinned() {
        let store = MemoryStore::new();
        assert!(store.now().await.expect("now") > ts(0, 0));

        store.set_now(ts(10, 25));
        assert_eq!(store.now().await.expect("now"), ts(10, 25));
    }

    #[tokio::test]
    async fn test_commit_seeds_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.read_watermark("a").await.expect("read"), epoch());

        store.commit(&commit("a", 2, ts(9, 0))).await.expect("commit");
        store.commit(&commit("a", 1, ts(10, 0))).await.expect("commit");

        let total = store.total("a").await.expect("total").expect("row");
        assert_eq!(total.total_hours, 3);
        assert_eq!(total.watermark, ts(10, 0));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_regressing_commit_leaves_row_untouched() {
        let store = MemoryStore::new();
        store.commit(&commit("a", 2, ts(10, 0))).await.expect("commit");

        let err = store
            .commit(&commit("a", 5, ts(9, 0)))
            .await
            .expect_err("regression");
        assert!(matches!(err, StoreError::Watermark(_)));

        let total = store.total("a").await.expect("total").expect("row");
        assert_eq!(total.total_hours, 2);
        assert_eq!(total.watermark, ts(10, 0));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        store.fail_commits_for("a");
        assert!(store.commit(&commit("a", 1, ts(9, 0))).await.is_err());
        assert!(store.commit(&commit("b", 1, ts(9, 0))).await.is_ok());

        store.set_unavailable(true);
        assert!(store.prepare().await.is_err());
        assert!(store.pending_buckets(ts(12, 0)).await.is_err());
        assert!(store.now().await.is_err());

        store.clear_faults();
        assert!(store.prepare().await.is_ok());
        assert!(store.commit(&commit("a", 1, ts(9, 0))).await.is_ok());
        assert!(store.total("a").await.expect("total").is_some());
    }
}
