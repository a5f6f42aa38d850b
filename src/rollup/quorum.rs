//! Hourly quorum filter.
//!
//! Groups presence samples into per-entity, per-calendar-hour buckets. A bucket
//! counts as one active hour only when it holds at least `quorum` samples, which
//! rejects transient observations without requiring full-hour coverage.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};

use crate::store::PresenceSample;

/// Default minimum number of samples for an hour to count as active.
pub const DEFAULT_QUORUM: u32 = 3;

/// Identity of one hour bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub entity_id: String,
    pub calendar_date: NaiveDate,
    pub hour_of_day: u8,
}

/// Samples for one entity within one calendar hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourBucket {
    pub key: BucketKey,
    /// Number of samples carrying this key.
    pub sample_count: u32,
    /// Latest `sample_time` in the bucket; the watermark candidate.
    pub bucket_time: NaiveDateTime,
}

impl HourBucket {
    /// Returns true when the bucket meets the quorum.
    pub fn is_valid(&self, quorum: u32) -> bool {
        self.sample_count >= quorum
    }
}

/// Groups samples into hour buckets, ordered by key.
///
/// Callers are expected to pass only samples newer than each entity's
/// watermark; the filter itself has no notion of watermarks.
pub fn bucket_samples<'a, I>(samples: I) -> Vec<HourBucket>
where
    I: IntoIterator<Item = &'a PresenceSample>,
{
    let mut buckets: BTreeMap<BucketKey, (u32, NaiveDateTime)> = BTreeMap::new();

    for sample in samples {
        let key = BucketKey {
            entity_id: sample.entity_id.clone(),
            calendar_date: sample.calendar_date,
            hour_of_day: sample.hour_of_day,
        };

        buckets
            .entry(key)
            .and_modify(|(count, latest)| {
                *count = count.saturating_add(1);
                if sample.sample_time > *latest {
                    *latest = sample.sample_time;
                }
            })
            .or_insert((1, sample.sample_time));
    }

    buckets
        .into_iter()
        .map(|(key, (sample_count, bucket_time))| HourBucket {
            key,
            sample_count,
            bucket_time,
        })
        .collect()
}

/// Per-entity outcome of filtering one batch of buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBuckets {
    pub entity_id: String,
    /// Buckets that met the quorum.
    pub valid: u32,
    /// Buckets considered in total, valid or not.
    pub considered: u32,
    /// Max `bucket_time` over every considered bucket.
    pub latest: NaiveDateTime,
}

/// Folds ordered buckets into one summary per entity.
///
/// Sub-quorum buckets still move `latest` forward so an hour that has been
/// looked at is never revisited.
pub fn summarize(buckets: &[HourBucket], quorum: u32) -> Vec<EntityBuckets> {
    let mut by_entity: BTreeMap<&str, EntityBuckets> = BTreeMap::new();

    for bucket in buckets {
        let valid = u32::from(bucket.is_valid(quorum));
        by_entity
            .entry(bucket.key.entity_id.as_str())
            .and_modify(|summary| {
                summary.valid += valid;
                summary.considered += 1;
                if bucket.bucket_time > summary.latest {
                    summary.latest = bucket.bucket_time;
                }
            })
            .or_insert_with(|| EntityBuckets {
                entity_id: bucket.key.entity_id.clone(),
                valid,
                considered: 1,
                latest: bucket.bucket_time,
            });
    }

    by_entity.into_values().collect()
}
