use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use thiserror::Error;

/// Watermark of an entity that has never been rolled up.
pub fn epoch() -> NaiveDateTime {
    DateTime::<Utc>::UNIX_EPOCH.naive_utc()
}

/// Rejected watermark movement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatermarkError {
    #[error("watermark for {entity_id} would regress from {current} to {proposed}")]
    Regression {
        entity_id: String,
        current: NaiveDateTime,
        proposed: NaiveDateTime,
    },
}

/// Truncates a timestamp to the start of its hour.
pub fn hour_floor(t: NaiveDateTime) -> NaiveDateTime {
    t.date().and_hms_opt(t.hour(), 0, 0).unwrap_or(t)
}

/// Start of the calendar hour named by a bucket key, or `None` if the hour is
/// outside 0-23.
pub fn hour_start(calendar_date: NaiveDate, hour_of_day: u8) -> Option<NaiveDateTime> {
    calendar_date.and_hms_opt(u32::from(hour_of_day), 0, 0)
}

/// Whether the hour `(calendar_date, hour_of_day)` is still eligible for a pass.
///
/// An hour is eligible when it starts after the hour holding `watermark`, so a
/// considered hour is never reopened by late samples, and before `cutoff`, the
/// start of the hour still being sampled. Eligibility is decided on the hour
/// key alone, so one calendar hour always lands in exactly one pass.
pub fn hour_is_pending(
    calendar_date: NaiveDate,
    hour_of_day: u8,
    watermark: NaiveDateTime,
    cutoff: NaiveDateTime,
) -> bool {
    match hour_start(calendar_date, hour_of_day) {
        Some(start) => start > hour_floor(watermark) && start < hour_floor(cutoff),
        None => false,
    }
}

/// Checks that moving `entity_id` from `current` to `proposed` keeps the
/// watermark non-decreasing.
pub fn check_advance(
    entity_id: &str,
    current: NaiveDateTime,
    proposed: NaiveDateTime,
) -> Result<(), WatermarkError> {
    if proposed < current {
        return Err(WatermarkError::Regression {
            entity_id: entity_id.to_string(),
            current,
            proposed,
        });
    }
    Ok(())
}
