//! Simulated time.
//!
//! Time is a real number of hours since the Unix epoch. Snapshots exist at
//! integer hours ("keys").

use chrono::{DateTime, Datelike, Timelike, Utc};

pub const SECOND_MS: f64 = 1000.0;
pub const HOUR_MS: f64 = 60.0 * 60.0 * SECOND_MS;
pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// Number of reprojected snapshots kept resident at once.
pub const RING_SIZE: usize = 3;

/// Integer hour index of a snapshot.
pub type TimeKey = i64;

pub fn hours_from_millis(ms: f64) -> f64 {
    ms / HOUR_MS
}

pub fn millis_from_hours(hours: f64) -> f64 {
    hours * HOUR_MS
}

/// Ring slot a key occupies.
pub fn ring_index(key: TimeKey) -> usize {
    key.rem_euclid(RING_SIZE as i64) as usize
}

/// The two keys bracketing `time`: `(floor, ceil)`.
pub fn bracket(time: f64) -> (TimeKey, TimeKey) {
    (time.floor() as TimeKey, time.ceil() as TimeKey)
}

/// UTC calendar hour of a snapshot key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UtcHour {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl UtcHour {
    pub fn from_key(key: TimeKey) -> Option<Self> {
        let date = DateTime::<Utc>::from_timestamp(key.checked_mul(3600)?, 0)?;
        Some(Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
            hour: date.hour(),
        })
    }
}

/// Current wall-clock time in hours since epoch.
pub fn now_hours() -> f64 {
    hours_from_millis(Utc::now().timestamp_millis() as f64)
}
