//! Helpers behind `windctl`, kept out of `main.rs` so they can be tested.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use formats::{UvImage, UvSampler};
use foundation::time::{TimeKey, bracket, hours_from_millis, now_hours};

/// Hours since the epoch from `now`, a bare number of hours, an RFC 3339
/// timestamp or `YYYY-MM-DDTHH:MM`, taken as UTC.
pub fn parse_time(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if s == "now" {
        return Ok(now_hours());
    }
    if let Ok(hours) = s.parse::<f64>() {
        return Ok(hours);
    }
    let millis = if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        t.timestamp_millis()
    } else {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
            .map_err(|e| format!("bad time {s:?}: {e}"))?
            .and_utc()
            .timestamp_millis()
    };
    Ok(hours_from_millis(millis as f64))
}

pub fn format_time(hours: f64) -> String {
    let millis = (hours * 3_600_000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%dT%H:%M").to_string())
        .unwrap_or_else(|| format!("{hours}h"))
}

/// `from`, `from + step`, .. up to and including `to`.
pub fn time_steps(from: f64, to: f64, step: f64) -> Result<Vec<f64>, String> {
    if step.is_nan() || step <= 0.0 {
        return Err(format!("step must be positive, got {step}"));
    }
    if to < from {
        return Err("end is before start".to_string());
    }
    let n = ((to - from) / step + 1e-9).floor() as u64;
    Ok((0..=n).map(|i| from + i as f64 * step).collect())
}

/// Snapshot keys needed to sample every time in `times`.
pub fn keys_for(times: &[f64]) -> Vec<TimeKey> {
    let mut keys: Vec<TimeKey> = times
        .iter()
        .flat_map(|t| {
            let (a, b) = bracket(*t);
            [a, b]
        })
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: f64,
    pub uv: [f32; 2],
}

impl Sample {
    pub fn speed(&self) -> f32 {
        self.uv[0].hypot(self.uv[1])
    }

    /// Meteorological direction the wind blows from, degrees clockwise
    /// from north.
    pub fn direction(&self) -> f32 {
        let [u, v] = self.uv;
        (270.0 - v.atan2(u).to_degrees()).rem_euclid(360.0)
    }
}

/// u/v at `coord` for each time whose bracketing snapshots are present.
pub fn sample_series(
    sampler: &UvSampler,
    images: &BTreeMap<TimeKey, UvImage>,
    coord: [f64; 2],
    times: &[f64],
) -> Vec<Sample> {
    times
        .iter()
        .filter_map(|&time| {
            let (a, b) = bracket(time);
            let uv = sampler.sample_between(
                images.get(&a)?,
                images.get(&b)?,
                coord,
                (time - a as f64) as f32,
            );
            Some(Sample { time, uv })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Sample, format_time, keys_for, parse_time, sample_series, time_steps};
    use formats::{UvImage, UvSampler};
    use foundation::bounds::GeoBounds;
    use pretty_assertions::assert_eq;

    #[test]
    fn times_parse_in_several_forms() {
        assert_eq!(parse_time("474600").unwrap(), 474600.0);
        assert_eq!(parse_time("2024-03-01T00:00:00Z").unwrap(), 474_792.0);
        assert_eq!(parse_time("2024-03-01T06:00").unwrap(), 474_798.0);
        assert!(parse_time("yesterday").is_err());
        assert_eq!(format_time(474_798.5), "2024-03-01T06:30");
    }

    #[test]
    fn steps_include_both_ends() {
        assert_eq!(time_steps(10.0, 11.0, 0.5).unwrap(), vec![10.0, 10.5, 11.0]);
        assert!(time_steps(10.0, 9.0, 1.0).is_err());
        assert!(time_steps(10.0, 11.0, 0.0).is_err());
        assert_eq!(keys_for(&[10.0, 10.5, 11.0]), vec![10, 11]);
    }

    #[test]
    fn series_skips_times_without_data() {
        let bounds = GeoBounds::new(-180.0, -90.0, 180.0, 90.0);
        let sampler = UvSampler::new([4, 2], &bounds);
        let mut images = BTreeMap::new();
        images.insert(10, UvImage::from_fn(4, 2, |_, _| [4.0, 0.0]));
        images.insert(11, UvImage::from_fn(4, 2, |_, _| [8.0, 0.0]));

        let series = sample_series(&sampler, &images, [0.0, 0.0], &[10.5, 11.5]);
        assert_eq!(series.len(), 1);
        assert!((series[0].uv[0] - 6.0).abs() < 0.05);
        assert!(series[0].uv[1].abs() < 0.05);
    }

    #[test]
    fn direction_is_where_the_wind_comes_from() {
        let westerly = Sample {
            time: 0.0,
            uv: [5.0, 0.0],
        };
        assert_eq!(westerly.direction(), 270.0);
        assert_eq!(westerly.speed(), 5.0);
        let southerly = Sample {
            time: 0.0,
            uv: [0.0, 5.0],
        };
        assert!((southerly.direction() - 180.0).abs() < 1e-3);
    }
}
