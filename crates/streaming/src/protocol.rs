//! Query parameters shared by the metadata and snapshot endpoints.
//!
//! Both endpoints take the same UTC calendar hour:
//! `?scope=<scope>&year=<yyyy>&month=<1-12>&day=<1-31>&hour=<0-23>`.

use foundation::time::{TimeKey, UtcHour};
use serde::{Deserialize, Serialize};

pub const DEFAULT_META_ENDPOINT: &str = "getWindPredictionMeta";
pub const DEFAULT_DATA_ENDPOINT: &str = "getWindPrediction";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub scope: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl QueryParams {
    /// `None` for keys outside the representable calendar range.
    pub fn for_key(scope: &str, key: TimeKey) -> Option<Self> {
        let UtcHour {
            year,
            month,
            day,
            hour,
        } = UtcHour::from_key(key)?;
        Some(Self {
            scope: scope.to_string(),
            year,
            month,
            day,
            hour,
        })
    }

    pub fn pairs(&self) -> [(&'static str, String); 5] {
        [
            ("scope", self.scope.clone()),
            ("year", self.year.to_string()),
            ("month", self.month.to_string()),
            ("day", self.day.to_string()),
            ("hour", self.hour.to_string()),
        ]
    }
}

/// Human-readable request line for logs and errors. Not URL-encoded.
pub fn describe(host: &str, endpoint: &str, params: &QueryParams) -> String {
    let query = params
        .pairs()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}/{endpoint}?{query}", host.trim_end_matches('/'))
}
