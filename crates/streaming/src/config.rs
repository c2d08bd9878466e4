use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_DATA_ENDPOINT, DEFAULT_META_ENDPOINT};

/// Everything a `TimeSource` needs besides its loader.
///
/// Deserializable with defaults so hosts can pass partial JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSourceConfig {
    pub host: String,
    pub scope: String,
    pub meta_endpoint: String,
    pub data_endpoint: String,
    /// Distance in hours from the last snapped key beyond which the ring is
    /// re-centred on the nearest key.
    pub snap_threshold: f64,
    /// Encoded snapshot bytes kept in memory.
    pub cache_budget_bytes: usize,
}

impl Default for TimeSourceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            scope: String::new(),
            meta_endpoint: DEFAULT_META_ENDPOINT.to_string(),
            data_endpoint: DEFAULT_DATA_ENDPOINT.to_string(),
            snap_threshold: 2.0 / 3.0,
            cache_budget_bytes: 64 * 1024 * 1024,
        }
    }
}

impl TimeSourceConfig {
    pub fn new(host: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scope: scope.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimeSourceConfig;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: TimeSourceConfig =
            serde_json::from_str(r#"{"host":"http://h","scope":"eu","snap_threshold":0.75}"#)
                .unwrap();
        assert_eq!(cfg.meta_endpoint, "getWindPredictionMeta");
        assert_eq!(cfg.data_endpoint, "getWindPrediction");
        assert_eq!(cfg.snap_threshold, 0.75);
        assert_eq!(cfg.cache_budget_bytes, TimeSourceConfig::default().cache_budget_bytes);
    }
}
