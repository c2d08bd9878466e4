use foundation::bounds::GeoBounds;
use serde::{Deserialize, Serialize};

use crate::uv::DecodeError;

/// Metadata describing the raster grid every snapshot of a scope shares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindMeta {
    /// Reference date of the prediction run, ISO 8601.
    pub date: String,
    pub width: u32,
    pub height: u32,
    /// Largest absolute u or v component in the data, m/s.
    pub uv_max: f64,
    pub bounds: GeoBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<[f64; 9]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl WindMeta {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError::Meta)
    }

    pub fn data_size(&self) -> [u32; 2] {
        [self.width, self.height]
    }

    /// Magnitude bound of a vector whose components are both `uv_max`.
    pub fn speed_max(&self) -> f64 {
        (2.0 * self.uv_max * self.uv_max).sqrt()
    }
}
