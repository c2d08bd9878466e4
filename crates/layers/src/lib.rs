pub mod error;
pub mod heatmap;
pub mod layer;
pub mod particle;
pub mod shaders;
pub mod symbology;

#[cfg(test)]
mod test_support;

pub use error::LayerError;
pub use heatmap::{HeatmapDisplay, HeatmapLayer, HeatmapLayerOptions};
pub use layer::*;
pub use particle::{ParticleLayer, ParticleLayerOptions};
pub use symbology::{PropertyTable, PropertyValue};
