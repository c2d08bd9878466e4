//! GPU simulations driven by a wind `TimeSource`.

pub mod error;
pub mod heatmap;
pub mod particles;
pub mod shaders;
pub mod simulation;

#[cfg(test)]
mod test_support;

pub use error::SimulationError;
pub use heatmap::{
    BlurKernel, Heatmap, HeatmapConfig, HeatmapKernel, HeatmapSettings, PointSource, SourceFeed,
};
pub use particles::{ParticleKernel, ParticleOptions, Particles};
pub use simulation::{
    INPUT_TEX_UNIT, Simulation, SimulationKernel, UV_TEX_0_UNIT, UV_TEX_1_UNIT,
};
