pub mod context;
pub mod interpolate;
pub mod program;
pub mod recording;
pub mod reproject;
pub mod shaders;
pub mod textures;
#[cfg(target_arch = "wasm32")]
pub mod webgl;

pub use context::*;
pub use interpolate::Interpolator;
pub use program::GpuProgram;
pub use recording::RecordingContext;
pub use reproject::{ImageView, Reprojector};
