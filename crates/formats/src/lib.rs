pub mod meta;
pub mod sampler;
pub mod uv;

pub use meta::*;
pub use sampler::*;
pub use uv::*;
