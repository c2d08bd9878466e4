pub mod affine;
pub mod mercator;

pub use affine::*;
pub use mercator::*;
