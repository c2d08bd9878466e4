use gpu::GpuError;

use crate::loader::LoadError;

/// Failure of a snapshot (or metadata) on its way to the GPU.
///
/// Stored in ring slots and cloned into readiness checks, so every variant
/// is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    Load(LoadError),
    Decode(String),
    Gpu(GpuError),
    Spawn(String),
    /// `load` has not completed yet.
    NotLoaded,
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Load(e) => write!(f, "load error: {e}"),
            SnapshotError::Decode(msg) => write!(f, "decode error: {msg}"),
            SnapshotError::Gpu(e) => write!(f, "reproject error: {e}"),
            SnapshotError::Spawn(msg) => write!(f, "could not schedule reprojection: {msg}"),
            SnapshotError::NotLoaded => write!(f, "time source metadata not loaded"),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::Load(e) => Some(e),
            SnapshotError::Gpu(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LoadError> for SnapshotError {
    fn from(e: LoadError) -> Self {
        SnapshotError::Load(e)
    }
}

impl From<GpuError> for SnapshotError {
    fn from(e: GpuError) -> Self {
        SnapshotError::Gpu(e)
    }
}

impl From<formats::DecodeError> for SnapshotError {
    fn from(e: formats::DecodeError) -> Self {
        SnapshotError::Decode(e.to_string())
    }
}
