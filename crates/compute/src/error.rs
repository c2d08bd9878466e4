use gpu::GpuError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationError {
    Gpu(GpuError),
    /// Options that cannot produce a working simulation.
    Config(String),
    /// The time source has no metadata yet, so the grid is unknown.
    NotLoaded,
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationError::Gpu(e) => write!(f, "gpu error: {e}"),
            SimulationError::Config(msg) => write!(f, "invalid simulation config: {msg}"),
            SimulationError::NotLoaded => write!(f, "time source not loaded"),
        }
    }
}

impl std::error::Error for SimulationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimulationError::Gpu(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for SimulationError {
    fn from(e: GpuError) -> Self {
        SimulationError::Gpu(e)
    }
}
