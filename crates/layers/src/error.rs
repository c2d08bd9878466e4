use compute::SimulationError;
use gpu::GpuError;

#[derive(Debug, Clone, PartialEq)]
pub enum LayerError {
    Gpu(GpuError),
    Simulation(SimulationError),
    UnknownProperty(String),
    InvalidValue {
        property: String,
        expected: &'static str,
    },
}

impl std::fmt::Display for LayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerError::Gpu(e) => write!(f, "gpu error: {e}"),
            LayerError::Simulation(e) => write!(f, "simulation error: {e}"),
            LayerError::UnknownProperty(name) => write!(f, "unknown layer property: {name}"),
            LayerError::InvalidValue { property, expected } => {
                write!(f, "invalid value for {property}: expected {expected}")
            }
        }
    }
}

impl std::error::Error for LayerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LayerError::Gpu(e) => Some(e),
            LayerError::Simulation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for LayerError {
    fn from(e: GpuError) -> Self {
        LayerError::Gpu(e)
    }
}

impl From<SimulationError> for LayerError {
    fn from(e: SimulationError) -> Self {
        match e {
            SimulationError::Gpu(e) => LayerError::Gpu(e),
            e => LayerError::Simulation(e),
        }
    }
}
