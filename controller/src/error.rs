use heating_common::{AggregatorError, RelayError};
use thiserror::Error;

/// Conditions that stop the daemon, each with its own exit status.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("no temperature sensors found")]
    NoSensors,
    #[error("could not obtain a temperature: {0}")]
    NoTemperature(AggregatorError),
    #[error("relay discovery failed: {0}")]
    RelayDiscovery(#[from] RelayError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FatalError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Other(_) => 1,
            Self::NoSensors => 2,
            Self::NoTemperature(_) => 3,
            Self::RelayDiscovery(_) => 4,
        }
    }
}

impl From<AggregatorError> for FatalError {
    fn from(err: AggregatorError) -> Self {
        match err {
            AggregatorError::NoSensors => Self::NoSensors,
            err @ AggregatorError::AllSensorsLost => Self::NoTemperature(err),
        }
    }
}
