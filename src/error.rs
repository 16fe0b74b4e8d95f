use thiserror::Error;

use crate::state::{Action, EngineState};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("{action:?} is not allowed while {state}")]
    InvalidStateTransition { state: EngineState, action: Action },
    #[error("hardware write fault: {0}")]
    HardwareWriteFault(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
