mod codec;
mod config;
mod control;
mod device;
mod engine;
mod error;
mod plan;
mod state;

// Re-export the main interface
pub use codec::DeviceProfile;
pub use config::{DeviceSection, PanelConfig, RampSection, SimulationSection};
pub use control::{control_interface, parse_command};
pub use device::{DaqBackend, DeviceDescriptor, DeviceHandle, DeviceSession, SimulatedDaq, WriteRecord};
pub use engine::{Direction, EngineSettings, RampEngine, StatusUpdate};
pub use error::EngineError;
pub use plan::{parse_field, ClampNotice, RampConfig, RampKind, RampPlan, RampRequest, DEFAULT_RATE};
pub use state::{allowed_actions, Action, DeviceAvailability, EngineState};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Discover,
    SelectDevice(usize),
    Initiate {
        start: Option<f64>,
        target: Option<f64>,
        rate: Option<f64>,
    },
    RampUp,
    RampDown,
    QuickRampUpTo(Option<f64>),
    QuickRampDownTo(Option<f64>),
    QuickRampToGround,
    Pause,
    Resume,
    Quit,
}
