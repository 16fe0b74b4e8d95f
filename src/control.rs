use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::Receiver;
use tracing::{info, warn};

use crate::engine::{Direction, RampEngine};
use crate::error::EngineError;
use crate::plan::{parse_field, RampRequest};
use crate::ControlCommand;

/// Parse one line of panel input, e.g. `initiate 0 2 0.5` or `quick-down 1.2`.
/// A `-` stands for an empty field.
pub fn parse_command(line: &str) -> Result<ControlCommand, EngineError> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or("").to_ascii_lowercase();
    let mut field = || -> Result<Option<f64>, EngineError> {
        match words.next() {
            Some("-") | None => Ok(None),
            Some(text) => parse_field(text),
        }
    };
    let command = match verb.as_str() {
        "discover" => ControlCommand::Discover,
        "select" => {
            let index = field()?.unwrap_or(0.0);
            if index < 0.0 || index.fract() != 0.0 {
                return Err(EngineError::InvalidInput(format!("'{}' is not a device index", index)));
            }
            ControlCommand::SelectDevice(index as usize)
        }
        "initiate" => ControlCommand::Initiate {
            start: field()?,
            target: field()?,
            rate: field()?,
        },
        "up" => ControlCommand::RampUp,
        "down" => ControlCommand::RampDown,
        "quick-up" => ControlCommand::QuickRampUpTo(field()?),
        "quick-down" => ControlCommand::QuickRampDownTo(field()?),
        "ground" => ControlCommand::QuickRampToGround,
        "pause" | "stop" => ControlCommand::Pause,
        "resume" => ControlCommand::Resume,
        "quit" | "exit" => ControlCommand::Quit,
        other => return Err(EngineError::InvalidInput(format!("unknown command '{}'", other))),
    };
    Ok(command)
}

/// Translate operator commands into engine operations until `Quit` arrives
/// or the command channel closes. The engine is always shut down on exit so
/// the device is released.
pub async fn control_interface(mut control_rx: Receiver<ControlCommand>, engine: Arc<RampEngine>) -> Result<()> {
    info!("Ramp control task started");
    while let Some(command) = control_rx.recv().await {
        let result = match command {
            ControlCommand::Discover => engine.list_devices().await.map(|devices| {
                for (index, device) in devices.iter().enumerate() {
                    info!("[{}] {}", index, device);
                }
            }),
            ControlCommand::SelectDevice(index) => engine.select_device(index).await.map(|_| ()),
            ControlCommand::Initiate { start, target, rate } => {
                engine.initiate_with_input(start, target, rate).await.map(|_| ())
            }
            ControlCommand::RampUp => engine.start_ramp(RampRequest::up()).await,
            ControlCommand::RampDown => engine.start_ramp(RampRequest::down()).await,
            ControlCommand::QuickRampUpTo(volts) => engine.quick_ramp_to(volts.unwrap_or(0.0), Direction::Up).await,
            ControlCommand::QuickRampDownTo(volts) => {
                engine.quick_ramp_to(volts.unwrap_or(0.0), Direction::Down).await
            }
            ControlCommand::QuickRampToGround => engine.start_ramp(RampRequest::quick_to_ground()).await,
            ControlCommand::Pause => engine.pause().await,
            ControlCommand::Resume => engine.resume().await,
            ControlCommand::Quit => {
                info!("Quit requested");
                break;
            }
        };
        if let Err(e) = result {
            // already on the status feed, the panel keeps running
            warn!("{:?} failed: {}", command, e);
        }
    }
    engine.shutdown().await;
    info!("Ramp control task finished");
    Ok(())
}
