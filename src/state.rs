//! Ramp engine state machine
//!
//! Every control the operator sees is a projection of the current
//! [`EngineState`]; the shell never keeps its own copy of enable flags.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::EngineError;
use crate::plan::RampKind;

/// Engine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No ramp running, output holding
    Idle,
    /// Timed ramp toward the configured target voltage
    RampingUp,
    /// Timed ramp back toward the configured start voltage
    RampingDown,
    /// Accelerating ramp toward an explicit voltage
    QuickRampingUp,
    /// Accelerating descent toward an explicit voltage or ground
    QuickRampingDown,
    /// Ramp interrupted by the operator, output holding
    Paused,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Idle => "idle",
            EngineState::RampingUp => "ramping up",
            EngineState::RampingDown => "ramping down",
            EngineState::QuickRampingUp => "quick ramping up",
            EngineState::QuickRampingDown => "quick ramping down",
            EngineState::Paused => "paused",
        };
        f.write_str(label)
    }
}

/// Inputs that move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start(RampKind),
    Pause,
    Resume(RampKind),
    /// Stepping loop reached its target
    Finished,
    /// Stepping loop stopped on a write fault
    Faulted,
    Abort,
}

/// Operator controls exposed by the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Discover,
    SelectDevice,
    Initiate,
    RampUp,
    RampDown,
    QuickRampUpTo,
    QuickRampDownTo,
    QuickRampToGround,
    Pause,
    Resume,
    Quit,
}

/// What the session knows about hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAvailability {
    /// Discovery has not run or found nothing
    Missing,
    /// Devices listed but none bound
    Discovered,
    Bound,
}

impl EngineState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::RampingUp
                | EngineState::RampingDown
                | EngineState::QuickRampingUp
                | EngineState::QuickRampingDown
        )
    }

    /// State entered when a ramp of `kind` begins.
    pub fn ramping(kind: RampKind) -> Self {
        match kind {
            RampKind::Up => EngineState::RampingUp,
            RampKind::Down => EngineState::RampingDown,
            RampKind::QuickUpTo => EngineState::QuickRampingUp,
            RampKind::QuickDownTo => EngineState::QuickRampingDown,
        }
    }

    /// Process an event and return the next state.
    ///
    /// Pausing an idle or already paused engine leaves it where it is.
    pub fn transition(self, event: Event) -> Result<Self, EngineError> {
        use EngineState::*;

        match (self, event) {
            (Idle | Paused, Event::Start(kind)) => Ok(EngineState::ramping(kind)),
            (Idle | Paused, Event::Pause) => Ok(self),
            (Paused, Event::Resume(kind)) => Ok(EngineState::ramping(kind)),
            (s, Event::Pause) if s.is_active() => Ok(Paused),
            (s, Event::Finished | Event::Faulted) if s.is_active() => Ok(Idle),
            (_, Event::Abort) => Ok(Idle),
            (state, event) => Err(EngineError::InvalidStateTransition {
                state,
                action: event.action(),
            }),
        }
    }
}

impl Event {
    fn action(&self) -> Action {
        match self {
            Event::Start(RampKind::Up) => Action::RampUp,
            Event::Start(RampKind::Down) => Action::RampDown,
            Event::Start(RampKind::QuickUpTo) => Action::QuickRampUpTo,
            Event::Start(RampKind::QuickDownTo) => Action::QuickRampDownTo,
            Event::Pause => Action::Pause,
            Event::Resume(_) => Action::Resume,
            Event::Finished | Event::Faulted | Event::Abort => Action::Quit,
        }
    }
}

/// Controls the operator may use in `state`.
pub fn allowed_actions(state: EngineState, device: DeviceAvailability) -> BTreeSet<Action> {
    use Action::*;

    let actions: &[Action] = match device {
        DeviceAvailability::Missing => &[Discover, Quit],
        DeviceAvailability::Discovered => &[Discover, SelectDevice, Quit],
        DeviceAvailability::Bound => match state {
            EngineState::Idle => &[
                Discover,
                SelectDevice,
                Initiate,
                RampUp,
                RampDown,
                QuickRampUpTo,
                QuickRampDownTo,
                QuickRampToGround,
                Quit,
            ],
            EngineState::Paused => &[
                RampUp,
                RampDown,
                QuickRampUpTo,
                QuickRampDownTo,
                QuickRampToGround,
                Resume,
                Quit,
            ],
            _ => &[Pause, Quit],
        },
    };
    actions.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_from_idle_and_paused() {
        for state in [EngineState::Idle, EngineState::Paused] {
            assert_eq!(
                state.transition(Event::Start(RampKind::Up)),
                Ok(EngineState::RampingUp)
            );
            assert_eq!(
                state.transition(Event::Start(RampKind::QuickDownTo)),
                Ok(EngineState::QuickRampingDown)
            );
        }
    }

    #[test]
    fn test_start_while_ramping_rejected() {
        let err = EngineState::RampingDown
            .transition(Event::Start(RampKind::Up))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidStateTransition {
                state: EngineState::RampingDown,
                action: Action::RampUp,
            }
        );
    }

    #[test]
    fn test_pause_idle_is_noop() {
        assert_eq!(EngineState::Idle.transition(Event::Pause), Ok(EngineState::Idle));
        assert_eq!(EngineState::Paused.transition(Event::Pause), Ok(EngineState::Paused));
    }

    #[test]
    fn test_pause_from_every_active_state() {
        for kind in [RampKind::Up, RampKind::Down, RampKind::QuickUpTo, RampKind::QuickDownTo] {
            let active = EngineState::ramping(kind);
            assert_eq!(active.transition(Event::Pause), Ok(EngineState::Paused));
        }
    }

    #[test]
    fn test_resume_only_from_paused() {
        assert_eq!(
            EngineState::Paused.transition(Event::Resume(RampKind::Down)),
            Ok(EngineState::RampingDown)
        );
        assert!(EngineState::Idle.transition(Event::Resume(RampKind::Up)).is_err());
        assert!(EngineState::RampingUp.transition(Event::Resume(RampKind::Up)).is_err());
    }

    #[test]
    fn test_finish_and_fault_return_to_idle() {
        assert_eq!(EngineState::RampingUp.transition(Event::Finished), Ok(EngineState::Idle));
        assert_eq!(EngineState::QuickRampingUp.transition(Event::Faulted), Ok(EngineState::Idle));
        assert!(EngineState::Paused.transition(Event::Finished).is_err());
    }

    #[test]
    fn test_actions_without_device() {
        let actions = allowed_actions(EngineState::Idle, DeviceAvailability::Missing);
        assert_eq!(actions.into_iter().collect::<Vec<_>>(), vec![Action::Discover, Action::Quit]);
    }

    #[test]
    fn test_actions_while_ramping() {
        let actions = allowed_actions(EngineState::QuickRampingUp, DeviceAvailability::Bound);
        assert!(actions.contains(&Action::Pause));
        assert!(!actions.contains(&Action::RampUp));
        assert!(!actions.contains(&Action::Initiate));
    }

    #[test]
    fn test_initiate_only_when_idle() {
        assert!(allowed_actions(EngineState::Idle, DeviceAvailability::Bound).contains(&Action::Initiate));
        assert!(!allowed_actions(EngineState::Paused, DeviceAvailability::Bound).contains(&Action::Initiate));
        assert!(allowed_actions(EngineState::Paused, DeviceAvailability::Bound).contains(&Action::Resume));
    }
}
