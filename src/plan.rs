//! Ramp trajectory planning
//!
//! Turns an operator request into the code range the stepping loop walks
//! and the delay between writes.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::codec::DeviceProfile;
use crate::error::EngineError;

/// Rate used when the operator leaves the field empty or enters a
/// non-positive value, in V/s.
pub const DEFAULT_RATE: f64 = 0.00001;

// Quick ramp step multipliers, applied to the present output voltage.
const QUICK_UP_MULTIPLIER: f64 = 4.0;
const QUICK_DOWN_TO_MULTIPLIER: f64 = -1.0;
const QUICK_TO_GROUND_MULTIPLIER: f64 = -4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampKind {
    Up,
    Down,
    QuickUpTo,
    QuickDownTo,
}

/// Request to start or redirect a ramp.
///
/// `target_voltage` only matters for the quick variants; a `QuickDownTo`
/// without a target descends to ground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampRequest {
    pub kind: RampKind,
    pub target_voltage: Option<f64>,
}

impl RampRequest {
    pub fn up() -> Self {
        Self { kind: RampKind::Up, target_voltage: None }
    }

    pub fn down() -> Self {
        Self { kind: RampKind::Down, target_voltage: None }
    }

    pub fn quick_up_to(volts: f64) -> Self {
        Self { kind: RampKind::QuickUpTo, target_voltage: Some(volts) }
    }

    pub fn quick_down_to(volts: f64) -> Self {
        Self { kind: RampKind::QuickDownTo, target_voltage: Some(volts) }
    }

    pub fn quick_to_ground() -> Self {
        Self { kind: RampKind::QuickDownTo, target_voltage: None }
    }
}

/// Operator-entered ramp settings, already clamped to the device range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampConfig {
    pub start_voltage: f64,
    pub target_voltage: f64,
    pub rate: f64, // V/s
}

/// A value the operator entered that had to be corrected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClampNotice {
    StartVoltage { requested: f64, applied: f64 },
    TargetVoltage { requested: f64, applied: f64 },
    Rate { requested: f64, applied: f64 },
}

impl fmt::Display for ClampNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClampNotice::StartVoltage { requested, applied } => {
                write!(f, "start voltage {} V clamped to {} V", requested, applied)
            }
            ClampNotice::TargetVoltage { requested, applied } => {
                write!(f, "final voltage {} V clamped to {} V", requested, applied)
            }
            ClampNotice::Rate { requested, applied } => {
                write!(f, "ramp rate {} V/s replaced by {} V/s", requested, applied)
            }
        }
    }
}

impl RampConfig {
    /// Build a config from raw operator values. Missing voltages are 0 V and
    /// a missing rate falls back to `default_rate`; neither produces a notice.
    pub fn from_input(
        start: Option<f64>,
        target: Option<f64>,
        rate: Option<f64>,
        profile: &DeviceProfile,
        default_rate: f64,
    ) -> (Self, Vec<ClampNotice>) {
        let mut notices = Vec::new();
        let default_rate = if default_rate.is_finite() && default_rate > 0.0 {
            default_rate
        } else {
            DEFAULT_RATE
        };

        let requested = start.unwrap_or(0.0);
        let start_voltage = profile.clamp_voltage(requested);
        if start_voltage != requested {
            notices.push(ClampNotice::StartVoltage { requested, applied: start_voltage });
        }

        let requested = target.unwrap_or(0.0);
        let target_voltage = profile.clamp_voltage(requested);
        if target_voltage != requested {
            notices.push(ClampNotice::TargetVoltage { requested, applied: target_voltage });
        }

        let rate = match rate {
            None => default_rate,
            Some(r) if r.is_finite() && r > 0.0 => r,
            Some(r) => {
                notices.push(ClampNotice::Rate { requested: r, applied: default_rate });
                default_rate
            }
        };

        (Self { start_voltage, target_voltage, rate }, notices)
    }
}

/// Parse one operator text field. Blank means "not given".
pub fn parse_field(text: &str) -> Result<Option<f64>, EngineError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<f64>()
        .map(Some)
        .map_err(|_| EngineError::InvalidInput(format!("'{}' is not a number", text)))
}

/// Code range and pacing for one stepping loop activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampPlan {
    pub target_code: u32,
    pub step_size: i64,
    pub step_delay: Duration,
}

impl RampPlan {
    pub fn new(current_code: u32, request: &RampRequest, profile: &DeviceProfile, config: &RampConfig) -> Self {
        let plan = match request.kind {
            RampKind::Up => Self::timed(profile.to_code(config.target_voltage), 1, profile, config),
            RampKind::Down => Self::timed(profile.to_code(config.start_voltage), -1, profile, config),
            RampKind::QuickUpTo => {
                let target = profile.to_code(request.target_voltage.unwrap_or(0.0));
                Self::quick(current_code, target, QUICK_UP_MULTIPLIER, profile)
            }
            RampKind::QuickDownTo => match request.target_voltage {
                Some(volts) => Self::quick(current_code, profile.to_code(volts), QUICK_DOWN_TO_MULTIPLIER, profile),
                None => Self::quick(current_code, profile.ground_code, QUICK_TO_GROUND_MULTIPLIER, profile),
            },
        };
        debug!(
            "Planned {:?} from code {} to {} step {} every {:?}",
            request.kind, current_code, plan.target_code, plan.step_size, plan.step_delay
        );
        plan
    }

    fn timed(target_code: u32, step_size: i64, profile: &DeviceProfile, config: &RampConfig) -> Self {
        let seconds = profile.voltage_range / (config.rate * profile.resolution as f64);
        Self {
            target_code,
            step_size,
            step_delay: seconds_to_duration(seconds),
        }
    }

    fn quick(current_code: u32, target_code: u32, multiplier: f64, profile: &DeviceProfile) -> Self {
        let direction = multiplier.signum() as i64;
        let magnitude = (profile.to_voltage(current_code) * multiplier).round_ties_even().abs() as i64;
        let seconds = if current_code == 0 {
            1.0 / profile.resolution as f64
        } else {
            1.0 / current_code as f64
        };
        Self {
            target_code,
            step_size: direction * magnitude.max(1),
            step_delay: seconds_to_duration(seconds),
        }
    }

    /// Codes written by the loop, starting at `from` and stopping before
    /// `target_code`. Empty when `from` is already at or past the target.
    pub fn codes(&self, from: u32) -> RampSteps {
        RampSteps {
            next: from as i64,
            stop: self.target_code as i64,
            step: self.step_size,
        }
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

/// Half-open walk over output codes.
#[derive(Debug, Clone)]
pub struct RampSteps {
    next: i64,
    stop: i64,
    step: i64,
}

impl Iterator for RampSteps {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let more = (self.step > 0 && self.next < self.stop) || (self.step < 0 && self.next > self.stop);
        if !more {
            return None;
        }
        let code = self.next;
        self.next += self.step;
        Some(code as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start: f64, target: f64, rate: f64) -> RampConfig {
        RampConfig { start_voltage: start, target_voltage: target, rate }
    }

    #[test]
    fn test_timed_ramp_up_plan() {
        let profile = DeviceProfile::default();
        let plan = RampPlan::new(0, &RampRequest::up(), &profile, &config(0.0, 2.0, 0.5));
        assert_eq!(plan.step_size, 1);
        assert_eq!(plan.target_code, profile.to_code(2.0));
        assert!((plan.step_delay.as_secs_f64() - 4.0 / (0.5 * 4096.0)).abs() < 1e-9);

        let codes: Vec<u32> = plan.codes(0).collect();
        assert_eq!(codes.len(), 2048);
        assert_eq!(codes[0], 0);
        assert!(codes.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(*codes.last().unwrap(), plan.target_code - 1);
    }

    #[test]
    fn test_timed_ramp_down_targets_start_voltage() {
        let profile = DeviceProfile::default();
        let plan = RampPlan::new(2048, &RampRequest::down(), &profile, &config(1.0, 2.0, 0.5));
        assert_eq!(plan.step_size, -1);
        assert_eq!(plan.target_code, 1024);
        let codes: Vec<u32> = plan.codes(2048).collect();
        assert_eq!(codes.first(), Some(&2048));
        assert_eq!(codes.last(), Some(&1025));
    }

    #[test]
    fn test_plan_at_target_is_noop() {
        let profile = DeviceProfile::default();
        let plan = RampPlan::new(2048, &RampRequest::up(), &profile, &config(0.0, 2.0, 0.5));
        assert!(plan.codes(2048).next().is_none());
        // wrong side of the target never steps away from it
        assert!(plan.codes(3000).next().is_none());
    }

    #[test]
    fn test_quick_ramp_to_ground() {
        let profile = DeviceProfile::default();
        // 2 V * -4 = -8 codes per step, 1/2048 s per step
        let plan = RampPlan::new(2048, &RampRequest::quick_to_ground(), &profile, &config(0.0, 2.0, 0.5));
        assert_eq!(plan.step_size, -8);
        assert_eq!(plan.target_code, 0);
        assert!((plan.step_delay.as_secs_f64() - 1.0 / 2048.0).abs() < 1e-9);
        assert_eq!(plan.codes(2048).last(), Some(8));
    }

    #[test]
    fn test_quick_ramp_multipliers() {
        let profile = DeviceProfile::default();
        let cfg = config(0.0, 0.0, 1.0);
        // 3 V at code 3072
        let up = RampPlan::new(3072, &RampRequest::quick_up_to(4.0), &profile, &cfg);
        assert_eq!(up.step_size, 12);
        let down = RampPlan::new(3072, &RampRequest::quick_down_to(1.0), &profile, &cfg);
        assert_eq!(down.step_size, -3);
        assert_eq!(down.target_code, 1024);
    }

    #[test]
    fn test_quick_step_never_zero() {
        let profile = DeviceProfile::default();
        let cfg = config(0.0, 0.0, 1.0);
        let up = RampPlan::new(0, &RampRequest::quick_up_to(1.0), &profile, &cfg);
        assert_eq!(up.step_size, 1);
        assert_eq!(up.step_delay, Duration::from_secs_f64(1.0 / 4096.0));
        // 0.1 V rounds to 0 under the -1 multiplier
        let down = RampPlan::new(102, &RampRequest::quick_down_to(0.0), &profile, &cfg);
        assert_eq!(down.step_size, -1);
    }

    #[test]
    fn test_quick_step_rounds_half_to_even() {
        let profile = DeviceProfile::default();
        let cfg = config(0.0, 0.0, 1.0);
        // 2.5 V * -1 rounds to -2, not -3
        let down = RampPlan::new(2560, &RampRequest::quick_down_to(0.0), &profile, &cfg);
        assert_eq!(down.step_size, -2);
    }

    #[test]
    fn test_config_clamps_and_reports() {
        let profile = DeviceProfile::default();
        let (cfg, notices) = RampConfig::from_input(Some(-1.0), Some(9.0), Some(0.0), &profile, DEFAULT_RATE);
        assert_eq!(cfg.start_voltage, 0.0);
        assert_eq!(cfg.target_voltage, 4.0);
        assert_eq!(cfg.rate, DEFAULT_RATE);
        assert_eq!(notices.len(), 3);
        assert_eq!(
            notices[1],
            ClampNotice::TargetVoltage { requested: 9.0, applied: 4.0 }
        );
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let profile = DeviceProfile::default();
        let (cfg, notices) = RampConfig::from_input(None, None, None, &profile, 0.25);
        assert_eq!(cfg, config(0.0, 0.0, 0.25));
        assert!(notices.is_empty());
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(parse_field(""), Ok(None));
        assert_eq!(parse_field("  "), Ok(None));
        assert_eq!(parse_field(" 1.5 "), Ok(Some(1.5)));
        assert!(matches!(parse_field("abc"), Err(EngineError::InvalidInput(_))));
    }
}
