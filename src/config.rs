use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::DeviceProfile;
use crate::engine::EngineSettings;
use crate::plan::{RampConfig, DEFAULT_RATE};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    #[serde(default = "DeviceSection::default_resolution")]
    pub resolution: u32,
    #[serde(default = "DeviceSection::default_voltage_range")]
    pub voltage_range: f64,
    #[serde(default)]
    pub ground_code: u32,
    #[serde(default = "DeviceSection::default_channel")]
    pub channel: u32,
    #[serde(default = "DeviceSection::default_range_code")]
    pub range_code: u32,
}

impl DeviceSection {
    fn default_resolution() -> u32 {
        4096
    }
    fn default_voltage_range() -> f64 {
        4.0
    }
    fn default_channel() -> u32 {
        1
    }
    fn default_range_code() -> u32 {
        4
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            resolution: Self::default_resolution(),
            voltage_range: Self::default_voltage_range(),
            ground_code: 0,
            channel: Self::default_channel(),
            range_code: Self::default_range_code(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RampSection {
    #[serde(default)]
    pub start_voltage: f64,
    #[serde(default = "RampSection::default_target_voltage")]
    pub target_voltage: f64,
    #[serde(default = "RampSection::default_rate")]
    pub default_rate: f64,
    #[serde(default = "RampSection::default_inverse_display_rate")]
    pub inverse_display_rate: u32,
}

impl RampSection {
    fn default_target_voltage() -> f64 {
        2.0
    }
    fn default_rate() -> f64 {
        DEFAULT_RATE
    }
    fn default_inverse_display_rate() -> u32 {
        4
    }
}

impl Default for RampSection {
    fn default() -> Self {
        Self {
            start_voltage: 0.0,
            target_voltage: Self::default_target_voltage(),
            default_rate: Self::default_rate(),
            inverse_display_rate: Self::default_inverse_display_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationSection {
    #[serde(default = "SimulationSection::default_device_count")]
    pub device_count: usize,
}

impl SimulationSection {
    fn default_device_count() -> usize {
        1
    }
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            device_count: Self::default_device_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PanelConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub ramp: RampSection,
    #[serde(default)]
    pub simulation: SimulationSection,
}

impl PanelConfig {
    pub fn load_or_default(path: &str) -> Self {
        let path_obj = Path::new(path);
        if path_obj.exists() {
            match fs::read_to_string(path_obj) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(cfg) => {
                        info!("Loaded config from {}", path);
                        return cfg;
                    }
                    Err(err) => warn!("Failed to parse config {}: {}. Using defaults.", path, err),
                },
                Err(err) => warn!("Failed to read config {}: {}. Using defaults.", path, err),
            }
            return Self::default();
        }

        // File does not exist: write commented defaults and return them.
        let default_cfg = Self::default();
        match toml::to_string_pretty(&default_cfg) {
            Ok(text) => {
                let mut commented = String::new();
                for line in text.lines() {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || (trimmed.starts_with('[') && trimmed.ends_with(']')) {
                        commented.push_str(line);
                    } else {
                        commented.push_str("# ");
                        commented.push_str(line);
                    }
                    commented.push('\n');
                }
                if let Err(err) = fs::write(path_obj, commented) {
                    warn!("Failed to write default config to {}: {}", path, err);
                }
            }
            Err(err) => warn!("Failed to serialize default config: {}", err),
        }
        default_cfg
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let profile = DeviceProfile::new(
            self.device.resolution,
            self.device.voltage_range,
            self.device.ground_code,
        )?;
        let (initial_config, _) = RampConfig::from_input(
            Some(self.ramp.start_voltage),
            Some(self.ramp.target_voltage),
            Some(self.ramp.default_rate),
            &profile,
            DEFAULT_RATE,
        );
        Ok(EngineSettings {
            profile,
            channel: self.device.channel,
            range_code: self.device.range_code,
            default_rate: initial_config.rate,
            inverse_display_rate: self.ramp.inverse_display_rate.max(1),
            initial_config,
        })
    }
}
