/// Fixed description of the analog output the session is bound to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceProfile {
    pub resolution: u32, // distinct output codes
    pub voltage_range: f64, // V spanned by the code space
    pub ground_code: u32, // code for the 0V reference
}

/// Largest code space a 16-bit analog write can address.
pub const MAX_RESOLUTION: u32 = u16::MAX as u32 + 1;

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            resolution: 4096,
            voltage_range: 4.0,
            ground_code: 0,
        }
    }
}

impl DeviceProfile {
    pub fn new(resolution: u32, voltage_range: f64, ground_code: u32) -> Result<Self, anyhow::Error> {
        if resolution > MAX_RESOLUTION {
            return Err(anyhow::anyhow!(
                "resolution ({}) exceeds the 16-bit output range ({})",
                resolution,
                MAX_RESOLUTION
            ));
        }
        if resolution <= ground_code {
            return Err(anyhow::anyhow!(
                "resolution ({}) must be greater than ground code ({})",
                resolution,
                ground_code
            ));
        }
        if voltage_range.is_nan() || voltage_range <= 0.0 {
            return Err(anyhow::anyhow!("voltage range must be positive, got {}", voltage_range));
        }
        Ok(Self {
            resolution,
            voltage_range,
            ground_code,
        })
    }

    /// Voltage represented by a single output code.
    pub fn volts_per_code(&self) -> f64 {
        self.voltage_range / self.resolution as f64
    }

    pub fn max_code(&self) -> u32 {
        self.resolution - 1
    }

    pub fn clamp_voltage(&self, volts: f64) -> f64 {
        if volts.is_nan() {
            return 0.0;
        }
        volts.clamp(0.0, self.voltage_range)
    }

    /// Map a voltage onto the output code space.
    ///
    /// The input is clamped to `[0, voltage_range]` first. The full-scale
    /// voltage rounds to `resolution`, which is not a valid code, so the
    /// result is additionally capped at `resolution - 1`.
    pub fn to_code(&self, volts: f64) -> u32 {
        let volts = self.clamp_voltage(volts);
        let code = (self.resolution as f64 * volts / self.voltage_range + self.ground_code as f64).round();
        (code as u32).min(self.max_code())
    }

    pub fn to_voltage(&self, code: u32) -> f64 {
        let span = (self.resolution - self.ground_code) as f64;
        self.voltage_range * (code as f64 - self.ground_code as f64) / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_rejects_ground_above_resolution() {
        assert!(DeviceProfile::new(4096, 4.0, 4096).is_err());
        assert!(DeviceProfile::new(4096, 0.0, 0).is_err());
        assert!(DeviceProfile::new(4096, 4.0, 0).is_ok());
    }

    #[test]
    fn test_profile_rejects_resolution_beyond_16_bits() {
        assert!(DeviceProfile::new(70000, 4.0, 0).is_err());
        assert!(DeviceProfile::new(MAX_RESOLUTION + 1, 4.0, 0).is_err());
        let widest = DeviceProfile::new(MAX_RESOLUTION, 4.0, 0).unwrap();
        assert_eq!(widest.to_code(4.0), u16::MAX as u32);
    }

    #[test]
    fn test_round_trip_within_one_code() {
        let profile = DeviceProfile::default();
        let tolerance = profile.volts_per_code();
        let mut v = 0.0;
        while v <= profile.voltage_range {
            let back = profile.to_voltage(profile.to_code(v));
            assert!((back - v).abs() <= tolerance, "{} -> {}", v, back);
            v += 0.0137;
        }
    }

    #[test]
    fn test_out_of_range_input_is_clamped() {
        let profile = DeviceProfile::default();
        assert_eq!(profile.to_code(-5.0), profile.to_code(0.0));
        assert_eq!(profile.to_code(profile.voltage_range + 5.0), profile.to_code(profile.voltage_range));
        assert_eq!(profile.to_code(f64::NAN), 0);
    }

    #[test]
    fn test_code_stays_below_resolution() {
        let profile = DeviceProfile::default();
        assert_eq!(profile.to_code(4.0), 4095);
        assert_eq!(profile.to_code(2.0), 2048);
        assert_eq!(profile.to_code(0.0), 0);
    }

    #[test]
    fn test_ground_offset() {
        let profile = DeviceProfile::new(4096, 4.0, 96).unwrap();
        assert_eq!(profile.to_code(0.0), 96);
        assert_eq!(profile.to_voltage(96), 0.0);
        assert!((profile.to_voltage(4096 - 1) - 4.0 * 3999.0 / 4000.0).abs() < 1e-12);
    }
}
