//! Configuration and settings management for MPPCKit
//!
//! Provides configuration file handling and validation. The config is a
//! JSON file stored in the platform config directory, organized into
//! sections:
//! - Connection settings (port, baud rate, timeout)
//! - Operating setpoints (voltage, gain, offset, channel)
//! - Signal routing (differential vs single-ended, RGB filter)
//! - Safe ranges for the safety supervisor
//! - Supervisor, thermal and flashing policy

use mppckit_core::{Channel, Error, Result, SafeRange};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Serial port path, or "Auto" to probe all candidate ports
    pub port: String,
    /// Baud rate for the serial link
    pub baud_rate: u32,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "Auto".to_string(),
            baud_rate: 115200,
            timeout_ms: 1000,
        }
    }
}

impl ConnectionSettings {
    /// Whether the port should be probed rather than opened directly
    pub fn is_auto(&self) -> bool {
        self.port.eq_ignore_ascii_case("auto")
    }
}

/// Operating setpoints restored at session start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetpointSettings {
    /// Target bias voltage in volts
    pub voltage_v: f64,
    /// Gain percentage (0-100)
    pub gain_pct: f64,
    /// Output offset percentage (0-100)
    pub offset_pct: f64,
    /// Selected optical channel
    pub channel: Channel,
    /// Raw front-end offset override; None means use the calibrated value
    #[serde(default)]
    pub frontend_offset: Option<u16>,
}

impl Default for SetpointSettings {
    fn default() -> Self {
        Self {
            voltage_v: 0.0,
            gain_pct: 0.0,
            offset_pct: 0.0,
            channel: Channel::Panchromatic,
            frontend_offset: None,
        }
    }
}

/// Signal routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSettings {
    /// Differential output pair when true, single-ended when false
    pub differential: bool,
    /// Whether the unit has an RGB filter wheel; when false the channel
    /// is forced to panchromatic
    pub rgb_filter: bool,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            differential: true,
            rgb_filter: false,
        }
    }
}

/// Safe operating ranges enforced by the safety supervisor
///
/// Each range is an inclusive `(lower, upper)` integer pair in the
/// feature's engineering unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeRangeSettings {
    /// Sensor temperature deviation from target, degrees Celsius
    pub mppc_temp_rel: (i32, i32),
    /// Heatsink temperature, degrees Celsius
    pub heatsink_temp: (i32, i32),
    /// TEC current, milliamps
    pub mppc_current: (i32, i32),
    /// Chamber pressure, millibar
    pub vacuum_pressure: (i32, i32),
}

impl Default for SafeRangeSettings {
    fn default() -> Self {
        Self {
            mppc_temp_rel: (-1, 1),
            heatsink_temp: (-20, 40),
            mppc_current: (-5000, 5000),
            vacuum_pressure: (0, 5),
        }
    }
}

impl SafeRangeSettings {
    fn range(pair: (i32, i32), name: &str) -> Result<SafeRange> {
        SafeRange::new(pair.0, pair.1)
            .ok_or_else(|| Error::other(format!("Safe range {} has lower > upper", name)))
    }

    /// Sensor temperature deviation range
    pub fn mppc_temp_rel_range(&self) -> Result<SafeRange> {
        Self::range(self.mppc_temp_rel, "mppc_temp_rel")
    }

    /// Heatsink temperature range
    pub fn heatsink_temp_range(&self) -> Result<SafeRange> {
        Self::range(self.heatsink_temp, "heatsink_temp")
    }

    /// TEC current range
    pub fn mppc_current_range(&self) -> Result<SafeRange> {
        Self::range(self.mppc_current, "mppc_current")
    }

    /// Chamber pressure range
    pub fn vacuum_pressure_range(&self) -> Result<SafeRange> {
        Self::range(self.vacuum_pressure, "vacuum_pressure")
    }
}

/// Supervisor policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Consecutive out-of-range samples before Warning escalates to Tripped
    pub trip_after_violations: u32,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            trip_after_violations: 1,
            poll_interval_ms: 1000,
        }
    }
}

/// Thermal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalSettings {
    /// Target sensor temperature in degrees Celsius
    pub target_mppc_temp_c: f64,
    /// Ambient mode: no vacuum chamber, target pinned to a safe temperature
    pub ambient: bool,
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            target_mppc_temp_c: -10.0,
            ambient: false,
        }
    }
}

impl ThermalSettings {
    /// Target temperature used in ambient mode
    pub const AMBIENT_TARGET_C: f64 = 15.0;

    /// Effective target temperature, honoring ambient mode
    pub fn effective_target_c(&self) -> f64 {
        if self.ambient {
            Self::AMBIENT_TARGET_C
        } else {
            self.target_mppc_temp_c
        }
    }
}

/// Firmware flashing policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashingSettings {
    /// Attempts per flash step before the job fails
    pub attempts: u32,
    /// Delay between attempts in milliseconds
    pub backoff_ms: u64,
    /// Command line of the vendor flashing tool
    pub tool_command: String,
}

impl Default for FlashingSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 2000,
            tool_command: "ispsequencer".to_string(),
        }
    }
}

/// Complete application configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Operating setpoints
    pub setpoints: SetpointSettings,
    /// Signal routing
    pub signal: SignalSettings,
    /// Safe operating ranges
    pub safe_ranges: SafeRangeSettings,
    /// Supervisor policy
    pub supervisor: SupervisorSettings,
    /// Thermal settings
    pub thermal: ThermalSettings,
    /// Firmware flashing policy
    pub flashing: FlashingSettings,
    /// Calibration record location; None means the platform data directory
    #[serde(default)]
    pub calibration_file: Option<PathBuf>,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform-specific default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mppckit").join("config.json"))
    }

    /// Platform-specific default calibration record path
    pub fn default_calibration_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("mppckit").join("calibration.json"))
    }

    /// Load config from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::other(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::other(format!("Invalid JSON config: {}", e)))?;

        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save config to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::other(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::other(format!("Failed to create config directory: {}", e)))?;
        }
        std::fs::write(path, content)
            .map_err(|e| Error::other(format!("Failed to write config file: {}", e)))?;

        tracing::debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.timeout_ms == 0 {
            return Err(Error::other("Connection timeout must be > 0"));
        }

        if self.connection.baud_rate == 0 {
            return Err(Error::other("Baud rate must be > 0"));
        }

        if !(0.0..=100.0).contains(&self.setpoints.gain_pct) {
            return Err(Error::other("Gain must be between 0 and 100 percent"));
        }

        if !(0.0..=100.0).contains(&self.setpoints.offset_pct) {
            return Err(Error::other("Offset must be between 0 and 100 percent"));
        }

        self.safe_ranges.mppc_temp_rel_range()?;
        self.safe_ranges.heatsink_temp_range()?;
        self.safe_ranges.mppc_current_range()?;
        self.safe_ranges.vacuum_pressure_range()?;

        if self.supervisor.poll_interval_ms == 0 {
            return Err(Error::other("Poll interval must be > 0"));
        }

        if self.flashing.attempts == 0 {
            return Err(Error::other("Flashing attempts must be >= 1"));
        }

        Ok(())
    }

    /// Channel actually applied at session start
    ///
    /// Units without an RGB filter wheel only support panchromatic.
    pub fn effective_channel(&self) -> Channel {
        if self.signal.rgb_filter {
            self.setpoints.channel
        } else {
            Channel::Panchromatic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_safe_ranges() {
        let ranges = SafeRangeSettings::default();
        assert_eq!(ranges.heatsink_temp, (-20, 40));
        assert_eq!(ranges.mppc_temp_rel, (-1, 1));
        assert_eq!(ranges.mppc_current, (-5000, 5000));
        assert_eq!(ranges.vacuum_pressure, (0, 5));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = Config::default();
        config.safe_ranges.heatsink_temp = (40, -20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.flashing.attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gain_out_of_bounds_rejected() {
        let mut config = Config::default();
        config.setpoints.gain_pct = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_channel_forced_panchromatic() {
        let mut config = Config::default();
        config.setpoints.channel = Channel::Red;
        config.signal.rgb_filter = false;
        assert_eq!(config.effective_channel(), Channel::Panchromatic);

        config.signal.rgb_filter = true;
        assert_eq!(config.effective_channel(), Channel::Red);
    }

    #[test]
    fn test_ambient_pins_target_temperature() {
        let mut thermal = ThermalSettings::default();
        thermal.target_mppc_temp_c = -10.0;
        assert_eq!(thermal.effective_target_c(), -10.0);

        thermal.ambient = true;
        assert_eq!(thermal.effective_target_c(), ThermalSettings::AMBIENT_TARGET_C);
    }

    #[test]
    fn test_auto_port_detection() {
        let mut conn = ConnectionSettings::default();
        assert!(conn.is_auto());

        conn.port = "AUTO".to_string();
        assert!(conn.is_auto());

        conn.port = "/dev/ttyUSB0".to_string();
        assert!(!conn.is_auto());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.setpoints.voltage_v = 62.5;
        config.thermal.ambient = true;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.setpoints.voltage_v, 62.5);
        assert!(loaded.thermal.ambient);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from_file(&path).is_err());
    }
}
