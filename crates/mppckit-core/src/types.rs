//! Shared data model for the detector unit.
//!
//! These types cross crate boundaries: telemetry snapshots, setpoint
//! targets, safety ranges, supervisor and board states, calibration
//! records and upload jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The two boards inside the detector unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardId {
    /// Computer board (power, thermal regulation, host link).
    Computer,
    /// Front-end board (sensor readout), reached through the computer board.
    FrontEnd,
}

impl std::fmt::Display for BoardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoardId::Computer => write!(f, "computer board"),
            BoardId::FrontEnd => write!(f, "front-end board"),
        }
    }
}

/// Optical channel selection.
///
/// The wire encoding is a flag byte: red 1, blue 2, green 4,
/// panchromatic all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Red filter only.
    Red,
    /// Blue filter only.
    Blue,
    /// Green filter only.
    Green,
    /// All filters open (panchromatic).
    Panchromatic,
}

impl Channel {
    /// Wire flag byte for this channel.
    pub fn to_flag(self) -> u8 {
        match self {
            Channel::Red => 1,
            Channel::Blue => 2,
            Channel::Green => 4,
            Channel::Panchromatic => 7,
        }
    }

    /// Decode a wire flag byte; returns None for unknown combinations.
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            1 => Some(Channel::Red),
            2 => Some(Channel::Blue),
            4 => Some(Channel::Green),
            7 => Some(Channel::Panchromatic),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Red => write!(f, "R"),
            Channel::Blue => write!(f, "B"),
            Channel::Green => write!(f, "G"),
            Channel::Panchromatic => write!(f, "Pan"),
        }
    }
}

/// Signal output mode of the front-end board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    /// Differential output pair.
    Differential,
    /// Single-ended output.
    SingleEnded,
}

/// One immutable snapshot of device telemetry, taken once per poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Sensor (MPPC) temperature in degrees Celsius.
    pub mppc_temp_c: f64,
    /// Heatsink (hot plate) temperature in degrees Celsius.
    pub heatsink_temp_c: f64,
    /// Chamber pressure in millibar.
    pub vacuum_pressure_mbar: f64,
    /// TEC current in milliamps.
    pub mppc_current_ma: f64,
    /// Signal output level reading in volts, per the selected signal type.
    pub output_level_v: f64,
    /// Front-end diagnostic output voltage in volts.
    pub frontend_output_v: f64,
    /// Device error register; 8 means no error.
    pub error_code: u8,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    /// Error register value the firmware reports when nothing is wrong.
    pub const ERROR_CODE_OK: u8 = 8;

    /// Whether the device error register reports a fault.
    pub fn has_device_error(&self) -> bool {
        self.error_code != Self::ERROR_CODE_OK
    }
}

/// Desired operating point for the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetpointTarget {
    /// Target bias voltage in volts.
    pub voltage_v: f64,
    /// Gain as a percentage of the usable range (0-100).
    pub gain_pct: f64,
    /// Output offset as a percentage of the usable range (0-100).
    pub offset_pct: f64,
    /// Selected optical channel.
    pub channel: Channel,
    /// Raw front-end offset DAC value; None means use the calibrated value.
    pub frontend_offset: Option<u16>,
    /// Signal output mode.
    pub signal: SignalType,
}

impl Default for SetpointTarget {
    fn default() -> Self {
        Self {
            voltage_v: 0.0,
            gain_pct: 0.0,
            offset_pct: 0.0,
            channel: Channel::Panchromatic,
            frontend_offset: None,
            signal: SignalType::Differential,
        }
    }
}

/// Telemetry features watched by the safety supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitoredFeature {
    /// Sensor temperature relative to its target.
    MppcTempRelative,
    /// Heatsink absolute temperature.
    HeatsinkTemp,
    /// Chamber pressure.
    VacuumPressure,
    /// TEC current.
    MppcCurrent,
    /// Device error register.
    ErrorCode,
}

impl std::fmt::Display for MonitoredFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitoredFeature::MppcTempRelative => write!(f, "sensor temperature deviation"),
            MonitoredFeature::HeatsinkTemp => write!(f, "heatsink temperature"),
            MonitoredFeature::VacuumPressure => write!(f, "vacuum pressure"),
            MonitoredFeature::MppcCurrent => write!(f, "TEC current"),
            MonitoredFeature::ErrorCode => write!(f, "device error code"),
        }
    }
}

/// Inclusive bounds on a monitored feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeRange {
    /// Lower bound, inclusive.
    pub lower: i32,
    /// Upper bound, inclusive.
    pub upper: i32,
}

impl SafeRange {
    /// Construct a range; returns None when lower exceeds upper.
    pub fn new(lower: i32, upper: i32) -> Option<Self> {
        if lower <= upper {
            Some(Self { lower, upper })
        } else {
            None
        }
    }

    /// Whether a value lies inside the range (bounds inclusive).
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower as f64 && value <= self.upper as f64
    }
}

impl std::fmt::Display for SafeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// State of the safety supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    /// All monitored features inside their safe ranges.
    Normal,
    /// A violation has been observed but the trip threshold is not reached.
    Warning {
        /// The feature that went out of range.
        feature: MonitoredFeature,
    },
    /// Latched fault; setpoint writes are blocked until an operator reset.
    Tripped {
        /// The feature that caused the trip.
        feature: MonitoredFeature,
    },
}

impl SupervisorState {
    /// Whether the supervisor is latched in the tripped state.
    pub fn is_tripped(&self) -> bool {
        matches!(self, SupervisorState::Tripped { .. })
    }
}

/// Firmware state of a board, as detected before an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardState {
    /// No firmware answering (fresh or erased flash).
    Blank,
    /// Running firmware answered the version query.
    Programmed,
    /// Detection has not run or gave no usable answer.
    Unknown,
}

/// Persisted result of a front-end offset calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// The offset DAC value found by the search.
    pub frontend_offset: u16,
    /// Bias voltage the calibration was performed at.
    pub voltage_v: f64,
    /// When the run completed.
    pub timestamp: DateTime<Utc>,
}

/// One firmware upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    /// Board to flash.
    pub board: BoardId,
    /// Path to the firmware image.
    pub image: PathBuf,
    /// CRC-32 (IEEE) the image must hash to before it is written.
    pub expected_checksum: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_flags_round_trip() {
        for ch in [
            Channel::Red,
            Channel::Blue,
            Channel::Green,
            Channel::Panchromatic,
        ] {
            assert_eq!(Channel::from_flag(ch.to_flag()), Some(ch));
        }
        assert_eq!(Channel::from_flag(3), None);
        assert_eq!(Channel::from_flag(0), None);
    }

    #[test]
    fn test_safe_range_bounds_inclusive() {
        let range = SafeRange::new(-20, 40).unwrap();
        assert!(range.contains(-20.0));
        assert!(range.contains(40.0));
        assert!(range.contains(0.0));
        assert!(!range.contains(40.1));
        assert!(!range.contains(-20.5));
    }

    #[test]
    fn test_safe_range_rejects_inverted_bounds() {
        assert!(SafeRange::new(5, -5).is_none());
        assert!(SafeRange::new(3, 3).is_some());
    }

    #[test]
    fn test_error_code_ok() {
        let sample = TelemetrySample {
            mppc_temp_c: 25.0,
            heatsink_temp_c: 30.0,
            vacuum_pressure_mbar: 1.2,
            mppc_current_ma: 100.0,
            output_level_v: 0.5,
            frontend_output_v: 0.0,
            error_code: TelemetrySample::ERROR_CODE_OK,
            timestamp: Utc::now(),
        };
        assert!(!sample.has_device_error());

        let faulty = TelemetrySample {
            error_code: 3,
            ..sample
        };
        assert!(faulty.has_device_error());
    }

    #[test]
    fn test_supervisor_state_tripped() {
        assert!(!SupervisorState::Normal.is_tripped());
        assert!(!SupervisorState::Warning {
            feature: MonitoredFeature::HeatsinkTemp
        }
        .is_tripped());
        assert!(SupervisorState::Tripped {
            feature: MonitoredFeature::VacuumPressure
        }
        .is_tripped());
    }

    #[test]
    fn test_calibration_record_serialization() {
        let record = CalibrationRecord {
            frontend_offset: 2048,
            voltage_v: 60.0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: CalibrationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
