//! Event type definitions for the event bus.
//!
//! Events are the push half of the presentation interface: anything that
//! wants to observe the session (a UI, a logger, a test) subscribes here.
//! The pull half is the snapshot getters on the control loop.

use serde::{Deserialize, Serialize};

use crate::types::{BoardId, MonitoredFeature, SupervisorState, TelemetrySample};

/// Root event enum for all session events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Serial connection lifecycle
    Connection(ConnectionEvent),
    /// Periodic telemetry from the control loop
    Telemetry(TelemetryEvent),
    /// Safety supervisor transitions
    Safety(SafetyEvent),
    /// Firmware upload progress
    Upload(UploadEvent),
}

impl DeviceEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            DeviceEvent::Connection(_) => EventCategory::Connection,
            DeviceEvent::Telemetry(_) => EventCategory::Telemetry,
            DeviceEvent::Safety(_) => EventCategory::Safety,
            DeviceEvent::Upload(_) => EventCategory::Upload,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            DeviceEvent::Connection(e) => e.description(),
            DeviceEvent::Telemetry(e) => e.description(),
            DeviceEvent::Safety(e) => e.description(),
            DeviceEvent::Upload(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Serial connection lifecycle events.
    Connection,
    /// Periodic telemetry events.
    Telemetry,
    /// Safety supervisor events.
    Safety,
    /// Firmware upload events.
    Upload,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Telemetry => write!(f, "Telemetry"),
            EventCategory::Safety => write!(f, "Safety"),
            EventCategory::Upload => write!(f, "Upload"),
        }
    }
}

/// Connection-related events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Probing a port for a detector.
    Probing {
        /// Serial port path being probed.
        port: String,
    },
    /// Device identified and accepted.
    Connected {
        /// Serial port path that was connected.
        port: String,
        /// Computer-board firmware version string.
        firmware: String,
        /// Device serial number.
        serial_number: String,
    },
    /// Connection closed.
    Disconnected {
        /// Serial port path that was disconnected.
        port: String,
    },
    /// Probe or open failed on a port.
    ConnectionFailed {
        /// Serial port path that failed.
        port: String,
        /// Error message describing the failure.
        error: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::Probing { port } => format!("Probing {}", port),
            ConnectionEvent::Connected {
                port,
                firmware,
                serial_number,
            } => format!("Connected to {} (fw {}, s/n {})", port, firmware, serial_number),
            ConnectionEvent::Disconnected { port } => format!("Disconnected from {}", port),
            ConnectionEvent::ConnectionFailed { port, error } => {
                format!("Connection failed on {}: {}", port, error)
            }
        }
    }
}

/// Telemetry events published once per poll cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEvent {
    /// A fresh sample was read from the device.
    Sample {
        /// The telemetry snapshot.
        sample: TelemetrySample,
    },
    /// A poll cycle failed to complete.
    PollFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The bias voltage converged onto its target.
    VoltageSettled {
        /// Target voltage in volts.
        target_v: f64,
        /// Cycles spent converging.
        cycles: u32,
    },
}

impl TelemetryEvent {
    fn description(&self) -> String {
        match self {
            TelemetryEvent::Sample { sample } => format!(
                "Sample: mppc {:.2}C heatsink {:.2}C vac {:.3}mbar",
                sample.mppc_temp_c, sample.heatsink_temp_c, sample.vacuum_pressure_mbar
            ),
            TelemetryEvent::PollFailed { error } => format!("Poll failed: {}", error),
            TelemetryEvent::VoltageSettled { target_v, cycles } => {
                format!("Voltage settled at {:.2}V after {} cycles", target_v, cycles)
            }
        }
    }
}

/// Safety supervisor events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SafetyEvent {
    /// Supervisor state changed.
    StateChanged {
        /// Previous state.
        old: SupervisorState,
        /// New state.
        new: SupervisorState,
    },
    /// A feature left its safe range this cycle.
    RangeViolation {
        /// The feature that went out of range.
        feature: MonitoredFeature,
        /// The observed value.
        value: f64,
    },
    /// The shutdown command sequence was issued to the device.
    ShutdownIssued {
        /// The feature that caused the trip.
        feature: MonitoredFeature,
    },
    /// An operator reset cleared the tripped state.
    TripReset,
}

impl SafetyEvent {
    fn description(&self) -> String {
        match self {
            SafetyEvent::StateChanged { old, new } => {
                format!("Safety: {:?} -> {:?}", old, new)
            }
            SafetyEvent::RangeViolation { feature, value } => {
                format!("Out of range: {} = {:.3}", feature, value)
            }
            SafetyEvent::ShutdownIssued { feature } => {
                format!("Shutdown issued ({})", feature)
            }
            SafetyEvent::TripReset => "Trip reset".to_string(),
        }
    }
}

/// Firmware upload events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadEvent {
    /// An upload job started.
    Started {
        /// Board being flashed.
        board: BoardId,
    },
    /// The job moved to a new stage.
    StageChanged {
        /// Board being flashed.
        board: BoardId,
        /// Name of the new stage.
        stage: String,
    },
    /// A flash attempt failed and will be retried.
    AttemptFailed {
        /// Board being flashed.
        board: BoardId,
        /// Attempt number that failed (1-based).
        attempt: u32,
        /// Error message from the writer.
        error: String,
    },
    /// The job finished successfully.
    Completed {
        /// Board that was flashed.
        board: BoardId,
    },
    /// The job failed terminally.
    Failed {
        /// Board being flashed.
        board: BoardId,
        /// Stage at which the job failed.
        stage: String,
        /// Error message.
        error: String,
    },
}

impl UploadEvent {
    fn description(&self) -> String {
        match self {
            UploadEvent::Started { board } => format!("Upload started: {}", board),
            UploadEvent::StageChanged { board, stage } => {
                format!("Upload {}: {}", board, stage)
            }
            UploadEvent::AttemptFailed {
                board,
                attempt,
                error,
            } => format!("Upload {} attempt {} failed: {}", board, attempt, error),
            UploadEvent::Completed { board } => format!("Upload completed: {}", board),
            UploadEvent::Failed {
                board,
                stage,
                error,
            } => format!("Upload {} failed at {}: {}", board, stage, error),
        }
    }
}
