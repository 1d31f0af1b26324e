//! Error handling for MPPCKit
//!
//! Provides error types for all layers of the supervisor:
//! - Transport errors (serial channel, framing, timeouts)
//! - Protocol errors (frame decoding, unknown commands)
//! - Control errors (setpoint convergence, safety trips)
//! - Calibration errors (search convergence, aborted runs)
//! - Upload errors (prerequisites, flashing failures)
//!
//! All error types use `thiserror` for ergonomic error handling.

use crate::types::{BoardId, MonitoredFeature};
use thiserror::Error;

/// Transport error type
///
/// Represents errors on the serial channel to the detector unit.
/// Timeouts and framing errors are recoverable per request; connection
/// errors are fatal to the session.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// No compatible device was found on any probed port
    #[error("No detector found on ports {probed:?}")]
    DeviceNotFound {
        /// The ports that were probed.
        probed: Vec<String>,
    },

    /// Failed to open the serial port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Request timed out waiting for a response byte
    #[error("Timeout after {timeout_ms}ms (received {received} bytes)")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
        /// Bytes received before the timeout hit.
        received: usize,
    },

    /// Received bytes that do not form a valid frame
    #[error("Framing error: {reason}")]
    Framing {
        /// What was wrong with the frame.
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {reason}")]
    Io {
        /// The reason for the I/O error.
        reason: String,
    },
}

/// Protocol error type
///
/// Decoding failures are surfaced to the caller and never defaulted to a
/// guessed value: guessing telemetry is a safety hazard.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Response frame could not be split into the expected fields
    #[error("Malformed response to {command}: {reason}")]
    MalformedResponse {
        /// The command the response was for.
        command: String,
        /// The reason decoding failed.
        reason: String,
    },

    /// The device reported (NAK) that it does not support the command
    #[error("Device rejected unsupported command {command}")]
    UnknownCommand {
        /// The rejected command.
        command: String,
    },

    /// The device on the port did not identify as a detector unit
    #[error("Device identified as {identity:?}, not a detector unit")]
    IdentityMismatch {
        /// The identity string the device returned.
        identity: String,
    },
}

/// Control loop error type
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    /// The voltage ramp did not converge within its cycle budget
    #[error("Setpoint {target_v} V not reached after {cycles} cycles (last observed {observed_v} V)")]
    SetpointNotReached {
        /// The requested voltage in volts.
        target_v: f64,
        /// The last observed voltage in volts.
        observed_v: f64,
        /// How many cycles were spent.
        cycles: u32,
    },

    /// The safety supervisor tripped; operator reset required
    #[error("Safety tripped on {feature}: {value} outside [{lower}, {upper}]")]
    SafetyTripped {
        /// The feature that went out of range.
        feature: MonitoredFeature,
        /// The observed value.
        value: f64,
        /// Configured lower bound.
        lower: i32,
        /// Configured upper bound.
        upper: i32,
    },
}

/// Calibration error type
#[derive(Error, Debug, Clone)]
pub enum CalibrationError {
    /// The offset search exhausted its step budget without converging
    #[error("Calibration did not converge after {steps} steps (window [{lower}, {upper}])")]
    NotConverged {
        /// Steps spent before giving up.
        steps: u32,
        /// Lower end of the final search window.
        lower: u16,
        /// Upper end of the final search window.
        upper: u16,
    },

    /// The run was aborted mid-search; prior calibration left untouched
    #[error("Calibration aborted at step {step}: {reason}")]
    Aborted {
        /// The step at which the run aborted.
        step: u32,
        /// Why the run aborted.
        reason: String,
    },

    /// The front-end output went negative, which indicates a hardware fault
    #[error("Negative front-end output voltage {voltage} V, check hardware")]
    NegativeOutput {
        /// The measured output voltage.
        voltage: f64,
    },
}

/// Firmware upload error type
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    /// A precondition for the requested upload is not met
    #[error("Cannot flash {board}: {reason}")]
    PrerequisiteNotMet {
        /// The board that cannot be flashed.
        board: BoardId,
        /// Which prerequisite failed.
        reason: String,
    },

    /// The image on disk does not hash to the expected checksum
    #[error("Image for {board} has CRC-32 0x{actual:08x}, expected 0x{expected:08x}")]
    ChecksumMismatch {
        /// The board the image was intended for.
        board: BoardId,
        /// The checksum the request demanded.
        expected: u32,
        /// The checksum the image file actually hashes to.
        actual: u32,
    },

    /// The external image writer failed after all retry attempts
    #[error("Flashing {board} failed at stage {stage} after {attempts} attempts")]
    FlashFailed {
        /// The board being flashed.
        board: BoardId,
        /// The sequencer stage at which the job failed.
        stage: String,
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Main error type for MPPCKit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Control loop error
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Calibration error
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Upload error
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a per-request timeout (recoverable by the caller)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Timeout { .. }))
    }

    /// Check if this is a transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this is a safety trip
    pub fn is_safety_trip(&self) -> bool {
        matches!(self, Error::Control(ControlError::SafetyTripped { .. }))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
