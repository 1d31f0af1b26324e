//! # MPPCKit
//!
//! Control, safety supervision and firmware updating for a two-board
//! MPPC detector unit (computer board plus front-end board) behind a
//! single serial link.
//!
//! ## Architecture
//!
//! MPPCKit is organized as a workspace with multiple crates:
//!
//! 1. **mppckit-core** - Error types, domain types, event bus
//! 2. **mppckit-settings** - JSON configuration with validation
//! 3. **mppckit-device** - Serial transport, wire codec, device handle, simulator
//! 4. **mppckit-control** - Telemetry loop, safety supervisor, calibration
//! 5. **mppckit-flasher** - Firmware upload sequencer and image writer
//! 6. **mppckit** - Main binary that integrates all crates
//!
//! ## Features
//!
//! - **Typed device handle**: every raw wire value converted to
//!   engineering units in exactly one place
//! - **Safety supervision**: latched Normal/Warning/Tripped state machine
//!   with a guaranteed shutdown-before-anything-else rule
//! - **Bias voltage convergence**: bounded-step ramp against the observed
//!   supply behavior
//! - **Front-end calibration**: offset search with crash-safe persistence
//! - **Firmware upload sequencing**: correct ISP/pass-through ordering for
//!   one or both boards, with retries around the flaky vendor tool
//! - **Simulator**: full protocol double for development without hardware

pub use mppckit_core::event_bus;
pub use mppckit_core::{
    BoardId, BoardState, CalibrationError, CalibrationRecord, Channel, ConnectionEvent,
    ControlError, DeviceEvent, Error, EventCategory, EventFilter, MonitoredFeature, ProtocolError,
    Result, SafeRange, SafetyEvent, SetpointTarget, SignalType, SupervisorState, TelemetryEvent,
    TelemetrySample, TransportError, UploadError, UploadEvent, UploadJob,
};

pub use mppckit_settings::{Config, ConnectionSettings, SetpointSettings, ThermalSettings};

pub use mppckit_device::{
    list_ports, DeviceHandle, DeviceIdentity, SerialPortInfo, SimFault, SimulatedDevice, Transport,
    POWER_OFF_TEMP_C,
};

pub use mppckit_control::{
    CalibrationConfig, CalibrationEngine, ControlLoop, ControlLoopConfig, RampConfig,
    SafetySupervisor, SupervisorConfig, SupervisorVerdict, VoltageRamp,
};

pub use mppckit_flasher::{
    probe_board_states, ImageWriter, IspToolWriter, Reconnect, SequencerConfig, UploadRequest,
    UploadSequencer, UploadStage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output with compact formatting
/// - RUST_LOG environment variable support
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
