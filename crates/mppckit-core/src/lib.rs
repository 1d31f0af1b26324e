//! # MPPCKit Core
//!
//! Core types for the MPPCKit detector supervisor: the shared data model,
//! the error taxonomy, and the event bus used to observe a running session.

pub mod error;
pub mod event_bus;
pub mod types;

pub use error::{
    CalibrationError, ControlError, Error, ProtocolError, Result, TransportError, UploadError,
};

pub use event_bus::{
    event_bus, ConnectionEvent, DeviceEvent, EventBus, EventCategory, EventFilter, SafetyEvent,
    SubscriptionId, TelemetryEvent, UploadEvent,
};

pub use types::{
    BoardId, BoardState, CalibrationRecord, Channel, MonitoredFeature, SafeRange, SetpointTarget,
    SignalType, SupervisorState, TelemetrySample, UploadJob,
};
