//! # MPPCKit Settings
//!
//! Configuration file handling for MPPCKit sessions.

pub mod config;

pub use config::{
    Config, ConnectionSettings, FlashingSettings, SafeRangeSettings, SetpointSettings,
    SignalSettings, SupervisorSettings, ThermalSettings,
};
