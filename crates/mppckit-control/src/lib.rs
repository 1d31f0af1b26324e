//! Telemetry polling, safety supervision and calibration for MPPCKit.
//!
//! The pieces compose in one direction: the [`ControlLoop`] polls the
//! device and feeds every sample to the [`SafetySupervisor`], which alone
//! decides whether setpoint work (the [`VoltageRamp`]) may touch the
//! hardware this cycle. The [`CalibrationEngine`] runs standalone while
//! the loop is stopped, against the same `DeviceHandle`.

pub mod calibration;
pub mod convergence;
pub mod monitor;
pub mod supervisor;

pub use calibration::{CalibrationConfig, CalibrationEngine};
pub use convergence::{RampConfig, RampStep, VoltageRamp};
pub use monitor::{ControlLoop, ControlLoopConfig};
pub use supervisor::{SafetySupervisor, SupervisorConfig, SupervisorVerdict};
