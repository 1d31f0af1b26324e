//! # MPPCKit Device
//!
//! Serial transport, wire protocol codec, exclusive device handle and the
//! in-memory simulator for the MPPC detector unit.

pub mod handle;
pub mod protocol;
pub mod simulator;
pub mod transport;

pub use handle::{DeviceHandle, DeviceIdentity, POWER_OFF_TEMP_C};
pub use simulator::{SimFault, SimulatedDevice};
pub use transport::serial::{list_ports, SerialPortInfo, SerialTransport};
pub use transport::Transport;
