//! Transport abstraction for the serial link to the detector.
//!
//! The device handle owns exactly one `Transport`. The real implementation
//! wraps a serial port; tests and `--simulate` use the in-memory simulator.

pub mod framing;
pub mod serial;

use mppckit_core::Result;

/// Byte-level channel to the detector unit.
///
/// `read_byte` blocks for at most a short poll slice and returns `Ok(None)`
/// when no byte arrived; callers accumulate slices against their own
/// deadline (see [`framing::read_frame`]).
pub trait Transport: Send {
    /// Write a complete frame to the device.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read a single byte, or None if nothing arrived within the poll slice.
    fn read_byte(&mut self) -> Result<Option<u8>>;

    /// Endpoint name for logging (port path or "simulator").
    fn name(&self) -> &str;
}
