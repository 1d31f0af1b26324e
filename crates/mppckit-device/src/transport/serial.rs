//! Serial port transport implementation
//!
//! Provides port enumeration and the real serial `Transport` used to talk
//! to the detector unit over USB.
//!
//! Supports:
//! - Port enumeration filtered to USB serial patterns
//! - Opening with input purge (stale bytes from a prior session)
//! - Byte-wise blocking reads with a short poll slice

use mppckit_core::{Result, TransportError};
use std::io::Read;
use std::time::Duration;

use super::Transport;

/// Poll slice for a single byte read. Frame deadlines are enforced by the
/// framing layer on top of this.
const READ_SLICE: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// USB serial number if available
    pub serial_number: Option<String>,
}

/// List available serial ports on the system
///
/// Filters ports to the patterns a detector can show up as:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => {
            let port_infos: Vec<SerialPortInfo> = ports
                .iter()
                .filter(|port| is_candidate_port(&port.port_name))
                .map(|port| {
                    let serial_number = match &port.port_type {
                        serialport::SerialPortType::UsbPort(usb) => usb.serial_number.clone(),
                        _ => None,
                    };
                    SerialPortInfo {
                        port_name: port.port_name.clone(),
                        description: port_description(port),
                        serial_number,
                    }
                })
                .collect();

            Ok(port_infos)
        }
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(TransportError::Io {
                reason: format!("Failed to enumerate ports: {}", e),
            }
            .into())
        }
    }
}

/// Check if a port name matches the patterns a USB device can appear as
fn is_candidate_port(port_name: &str) -> bool {
    // Windows COM ports
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // Linux USB and ACM devices
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }

    // macOS serial and modem devices
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }

    false
}

/// Get a user-friendly description for a port
fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Real serial transport using the serialport crate
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open a serial port and purge any stale input
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let mut port = serialport::new(port_name, baud_rate)
            .timeout(READ_SLICE)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| TransportError::FailedToOpen {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        // Purge bytes left over from a previous session, then drain until a
        // read comes back empty so the first frame starts clean.
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| TransportError::Io {
                reason: format!("Failed to purge {}: {}", port_name, e),
            })?;
        let mut scratch = [0u8; 64];
        loop {
            match port.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    return Err(TransportError::Io {
                        reason: format!("Failed to drain {}: {}", port_name, e),
                    }
                    .into())
                }
            }
        }

        tracing::debug!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        use std::io::Write;
        self.port.write_all(data).map_err(|e| TransportError::Io {
            reason: format!("Write to {} failed: {}", self.name, e),
        })?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(TransportError::Io {
                reason: format!("Read from {} failed: {}", self.name, e),
            }
            .into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_port_patterns() {
        assert!(is_candidate_port("COM3"));
        assert!(is_candidate_port("/dev/ttyUSB0"));
        assert!(is_candidate_port("/dev/ttyACM1"));
        assert!(is_candidate_port("/dev/cu.usbmodem14101"));
        assert!(!is_candidate_port("/dev/ttyS0"));
        assert!(!is_candidate_port("COMX"));
        assert!(!is_candidate_port("/dev/random"));
    }
}
