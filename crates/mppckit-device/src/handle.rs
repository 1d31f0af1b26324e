//! Exclusive device handle.
//!
//! `DeviceHandle` owns the transport for the duration of a session and is
//! the only place wire values are converted to engineering units. All
//! exchanges are blocking with a per-request timeout; there are no
//! internal retries, callers decide what a failure means.
//!
//! Unit conventions on the wire:
//! - bias voltage: negated microvolts (the hardware bias is negative)
//! - temperatures: micro-degrees Celsius
//! - gain: micro-units of the 0.5-64 PGA range
//! - offsets and output readings: raw 12-bit DAC/ADC counts
//! - pressure: value / 1000 = millibar
//! - front-end diagnostic output: microvolts

use chrono::Utc;
use mppckit_core::{
    Channel, Error, ProtocolError, Result, SetpointTarget, SignalType, TelemetrySample,
    TransportError,
};
use std::time::{Duration, Instant};

use crate::protocol::{
    decode_payload, decode_status, encode_command, payload_i32, payload_string, payload_u32,
    payload_u8, Command,
};
use crate::transport::framing::read_frame;
use crate::transport::serial::{list_ports, SerialTransport};
use crate::transport::Transport;

/// Substring the hardware version string must contain to be accepted
const IDENTITY_TAG: &str = "mppc";

/// Target temperature commanded as part of the shutdown sequence
pub const POWER_OFF_TEMP_C: f64 = 24.0;

/// Gain range of the PGA, mapped to 0-100 percent for callers
const GAIN_MIN: f64 = 0.5;
const GAIN_SPAN: f64 = 63.5;

/// Full scale of the offset DAC and output ADC
const DAC_FULL_SCALE: f64 = 4095.0;

/// Identity strings of both boards, read once at connect
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Computer board hardware version
    pub hardware_version: String,
    /// Computer board firmware version
    pub firmware_version: String,
    /// Computer board serial number
    pub serial_number: String,
    /// Front-end hardware version
    pub frontend_hardware_version: String,
    /// Front-end firmware version; contains "unknown" when the board is blank
    pub frontend_firmware_version: String,
    /// Front-end serial number
    pub frontend_serial_number: String,
}

impl DeviceIdentity {
    /// Whether the front-end board answered with real firmware
    pub fn frontend_present(&self) -> bool {
        !self.frontend_firmware_version.is_empty()
            && !self
                .frontend_firmware_version
                .to_lowercase()
                .contains("unknown")
    }
}

/// Exclusive owner of the serial link to one detector unit.
pub struct DeviceHandle {
    transport: Box<dyn Transport>,
    timeout: Duration,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("port", &self.transport.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DeviceHandle {
    /// Attach to an already-open transport, verifying the device identity.
    ///
    /// The hardware version is queried and must identify a detector;
    /// anything else is rejected so a probe can move on to the next port.
    pub fn attach(transport: Box<dyn Transport>, timeout: Duration) -> Result<Self> {
        let mut handle = Self { transport, timeout };
        let idn = handle.get_hardware_version()?;
        if !idn.to_lowercase().contains(IDENTITY_TAG) {
            return Err(ProtocolError::IdentityMismatch { identity: idn }.into());
        }
        tracing::info!("Detector identified on {}: {}", handle.port_name(), idn);
        Ok(handle)
    }

    /// Open a specific serial port and attach.
    pub fn open_port(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let transport = SerialTransport::open(port, baud_rate)?;
        Self::attach(Box::new(transport), timeout)
    }

    /// Probe all candidate serial ports for a detector.
    pub fn probe(baud_rate: u32, timeout: Duration) -> Result<Self> {
        let ports = list_ports()?;
        let mut probed = Vec::new();
        for info in &ports {
            probed.push(info.port_name.clone());
            tracing::debug!("Probing {} ({})", info.port_name, info.description);
            match Self::open_port(&info.port_name, baud_rate, timeout) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    tracing::info!("No detector on {}: {}", info.port_name, e);
                    continue;
                }
            }
        }
        Err(TransportError::DeviceNotFound { probed }.into())
    }

    /// Port path or "simulator"
    pub fn port_name(&self) -> &str {
        self.transport.name()
    }

    /// Give up the transport; the handle cannot be used afterwards.
    ///
    /// Used by the upload sequencer, which talks to the boot ROM through
    /// an external tool on the same port.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    fn command(&mut self, cmd: Command) -> Result<()> {
        tracing::trace!("-> {}", cmd.name());
        self.transport.send(&encode_command(&cmd))?;
        let status = read_frame(self.transport.as_mut(), self.timeout)?;
        decode_status(&status, &cmd)
    }

    fn query(&mut self, cmd: Command) -> Result<Vec<u8>> {
        self.command(cmd)?;
        let frame = read_frame(self.transport.as_mut(), self.timeout)?;
        decode_payload(&frame, &cmd)
    }

    fn query_string(&mut self, cmd: Command) -> Result<String> {
        let payload = self.query(cmd)?;
        Ok(payload_string(&payload))
    }

    fn query_i32(&mut self, cmd: Command) -> Result<i32> {
        let payload = self.query(cmd)?;
        payload_i32(&payload, &cmd)
    }

    /// Computer board hardware version (identity string)
    pub fn get_hardware_version(&mut self) -> Result<String> {
        self.query_string(Command::GetHardwareVersion)
    }

    /// Computer board firmware version
    pub fn get_firmware_version(&mut self) -> Result<String> {
        self.query_string(Command::GetFirmwareVersion)
    }

    /// Computer board serial number
    pub fn get_serial_number(&mut self) -> Result<String> {
        self.query_string(Command::GetSerialNumber)
    }

    /// Front-end firmware version; "unknown" means the board is blank
    pub fn get_frontend_firmware_version(&mut self) -> Result<String> {
        self.query_string(Command::GetFrontendFirmwareVersion)
    }

    /// Read the identity strings of both boards
    pub fn identify(&mut self) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity {
            hardware_version: self.query_string(Command::GetHardwareVersion)?,
            firmware_version: self.query_string(Command::GetFirmwareVersion)?,
            serial_number: self.query_string(Command::GetSerialNumber)?,
            frontend_hardware_version: self.query_string(Command::GetFrontendHardwareVersion)?,
            frontend_firmware_version: self.query_string(Command::GetFrontendFirmwareVersion)?,
            frontend_serial_number: self.query_string(Command::GetFrontendSerialNumber)?,
        })
    }

    /// Bias voltage in volts (0 to 80)
    pub fn get_voltage(&mut self) -> Result<f64> {
        let raw = self.query_i32(Command::GetVoltage)?;
        Ok(raw as f64 * -1e-6)
    }

    /// Command the bias voltage in volts (0 to 80)
    pub fn set_voltage(&mut self, volts: f64) -> Result<()> {
        if !(0.0..=80.0).contains(&volts) {
            return Err(Error::other(format!(
                "Voltage {:.3} V outside 0..=80 V",
                volts
            )));
        }
        let raw = (-volts * 1e6) as i32;
        self.command(Command::SetVoltage(raw))
    }

    /// Gain as a percentage of the PGA range
    pub fn get_gain(&mut self) -> Result<f64> {
        let raw = self.query_i32(Command::GetGain)?;
        let gain = raw as f64 * 1e-6;
        Ok((gain - GAIN_MIN) / GAIN_SPAN * 100.0)
    }

    /// Set the gain as a percentage of the PGA range
    pub fn set_gain(&mut self, pct: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&pct) {
            return Err(Error::other(format!("Gain {:.3}% outside 0..=100%", pct)));
        }
        let gain = pct / 100.0 * GAIN_SPAN + GAIN_MIN;
        self.command(Command::SetGain((gain * 1e6) as i32))
    }

    /// Output offset as a percentage of the DAC range
    pub fn get_offset(&mut self) -> Result<f64> {
        let raw = self.query_i32(Command::GetOffset)?;
        Ok(raw as f64 / DAC_FULL_SCALE * 100.0)
    }

    /// Set the output offset as a percentage of the DAC range
    pub fn set_offset(&mut self, pct: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&pct) {
            return Err(Error::other(format!("Offset {:.3}% outside 0..=100%", pct)));
        }
        self.command(Command::SetOffset((pct / 100.0 * DAC_FULL_SCALE) as i32))
    }

    /// Raw front-end offset DAC value
    pub fn get_frontend_offset(&mut self) -> Result<u16> {
        let cmd = Command::GetFrontendOffset;
        let payload = self.query(cmd)?;
        Ok(payload_u32(&payload, &cmd)? as u16)
    }

    /// Set the raw front-end offset DAC value
    pub fn set_frontend_offset(&mut self, value: u16) -> Result<()> {
        self.command(Command::SetFrontendOffset(value as u32))
    }

    /// Sensor temperature in degrees Celsius
    pub fn get_mppc_temp(&mut self) -> Result<f64> {
        Ok(self.query_i32(Command::GetMppcTemp)? as f64 * 1e-6)
    }

    /// Set the target sensor temperature in degrees Celsius
    pub fn set_target_mppc_temp(&mut self, celsius: f64) -> Result<()> {
        if !(-20.0..=70.0).contains(&celsius) {
            return Err(Error::other(format!(
                "Temperature {:.3} C outside -20..=70 C",
                celsius
            )));
        }
        self.command(Command::SetTargetMppcTemp((celsius * 1e6) as i32))
    }

    /// Cold plate temperature in degrees Celsius
    pub fn get_cold_plate_temp(&mut self) -> Result<f64> {
        Ok(self.query_i32(Command::GetColdPlateTemp)? as f64 * 1e-6)
    }

    /// Hot plate (heatsink) temperature in degrees Celsius
    pub fn get_hot_plate_temp(&mut self) -> Result<f64> {
        Ok(self.query_i32(Command::GetHotPlateTemp)? as f64 * 1e-6)
    }

    /// Chamber pressure in millibar
    pub fn get_vacuum_pressure(&mut self) -> Result<f64> {
        Ok(self.query_i32(Command::GetVacuumPressure)? as f64 * 1e-3)
    }

    /// Signal output level as a percentage of full scale
    pub fn get_output_level(&mut self, signal: SignalType) -> Result<f64> {
        let cmd = match signal {
            SignalType::SingleEnded => Command::GetSingleEndedOutput,
            SignalType::Differential => Command::GetDifferentialPlus,
        };
        Ok(self.query_i32(cmd)? as f64 / DAC_FULL_SCALE * 100.0)
    }

    /// Front-end diagnostic output voltage in volts
    pub fn get_frontend_output_voltage(&mut self) -> Result<f64> {
        Ok(self.query_i32(Command::GetFrontendOutputVoltage)? as f64 * 1e-6)
    }

    /// TEC current in milliamps
    pub fn get_tec_current(&mut self) -> Result<f64> {
        Ok(self.query_i32(Command::GetTecCurrent)? as f64)
    }

    /// Device error register; 8 means no error
    pub fn get_error_status(&mut self) -> Result<u8> {
        let cmd = Command::GetErrorStatus;
        let payload = self.query(cmd)?;
        payload_u8(&payload, &cmd)
    }

    /// Selected optical channel
    pub fn get_channel(&mut self) -> Result<Channel> {
        let cmd = Command::GetChannel;
        let payload = self.query(cmd)?;
        let flag = payload_u8(&payload, &cmd)?;
        Channel::from_flag(flag).ok_or_else(|| {
            ProtocolError::MalformedResponse {
                command: cmd.name().to_string(),
                reason: format!("unknown channel flag 0x{:02x}", flag),
            }
            .into()
        })
    }

    /// Select the optical channel
    pub fn set_channel(&mut self, channel: Channel) -> Result<()> {
        self.command(Command::SetChannel(channel.to_flag()))
    }

    /// Select differential or single-ended output.
    ///
    /// The inactive mode is disabled before the active one is enabled so
    /// both outputs are never driven at once.
    pub fn set_signal_type(&mut self, signal: SignalType) -> Result<()> {
        match signal {
            SignalType::SingleEnded => {
                self.command(Command::SetDifferentialOutput(0x00))?;
                self.command(Command::SetSingleEndedOutput(0xff))
            }
            SignalType::Differential => {
                self.command(Command::SetSingleEndedOutput(0x00))?;
                self.command(Command::SetDifferentialOutput(0xff))
            }
        }
    }

    /// Reboot the computer board into its ISP bootloader
    pub fn enter_computer_isp(&mut self) -> Result<()> {
        self.command(Command::EnterComputerIsp)
    }

    /// Put a programmed front-end into ISP mode
    pub fn enter_frontend_isp(&mut self) -> Result<()> {
        self.command(Command::EnterFrontendIsp)
    }

    /// Pass serial traffic through to a blank front-end
    pub fn enter_passthrough(&mut self) -> Result<()> {
        self.command(Command::EnterPassthrough)
    }

    /// Apply a full operating point.
    ///
    /// Writes everything except the bias voltage, which the control loop
    /// ramps in bounded steps instead of commanding directly.
    pub fn apply_setpoint(&mut self, target: &SetpointTarget) -> Result<()> {
        self.set_signal_type(target.signal)?;
        self.set_channel(target.channel)?;
        self.set_gain(target.gain_pct)?;
        self.set_offset(target.offset_pct)?;
        if let Some(offset) = target.frontend_offset {
            self.set_frontend_offset(offset)?;
        }
        Ok(())
    }

    /// Take one telemetry snapshot.
    ///
    /// Queries each monitored feature in a fixed order over the blocking
    /// link and stamps the result. Any decode or transport failure aborts
    /// the whole sample; a partial snapshot is never returned.
    pub fn read_sample(&mut self, signal: SignalType) -> Result<TelemetrySample> {
        let mppc_temp_c = self.get_mppc_temp()?;
        let heatsink_temp_c = self.get_hot_plate_temp()?;
        let vacuum_pressure_mbar = self.get_vacuum_pressure()?;
        let mppc_current_ma = self.get_tec_current()?;
        let output_level_v = self.get_output_level(signal)?;
        let frontend_output_v = self.get_frontend_output_voltage()?;
        let error_code = self.get_error_status()?;

        Ok(TelemetrySample {
            mppc_temp_c,
            heatsink_temp_c,
            vacuum_pressure_mbar,
            mppc_current_ma,
            output_level_v,
            frontend_output_v,
            error_code,
            timestamp: Utc::now(),
        })
    }

    /// Bring the detector to its safe idle state.
    ///
    /// Bias voltage goes to zero first; only then is the thermal target
    /// released to the power-off temperature.
    pub fn shutdown(&mut self) -> Result<()> {
        tracing::warn!("Shutting down detector on {}", self.port_name());
        self.set_voltage(0.0)?;
        self.set_target_mppc_temp(POWER_OFF_TEMP_C)
    }

    /// Write a value and wait for its readback to stabilize.
    ///
    /// The value is written once, then polled until `repeats` consecutive
    /// readings fall within `tolerance` of the target or the timeout
    /// passes. Returns the last reading either way; the caller decides
    /// whether a non-converged value is acceptable.
    pub fn stabilize(
        &mut self,
        set: fn(&mut Self, f64) -> Result<()>,
        get: fn(&mut Self) -> Result<f64>,
        target: f64,
        tolerance: f64,
        repeats: u32,
        interval: Duration,
        timeout: Duration,
    ) -> Result<f64> {
        set(self, target)?;
        let start = Instant::now();
        let mut stable = 0u32;
        loop {
            let current = get(self)?;
            if (current - target).abs() < tolerance {
                stable += 1;
                if stable >= repeats {
                    return Ok(current);
                }
            } else {
                stable = 0;
            }
            if start.elapsed() >= timeout {
                tracing::debug!(
                    "Readback did not stabilize at {:.3} within {:?}, last {:.3}",
                    target,
                    timeout,
                    current
                );
                return Ok(current);
            }
            std::thread::sleep(interval);
        }
    }
}
