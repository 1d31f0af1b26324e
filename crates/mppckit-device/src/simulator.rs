//! In-memory detector simulator.
//!
//! Implements the full frame grammar and per-opcode behavior of the real
//! firmware against the `Transport` trait, so the handle, control loop and
//! calibration engine can be exercised without hardware. State fields are
//! public so tests can arrange telemetry scenarios directly.

use mppckit_core::Result;
use std::collections::VecDeque;

use crate::protocol::{ACK, EOT, ID_BIN, ID_CMD, ID_STATUS, NAK, SOH, US};
use crate::transport::Transport;

const PAD: u8 = b'x';

/// Fault injection modes for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimFault {
    /// Answer every command normally.
    #[default]
    None,
    /// Swallow commands without answering; the host sees timeouts.
    Silent,
    /// NAK every command as if the opcode were unknown.
    NakAll,
}

/// Simulated detector unit.
pub struct SimulatedDevice {
    out: VecDeque<u8>,

    /// Bias voltage, negated microvolts.
    pub voltage_uv: i32,
    /// Output offset, raw DAC counts.
    pub offset_raw: i32,
    /// PGA gain, micro-units.
    pub gain_u: i32,
    /// Sensor temperature, micro-degrees Celsius.
    pub mppc_temp_uc: i32,
    /// Cold plate temperature, micro-degrees Celsius.
    pub cold_plate_uc: i32,
    /// Hot plate temperature, micro-degrees Celsius.
    pub hot_plate_uc: i32,
    /// Output reading, raw ADC counts.
    pub output_raw: i32,
    /// Chamber pressure, raw wire units (value / 1000 = mbar).
    pub vacuum_raw: i32,
    /// TEC current, milliamps.
    pub tec_ma: i32,
    /// Error register; 8 means no error.
    pub error_code: u8,
    /// Channel flag byte.
    pub channel_flag: u8,
    /// Front-end offset DAC value.
    pub fe_offset: u32,
    /// Offset at which the front-end output crosses zero.
    pub fe_zero_offset: u32,
    /// Microvolts of front-end output per DAC count below the crossing.
    pub fe_output_slope_uv: i32,
    /// Force a negative front-end output reading (hardware fault case).
    pub fe_output_negative: bool,
    /// Report the front-end firmware as missing.
    pub frontend_blank: bool,
    /// Active fault injection mode.
    pub fault: SimFault,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            out: VecDeque::new(),
            voltage_uv: -12_000_000,
            offset_raw: 2000,
            gain_u: 10_000_000,
            mppc_temp_uc: 30_000_000,
            cold_plate_uc: 24_000_000,
            hot_plate_uc: 35_000_000,
            output_raw: 800,
            vacuum_raw: 3_000,
            tec_ma: 100,
            error_code: 8,
            channel_flag: 7,
            fe_offset: 513,
            fe_zero_offset: 513,
            fe_output_slope_uv: 2_000,
            fe_output_negative: false,
            frontend_blank: false,
            fault: SimFault::None,
        }
    }

    /// Queue a stale EOT as if a prior session died mid-frame.
    pub fn push_stale_eot(&mut self) {
        self.out.push_back(EOT);
    }

    fn send_status(&mut self, code: u8) {
        self.out
            .extend([SOH, ID_STATUS, code, US, code, EOT]);
    }

    fn send_answer(&mut self, payload: &[u8]) {
        self.out
            .extend([SOH, ID_BIN, payload.len() as u8, US]);
        self.out.extend(payload.iter().copied());
        self.out.push_back(EOT);
    }

    fn send_string(&mut self, s: &str) {
        let mut padded = s.as_bytes().to_vec();
        padded.resize(40, PAD);
        self.send_answer(&padded);
    }

    fn ack_i32(&mut self, value: i32) {
        self.send_status(ACK);
        self.send_answer(&value.to_le_bytes());
    }

    fn frontend_output_uv(&self) -> i32 {
        if self.fe_output_negative {
            return -50_000;
        }
        let below = self.fe_zero_offset.saturating_sub(self.fe_offset);
        below as i32 * self.fe_output_slope_uv
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        if frame.len() < 5 || frame[0] != SOH || frame[1] != ID_CMD || *frame.last().unwrap() != EOT
        {
            self.send_status(NAK);
            return;
        }
        let arglen = frame[2] as usize;
        let opcode = frame[3];
        if frame.len() != arglen + 5 {
            self.send_status(NAK);
            return;
        }
        let arg = &frame[4..4 + arglen];

        let arg_i32 = |a: &[u8]| -> i32 {
            let mut b = [0u8; 4];
            b[..a.len().min(4)].copy_from_slice(&a[..a.len().min(4)]);
            i32::from_le_bytes(b)
        };

        match opcode {
            0x60 => {
                self.send_status(ACK);
                self.send_string("SIMULATED_MPPC_HARDWARE");
            }
            0x61 => {
                self.send_status(ACK);
                self.send_string("SIMULATED_MPPC_FIRMWARE");
            }
            0x64 => {
                self.send_status(ACK);
                self.send_string("SIMULATED_00000000");
            }
            0x70 => {
                self.send_status(ACK);
                self.send_string("SIMULATED_FE_HARDWARE");
            }
            0x71 => {
                self.send_status(ACK);
                if self.frontend_blank {
                    self.send_string("unknown");
                } else {
                    self.send_string("SIMULATED_FE_FIRMWARE");
                }
            }
            0x74 => {
                self.send_status(ACK);
                self.send_string("SIMULATED_FE_00000000");
            }
            0xca => self.ack_i32(self.voltage_uv),
            0xc9 => {
                self.send_status(ACK);
                self.voltage_uv = arg_i32(arg);
            }
            0xe0 => self.ack_i32(self.offset_raw),
            0xbf => {
                self.send_status(ACK);
                self.offset_raw = arg_i32(arg);
            }
            0x9a => self.ack_i32(self.fe_offset as i32),
            0x9b => {
                self.send_status(ACK);
                self.fe_offset = arg_i32(arg) as u32;
            }
            0x88 => self.ack_i32(self.gain_u),
            0x89 => {
                self.send_status(ACK);
                self.gain_u = arg_i32(arg);
            }
            0xb1 => self.ack_i32(self.mppc_temp_uc),
            0xb0 => {
                // The real plant ramps over minutes; converge instantly so
                // stabilization loops finish in one poll.
                self.send_status(ACK);
                let target = arg_i32(arg);
                self.mppc_temp_uc = target;
                self.cold_plate_uc = target;
            }
            0x8d => self.ack_i32(self.hot_plate_uc),
            0x8c => self.ack_i32(self.cold_plate_uc),
            0xbe | 0xbb | 0xbc => self.ack_i32(self.output_raw),
            0x95 => {
                let uv = self.frontend_output_uv();
                self.ack_i32(uv);
            }
            0x92 => self.ack_i32(self.vacuum_raw),
            0x90 => {
                self.send_status(ACK);
                let flag = self.channel_flag;
                self.send_answer(&[flag]);
            }
            0x91 => {
                self.send_status(ACK);
                self.channel_flag = arg.first().copied().unwrap_or(0);
            }
            0xba | 0xbd => self.send_status(ACK),
            0xcd => self.ack_i32(self.tec_ma),
            0x9e => {
                self.send_status(ACK);
                let code = self.error_code;
                self.send_answer(&[code]);
            }
            0xfe | 0xff | 0x65 => self.send_status(ACK),
            _ => {
                tracing::debug!("Simulator: unknown opcode 0x{:02x}", opcode);
                self.send_status(NAK);
            }
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedDevice {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        match self.fault {
            SimFault::Silent => Ok(()),
            SimFault::NakAll => {
                self.send_status(NAK);
                Ok(())
            }
            SimFault::None => {
                let frame = data.to_vec();
                self.handle_frame(&frame);
                Ok(())
            }
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.out.pop_front())
    }

    fn name(&self) -> &str {
        "simulator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_command, Command};

    fn drain(sim: &mut SimulatedDevice) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Ok(Some(b)) = sim.read_byte() {
            bytes.push(b);
        }
        bytes
    }

    #[test]
    fn test_query_produces_status_then_payload() {
        let mut sim = SimulatedDevice::new();
        sim.send(&encode_command(&Command::GetVoltage)).unwrap();
        let bytes = drain(&mut sim);

        // status frame
        assert_eq!(&bytes[..6], &[SOH, ID_STATUS, ACK, US, ACK, EOT]);
        // binary payload frame with the stored voltage
        assert_eq!(bytes[6], SOH);
        assert_eq!(bytes[7], ID_BIN);
        assert_eq!(bytes[8], 4);
        assert_eq!(bytes[9], US);
        assert_eq!(
            i32::from_le_bytes(bytes[10..14].try_into().unwrap()),
            -12_000_000
        );
        assert_eq!(bytes[14], EOT);
    }

    #[test]
    fn test_set_updates_state() {
        let mut sim = SimulatedDevice::new();
        sim.send(&encode_command(&Command::SetVoltage(-60_000_000)))
            .unwrap();
        assert_eq!(sim.voltage_uv, -60_000_000);
        let bytes = drain(&mut sim);
        assert_eq!(bytes, vec![SOH, ID_STATUS, ACK, US, ACK, EOT]);
    }

    #[test]
    fn test_garbled_frame_naks() {
        let mut sim = SimulatedDevice::new();
        sim.send(&[SOH, ID_CMD, 9, 0xca, EOT]).unwrap();
        let bytes = drain(&mut sim);
        assert_eq!(bytes[2], NAK);
    }

    #[test]
    fn test_frontend_output_model() {
        let mut sim = SimulatedDevice::new();
        sim.fe_zero_offset = 500;
        sim.fe_output_slope_uv = 1000;

        sim.fe_offset = 400;
        assert_eq!(sim.frontend_output_uv(), 100_000);

        sim.fe_offset = 500;
        assert_eq!(sim.frontend_output_uv(), 0);

        sim.fe_offset = 600;
        assert_eq!(sim.frontend_output_uv(), 0);

        sim.fe_output_negative = true;
        assert!(sim.frontend_output_uv() < 0);
    }

    #[test]
    fn test_silent_fault_swallows_commands() {
        let mut sim = SimulatedDevice::new();
        sim.fault = SimFault::Silent;
        sim.send(&encode_command(&Command::GetVoltage)).unwrap();
        assert!(drain(&mut sim).is_empty());
    }
}
