//! Wire protocol codec for the detector unit.
//!
//! Command frames are binary:
//!
//! ```text
//! SOH  ID_CMD  ARGLEN  OPCODE  ARG[ARGLEN]  EOT
//! ```
//!
//! Every command is acknowledged with a status frame
//! `SOH 'S' code US code EOT` (ACK or NAK). Queries are then answered with
//! a payload frame, either ASCII (`SOH 'M' ... EOT`) or binary
//! (`SOH 'B' LEN US payload EOT`). Numeric payloads are little-endian
//! 32-bit integers in micro-units; scaling to engineering units lives in
//! the device handle, not here.
//!
//! The command set is a closed enum: every supported operation has a
//! variant, and there is no path to send a raw opcode the codec does not
//! know about. A NAK from the device decodes to `UnknownCommand`.

use mppckit_core::{ProtocolError, Result};

/// Start of header
pub const SOH: u8 = 0x01;
/// End of transmission, frame terminator
pub const EOT: u8 = 0x04;
/// Positive acknowledgement status code
pub const ACK: u8 = 0x06;
/// Negative acknowledgement status code
pub const NAK: u8 = 0x15;
/// Unit separator inside status and binary frames
pub const US: u8 = 0x1F;
/// Packet identifier for host commands
pub const ID_CMD: u8 = 0x43;
/// Packet identifier for status responses
pub const ID_STATUS: u8 = b'S';
/// Packet identifier for ASCII payload responses
pub const ID_ASCII: u8 = b'M';
/// Packet identifier for binary payload responses
pub const ID_BIN: u8 = b'B';

/// Argument byte for entering computer-board ISP mode
pub const ISP_MAGIC: u8 = 235;
/// Argument byte for entering pass-through mode
pub const PASSTHROUGH_MAGIC: u8 = 255;

/// Typed command argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// No argument
    None,
    /// Single byte
    U8(u8),
    /// Signed 32-bit little-endian, micro-units
    I32(i32),
    /// Unsigned 32-bit little-endian
    U32(u32),
}

impl Arg {
    fn to_bytes(self) -> Vec<u8> {
        match self {
            Arg::None => Vec::new(),
            Arg::U8(v) => vec![v],
            Arg::I32(v) => v.to_le_bytes().to_vec(),
            Arg::U32(v) => v.to_le_bytes().to_vec(),
        }
    }
}

/// One operation the detector firmware supports.
///
/// Set variants carry their raw wire value; conversion from engineering
/// units happens in the device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Computer board hardware version string (also the identity probe)
    GetHardwareVersion,
    /// Computer board firmware version string
    GetFirmwareVersion,
    /// Computer board serial number string
    GetSerialNumber,
    /// Front-end board hardware version string
    GetFrontendHardwareVersion,
    /// Front-end board firmware version string
    GetFrontendFirmwareVersion,
    /// Front-end board serial number string
    GetFrontendSerialNumber,
    /// Bias voltage, negated microvolts
    GetVoltage,
    /// Set bias voltage, negated microvolts
    SetVoltage(i32),
    /// PGA gain, microunits
    GetGain,
    /// Set PGA gain, microunits
    SetGain(i32),
    /// Output offset, raw DAC counts
    GetOffset,
    /// Set output offset, raw DAC counts
    SetOffset(i32),
    /// Front-end offset DAC value
    GetFrontendOffset,
    /// Set front-end offset DAC value
    SetFrontendOffset(u32),
    /// Sensor temperature, micro-degrees Celsius
    GetMppcTemp,
    /// Set target sensor temperature, micro-degrees Celsius
    SetTargetMppcTemp(i32),
    /// Cold plate temperature, micro-degrees Celsius
    GetColdPlateTemp,
    /// Hot plate (heatsink) temperature, micro-degrees Celsius
    GetHotPlateTemp,
    /// Single-ended output reading, raw counts
    GetSingleEndedOutput,
    /// Differential output plus side, raw counts
    GetDifferentialPlus,
    /// Differential output minus side, raw counts
    GetDifferentialMinus,
    /// Front-end diagnostic output voltage, microvolts
    GetFrontendOutputVoltage,
    /// Chamber pressure, raw millionths of bar
    GetVacuumPressure,
    /// Optical channel flag byte
    GetChannel,
    /// Set optical channel flag byte
    SetChannel(u8),
    /// Enable (0xff) or disable (0x00) differential output
    SetDifferentialOutput(u8),
    /// Enable (0xff) or disable (0x00) single-ended output
    SetSingleEndedOutput(u8),
    /// TEC current
    GetTecCurrent,
    /// Device error register
    GetErrorStatus,
    /// Reboot the computer board into its ISP bootloader
    EnterComputerIsp,
    /// Put the front-end into ISP mode (requires front-end firmware)
    EnterFrontendIsp,
    /// Pass serial traffic through to a blank front-end
    EnterPassthrough,
}

impl Command {
    /// Wire opcode
    pub fn opcode(&self) -> u8 {
        match self {
            Command::GetHardwareVersion => 0x60,
            Command::GetFirmwareVersion => 0x61,
            Command::GetSerialNumber => 0x64,
            Command::GetFrontendHardwareVersion => 0x70,
            Command::GetFrontendFirmwareVersion => 0x71,
            Command::GetFrontendSerialNumber => 0x74,
            Command::GetVoltage => 0xca,
            Command::SetVoltage(_) => 0xc9,
            Command::GetGain => 0x88,
            Command::SetGain(_) => 0x89,
            Command::GetOffset => 0xe0,
            Command::SetOffset(_) => 0xbf,
            Command::GetFrontendOffset => 0x9a,
            Command::SetFrontendOffset(_) => 0x9b,
            Command::GetMppcTemp => 0xb1,
            Command::SetTargetMppcTemp(_) => 0xb0,
            Command::GetColdPlateTemp => 0x8c,
            Command::GetHotPlateTemp => 0x8d,
            Command::GetSingleEndedOutput => 0xbe,
            Command::GetDifferentialPlus => 0xbb,
            Command::GetDifferentialMinus => 0xbc,
            Command::GetFrontendOutputVoltage => 0x95,
            Command::GetVacuumPressure => 0x92,
            Command::GetChannel => 0x90,
            Command::SetChannel(_) => 0x91,
            Command::SetDifferentialOutput(_) => 0xba,
            Command::SetSingleEndedOutput(_) => 0xbd,
            Command::GetTecCurrent => 0xcd,
            Command::GetErrorStatus => 0x9e,
            Command::EnterComputerIsp => 0xfe,
            Command::EnterFrontendIsp => 0xff,
            Command::EnterPassthrough => 0x65,
        }
    }

    /// Argument carried by this command
    pub fn arg(&self) -> Arg {
        match self {
            Command::SetVoltage(v)
            | Command::SetGain(v)
            | Command::SetOffset(v)
            | Command::SetTargetMppcTemp(v) => Arg::I32(*v),
            Command::SetFrontendOffset(v) => Arg::U32(*v),
            Command::SetChannel(v)
            | Command::SetDifferentialOutput(v)
            | Command::SetSingleEndedOutput(v) => Arg::U8(*v),
            Command::EnterComputerIsp | Command::EnterFrontendIsp => Arg::U8(ISP_MAGIC),
            Command::EnterPassthrough => Arg::U8(PASSTHROUGH_MAGIC),
            _ => Arg::None,
        }
    }

    /// Whether a payload frame follows the status frame
    pub fn expects_payload(&self) -> bool {
        matches!(
            self,
            Command::GetHardwareVersion
                | Command::GetFirmwareVersion
                | Command::GetSerialNumber
                | Command::GetFrontendHardwareVersion
                | Command::GetFrontendFirmwareVersion
                | Command::GetFrontendSerialNumber
                | Command::GetVoltage
                | Command::GetGain
                | Command::GetOffset
                | Command::GetFrontendOffset
                | Command::GetMppcTemp
                | Command::GetColdPlateTemp
                | Command::GetHotPlateTemp
                | Command::GetSingleEndedOutput
                | Command::GetDifferentialPlus
                | Command::GetDifferentialMinus
                | Command::GetFrontendOutputVoltage
                | Command::GetVacuumPressure
                | Command::GetChannel
                | Command::GetTecCurrent
                | Command::GetErrorStatus
        )
    }

    /// Command name for error messages and logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetHardwareVersion => "get_hardware_version",
            Command::GetFirmwareVersion => "get_firmware_version",
            Command::GetSerialNumber => "get_serial_number",
            Command::GetFrontendHardwareVersion => "get_frontend_hardware_version",
            Command::GetFrontendFirmwareVersion => "get_frontend_firmware_version",
            Command::GetFrontendSerialNumber => "get_frontend_serial_number",
            Command::GetVoltage => "get_voltage",
            Command::SetVoltage(_) => "set_voltage",
            Command::GetGain => "get_gain",
            Command::SetGain(_) => "set_gain",
            Command::GetOffset => "get_offset",
            Command::SetOffset(_) => "set_offset",
            Command::GetFrontendOffset => "get_frontend_offset",
            Command::SetFrontendOffset(_) => "set_frontend_offset",
            Command::GetMppcTemp => "get_mppc_temp",
            Command::SetTargetMppcTemp(_) => "set_target_mppc_temp",
            Command::GetColdPlateTemp => "get_cold_plate_temp",
            Command::GetHotPlateTemp => "get_hot_plate_temp",
            Command::GetSingleEndedOutput => "get_single_ended_output",
            Command::GetDifferentialPlus => "get_differential_plus",
            Command::GetDifferentialMinus => "get_differential_minus",
            Command::GetFrontendOutputVoltage => "get_frontend_output_voltage",
            Command::GetVacuumPressure => "get_vacuum_pressure",
            Command::GetChannel => "get_channel",
            Command::SetChannel(_) => "set_channel",
            Command::SetDifferentialOutput(_) => "set_differential_output",
            Command::SetSingleEndedOutput(_) => "set_single_ended_output",
            Command::GetTecCurrent => "get_tec_current",
            Command::GetErrorStatus => "get_error_status",
            Command::EnterComputerIsp => "enter_computer_isp",
            Command::EnterFrontendIsp => "enter_frontend_isp",
            Command::EnterPassthrough => "enter_passthrough",
        }
    }
}

/// Encode a command into a complete wire frame
pub fn encode_command(command: &Command) -> Vec<u8> {
    let arg = command.arg().to_bytes();
    let mut frame = Vec::with_capacity(5 + arg.len());
    frame.push(SOH);
    frame.push(ID_CMD);
    frame.push(arg.len() as u8);
    frame.push(command.opcode());
    frame.extend_from_slice(&arg);
    frame.push(EOT);
    frame
}

fn malformed(command: &Command, reason: impl Into<String>) -> mppckit_core::Error {
    ProtocolError::MalformedResponse {
        command: command.name().to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Decode a status frame (`SOH 'S' code US code EOT`)
///
/// ACK decodes to Ok; NAK means the firmware does not know the opcode.
pub fn decode_status(frame: &[u8], command: &Command) -> Result<()> {
    if frame.len() != 6 {
        return Err(malformed(
            command,
            format!("status frame of {} bytes, expected 6", frame.len()),
        ));
    }
    if frame[0] != SOH || frame[1] != ID_STATUS || frame[3] != US || frame[5] != EOT {
        return Err(malformed(command, "status frame delimiters missing"));
    }
    match frame[2] {
        ACK => Ok(()),
        NAK => Err(ProtocolError::UnknownCommand {
            command: command.name().to_string(),
        }
        .into()),
        code => Err(malformed(command, format!("status code 0x{:02x}", code))),
    }
}

/// Decode a payload frame, returning the raw payload bytes
///
/// Binary frames are `SOH 'B' LEN US payload EOT`; ASCII frames are
/// `SOH 'M' US text ETX EOT`.
pub fn decode_payload(frame: &[u8], command: &Command) -> Result<Vec<u8>> {
    if frame.len() < 4 || frame[0] != SOH || frame[frame.len() - 1] != EOT {
        return Err(malformed(command, "payload frame delimiters missing"));
    }
    match frame[1] {
        ID_BIN => {
            let len = frame[2] as usize;
            if frame.len() != len + 5 || frame[3] != US {
                return Err(malformed(
                    command,
                    format!("binary payload length {} does not match frame", len),
                ));
            }
            Ok(frame[4..4 + len].to_vec())
        }
        ID_ASCII => {
            if frame.len() < 5 {
                return Err(malformed(command, "ASCII payload too short"));
            }
            Ok(frame[3..frame.len() - 2].to_vec())
        }
        other => Err(malformed(
            command,
            format!("unknown payload type 0x{:02x}", other),
        )),
    }
}

/// Interpret a payload as a signed 32-bit little-endian value
pub fn payload_i32(payload: &[u8], command: &Command) -> Result<i32> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| malformed(command, format!("expected 4 bytes, got {}", payload.len())))?;
    Ok(i32::from_le_bytes(bytes))
}

/// Interpret a payload as an unsigned 32-bit little-endian value
pub fn payload_u32(payload: &[u8], command: &Command) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| malformed(command, format!("expected 4 bytes, got {}", payload.len())))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Interpret a payload as a single byte
pub fn payload_u8(payload: &[u8], command: &Command) -> Result<u8> {
    match payload {
        [b] => Ok(*b),
        _ => Err(malformed(
            command,
            format!("expected 1 byte, got {}", payload.len()),
        )),
    }
}

/// Interpret a payload as a latin-1 string.
///
/// Version and serial fields are fixed 40-byte records; only trailing
/// NUL and space filler is dropped, every other byte is payload.
pub fn payload_string(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end_matches(['\0', ' '])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_no_arg() {
        let frame = encode_command(&Command::GetVoltage);
        assert_eq!(frame, vec![SOH, ID_CMD, 0, 0xca, EOT]);
    }

    #[test]
    fn test_encode_i32_arg() {
        // -62.5 V commanded as -62_500_000 uV
        let frame = encode_command(&Command::SetVoltage(-62_500_000));
        assert_eq!(frame[0], SOH);
        assert_eq!(frame[1], ID_CMD);
        assert_eq!(frame[2], 4);
        assert_eq!(frame[3], 0xc9);
        assert_eq!(&frame[4..8], &(-62_500_000i32).to_le_bytes());
        assert_eq!(frame[8], EOT);
    }

    #[test]
    fn test_encode_isp_magic() {
        let frame = encode_command(&Command::EnterComputerIsp);
        assert_eq!(frame, vec![SOH, ID_CMD, 1, 0xfe, ISP_MAGIC, EOT]);

        let frame = encode_command(&Command::EnterPassthrough);
        assert_eq!(frame, vec![SOH, ID_CMD, 1, 0x65, PASSTHROUGH_MAGIC, EOT]);
    }

    #[test]
    fn test_decode_status_ack() {
        let frame = [SOH, ID_STATUS, ACK, US, ACK, EOT];
        assert!(decode_status(&frame, &Command::GetVoltage).is_ok());
    }

    #[test]
    fn test_decode_status_nak_is_unknown_command() {
        let frame = [SOH, ID_STATUS, NAK, US, NAK, EOT];
        let err = decode_status(&frame, &Command::GetVoltage).unwrap_err();
        assert!(matches!(
            err,
            mppckit_core::Error::Protocol(ProtocolError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_decode_status_garbled() {
        let frame = [SOH, ID_STATUS, 0x7f, US, 0x7f, EOT];
        let err = decode_status(&frame, &Command::GetVoltage).unwrap_err();
        assert!(err.is_protocol_error());

        let short = [SOH, ID_STATUS, ACK, EOT];
        assert!(decode_status(&short, &Command::GetVoltage).is_err());
    }

    #[test]
    fn test_decode_binary_payload() {
        let value = (-12_000_000i32).to_le_bytes();
        let mut frame = vec![SOH, ID_BIN, 4, US];
        frame.extend_from_slice(&value);
        frame.push(EOT);

        let payload = decode_payload(&frame, &Command::GetVoltage).unwrap();
        assert_eq!(payload_i32(&payload, &Command::GetVoltage).unwrap(), -12_000_000);
    }

    #[test]
    fn test_decode_binary_payload_length_mismatch() {
        let frame = vec![SOH, ID_BIN, 4, US, 0x01, 0x02, EOT];
        assert!(decode_payload(&frame, &Command::GetVoltage).is_err());
    }

    #[test]
    fn test_decode_ascii_payload() {
        let mut frame = vec![SOH, ID_ASCII, US];
        frame.extend_from_slice(b"MPPC-2.7");
        frame.push(0x03);
        frame.push(EOT);

        let payload = decode_payload(&frame, &Command::GetFirmwareVersion).unwrap();
        assert_eq!(payload_string(&payload), "MPPC-2.7");
    }

    #[test]
    fn test_payload_string_strips_only_filler() {
        assert_eq!(payload_string(b"MPPC_HW_1.0\0\0\0  "), "MPPC_HW_1.0");
        assert_eq!(payload_string(b"plain"), "plain");
        // A terminal letter is payload, not padding.
        assert_eq!(payload_string(b"rev-2x"), "rev-2x");
    }

    #[test]
    fn test_short_numeric_payload_is_malformed() {
        assert!(payload_i32(&[0x01, 0x02], &Command::GetGain).is_err());
        assert!(payload_u8(&[0x01, 0x02], &Command::GetErrorStatus).is_err());
    }
}
