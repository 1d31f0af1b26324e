//! Frame assembly on top of the byte-level transport.
//!
//! Status and ASCII frames are terminated by EOT and read by scanning
//! for it. Binary payload frames carry a length byte whose value (and
//! whose payload bytes) can collide with EOT, so they are read
//! length-delimited: SOH, type, LEN, then exactly LEN + 2 more bytes
//! (US, payload, EOT). The layer tolerates stale EOTs left over from an
//! interrupted prior session.

use mppckit_core::{Result, TransportError};
use std::time::{Duration, Instant};

use super::Transport;
use crate::protocol::{EOT, ID_BIN, SOH};

/// Read one complete response frame within the deadline.
///
/// A leading EOT (the tail of a frame cut short when the previous process
/// died) is discarded rather than parsed as an empty frame.
pub fn read_frame(transport: &mut dyn Transport, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut buf: Vec<u8> = Vec::with_capacity(48);

    loop {
        let byte = next_byte(transport, deadline, timeout, buf.len())?;
        if buf.is_empty() && byte == EOT {
            tracing::debug!("Discarding stale EOT on {}", transport.name());
            continue;
        }
        buf.push(byte);
        break;
    }

    let kind = next_byte(transport, deadline, timeout, buf.len())?;
    buf.push(kind);

    if buf[0] == SOH && kind == ID_BIN {
        // LEN US payload[LEN] EOT. A 4-byte payload has LEN equal to
        // EOT, and payload bytes can take any value, so the terminator
        // cannot be scanned for.
        let len = next_byte(transport, deadline, timeout, buf.len())?;
        buf.push(len);
        for _ in 0..len as usize + 2 {
            let byte = next_byte(transport, deadline, timeout, buf.len())?;
            buf.push(byte);
        }
        return Ok(buf);
    }

    loop {
        let byte = next_byte(transport, deadline, timeout, buf.len())?;
        buf.push(byte);
        if byte == EOT {
            return Ok(buf);
        }
    }
}

/// Wait for the next byte, enforcing the deadline on every pass so even a
/// device that streams bytes without ever finishing a frame times out.
fn next_byte(
    transport: &mut dyn Transport,
    deadline: Instant,
    timeout: Duration,
    received: usize,
) -> Result<u8> {
    loop {
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                received,
            }
            .into());
        }
        if let Some(byte) = transport.read_byte()? {
            return Ok(byte);
        }
    }
}
