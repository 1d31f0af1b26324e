//! Board programming state detection.

use mppckit_core::BoardState;
use mppckit_device::DeviceHandle;

fn classify(version: &str) -> BoardState {
    if version.to_lowercase().contains("unknown") {
        BoardState::Blank
    } else {
        BoardState::Programmed
    }
}

/// Determine the programming state of both boards.
///
/// A computer board that does not answer the firmware query is blank: a
/// factory-fresh board sits in its boot ROM and speaks no command
/// protocol at all, which is also why `None` maps to a blank computer
/// board. The front-end state can only be read through a programmed
/// computer board, so it stays `Unknown` otherwise.
pub fn probe_board_states(handle: Option<&mut DeviceHandle>) -> (BoardState, BoardState) {
    let Some(handle) = handle else {
        return (BoardState::Blank, BoardState::Unknown);
    };

    let computer = match handle.get_firmware_version() {
        Ok(version) => classify(&version),
        Err(e) => {
            tracing::debug!("Computer board firmware query failed: {}", e);
            BoardState::Blank
        }
    };

    let frontend = if computer == BoardState::Programmed {
        match handle.get_frontend_firmware_version() {
            Ok(version) => classify(&version),
            Err(e) => {
                tracing::debug!("Front-end firmware query failed: {}", e);
                BoardState::Unknown
            }
        }
    } else {
        BoardState::Unknown
    };

    tracing::info!(
        "Board states: computer {:?}, front-end {:?}",
        computer,
        frontend
    );
    (computer, frontend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mppckit_device::{SimFault, SimulatedDevice};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn test_both_boards_programmed() {
        let sim = SimulatedDevice::new();
        let mut handle = DeviceHandle::attach(Box::new(sim), TIMEOUT).unwrap();
        assert_eq!(
            probe_board_states(Some(&mut handle)),
            (BoardState::Programmed, BoardState::Programmed)
        );
    }

    #[test]
    fn test_blank_frontend_reports_unknown_version() {
        let mut sim = SimulatedDevice::new();
        sim.frontend_blank = true;
        let mut handle = DeviceHandle::attach(Box::new(sim), TIMEOUT).unwrap();
        assert_eq!(
            probe_board_states(Some(&mut handle)),
            (BoardState::Programmed, BoardState::Blank)
        );
    }

    #[test]
    fn test_no_device_means_blank_computer_board() {
        assert_eq!(
            probe_board_states(None),
            (BoardState::Blank, BoardState::Unknown)
        );
    }

    /// Answers the identity probe, then goes dead as a board stuck in its
    /// boot ROM would.
    struct DiesAfterAttach {
        inner: SimulatedDevice,
        answered: bool,
    }

    impl mppckit_device::Transport for DiesAfterAttach {
        fn send(&mut self, data: &[u8]) -> mppckit_core::Result<()> {
            if self.answered {
                self.inner.fault = SimFault::Silent;
            }
            self.answered = true;
            self.inner.send(data)
        }

        fn read_byte(&mut self) -> mppckit_core::Result<Option<u8>> {
            self.inner.read_byte()
        }

        fn name(&self) -> &str {
            "simulator"
        }
    }

    #[test]
    fn test_unresponsive_device_means_blank_computer_board() {
        let transport = DiesAfterAttach {
            inner: SimulatedDevice::new(),
            answered: false,
        };
        let mut handle = DeviceHandle::attach(Box::new(transport), TIMEOUT).unwrap();
        assert_eq!(
            probe_board_states(Some(&mut handle)),
            (BoardState::Blank, BoardState::Unknown)
        );
    }
}
