//! Image writer collaborator.
//!
//! The actual flashing is done by the vendor ISP tool, an external
//! process that speaks the boot ROM protocol directly on the serial port.
//! The sequencer treats it as opaque: invoke, wait, check the exit status.

use mppckit_core::{BoardId, Error, Result};
use std::path::Path;
use std::process::Command;

/// Writes one firmware image to one board.
pub trait ImageWriter {
    /// Flash `image` onto `board` through `port`.
    ///
    /// The board must already be in the right ISP or pass-through state;
    /// the writer does not check or change modes.
    fn write_image(&mut self, board: BoardId, image: &Path, port: &str) -> Result<()>;
}

/// Runs the configured external flashing tool.
pub struct IspToolWriter {
    command: String,
}

impl IspToolWriter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl ImageWriter for IspToolWriter {
    fn write_image(&mut self, board: BoardId, image: &Path, port: &str) -> Result<()> {
        let board_flag = match board {
            BoardId::Computer => "cb",
            BoardId::FrontEnd => "fe",
        };
        tracing::info!(
            "Running {} --port {} --board {} {}",
            self.command,
            port,
            board_flag,
            image.display()
        );

        let status = Command::new(&self.command)
            .arg("--port")
            .arg(port)
            .arg("--board")
            .arg(board_flag)
            .arg(image)
            .status()?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::other(format!(
                "{} exited with {} for {}",
                self.command, status, board
            )))
        }
    }
}
