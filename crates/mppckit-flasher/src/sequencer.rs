//! Firmware upload sequencer.
//!
//! Drives one upload job per board through a fixed stage machine:
//!
//! ```text
//! Idle -> DetectState -> {NeedIsp, ReadyToFlash} -> Flashing -> {Success, Failed}
//! ```
//!
//! Mode selection depends on the detected board states. A blank computer
//! board already sits in its boot ROM, so it is flashed directly; a
//! programmed one is first rebooted into ISP mode. The front-end board is
//! only reachable through computer-board firmware: a blank front-end is
//! flashed through pass-through mode, a programmed one through the
//! front-end ISP command.
//!
//! Flashing the computer board ends the running session: the board
//! reboots out of the firmware the handle was talking to. Between the
//! computer and front-end legs of a two-board job the sequencer opens a
//! fresh session and detects the front-end state again through the new
//! firmware.
//!
//! The external flashing step is flaky at the hardware layer and is
//! retried with a backoff. ISP-mode transitions are idempotent commands
//! with immediately confirmable effect and are never retried.

use crc::crc32;
use mppckit_core::event_bus::event_bus;
use mppckit_core::{BoardId, BoardState, DeviceEvent, Result, UploadError, UploadEvent, UploadJob};
use mppckit_device::DeviceHandle;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::probe_board_states;
use crate::writer::ImageWriter;

/// Stage of one upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Idle,
    DetectState,
    NeedIsp,
    ReadyToFlash,
    Flashing,
    Success,
    Failed,
}

impl std::fmt::Display for UploadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadStage::Idle => "Idle",
            UploadStage::DetectState => "DetectState",
            UploadStage::NeedIsp => "NeedIsp",
            UploadStage::ReadyToFlash => "ReadyToFlash",
            UploadStage::Flashing => "Flashing",
            UploadStage::Success => "Success",
            UploadStage::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Which images to flash in one request.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Computer board image, if that board is to be flashed.
    pub computer_image: Option<PathBuf>,
    /// Expected CRC-32 of the computer board image.
    pub computer_checksum: Option<u32>,
    /// Front-end board image, if that board is to be flashed.
    pub frontend_image: Option<PathBuf>,
    /// Expected CRC-32 of the front-end image.
    pub frontend_checksum: Option<u32>,
}

/// Retry policy for the external flashing step.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Invocations of the writer before a job fails.
    pub attempts: u32,
    /// Pause between failed attempts.
    pub backoff: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(2000),
        }
    }
}

/// Opens a fresh device session on a port, used between the computer and
/// front-end legs of a two-board job.
pub type Reconnect<'a> = &'a mut dyn FnMut(&str) -> Result<DeviceHandle>;

/// Sequences upload jobs through the stage machine.
pub struct UploadSequencer<W: ImageWriter> {
    writer: W,
    config: SequencerConfig,
}

impl<W: ImageWriter> UploadSequencer<W> {
    pub fn new(writer: W, config: SequencerConfig) -> Self {
        Self { writer, config }
    }

    /// Detect board states, then run the request.
    ///
    /// `handle` is `None` when no detector answered on the port, which is
    /// the normal situation for a factory-fresh computer board.
    pub fn run(
        &mut self,
        mut handle: Option<DeviceHandle>,
        port: &str,
        request: &UploadRequest,
        reconnect: Reconnect<'_>,
    ) -> Result<()> {
        let states = probe_board_states(handle.as_mut());
        self.run_detected(handle, states, port, request, reconnect)
    }

    /// Run the request against already-detected board states.
    ///
    /// A front-end job whose prerequisite fails returns before anything
    /// is sent to the device.
    pub fn run_detected(
        &mut self,
        mut handle: Option<DeviceHandle>,
        states: (BoardState, BoardState),
        port: &str,
        request: &UploadRequest,
        reconnect: Reconnect<'_>,
    ) -> Result<()> {
        let (computer_state, mut frontend_state) = states;

        // The front-end is unreachable without computer-board firmware.
        // Unless this request flashes the computer board first, fail
        // before any device interaction.
        if request.frontend_image.is_some()
            && request.computer_image.is_none()
            && computer_state != BoardState::Programmed
        {
            let err = UploadError::PrerequisiteNotMet {
                board: BoardId::FrontEnd,
                reason: "computer board carries no firmware".to_string(),
            };
            publish(UploadEvent::Failed {
                board: BoardId::FrontEnd,
                stage: UploadStage::DetectState.to_string(),
                error: err.to_string(),
            });
            return Err(err.into());
        }

        if request.frontend_image.is_some()
            && request.computer_image.is_none()
            && frontend_state == BoardState::Unknown
        {
            let err = UploadError::PrerequisiteNotMet {
                board: BoardId::FrontEnd,
                reason: "front-end state could not be determined".to_string(),
            };
            publish(UploadEvent::Failed {
                board: BoardId::FrontEnd,
                stage: UploadStage::DetectState.to_string(),
                error: err.to_string(),
            });
            return Err(err.into());
        }

        // The computer board is always sequenced to a terminal state
        // before any front-end flash attempt begins.
        if let Some(image) = &request.computer_image {
            let job = UploadJob {
                board: BoardId::Computer,
                image: image.clone(),
                expected_checksum: request.computer_checksum,
            };
            self.flash_computer(handle.as_mut(), computer_state, port, &job)?;

            if request.frontend_image.is_some() {
                // The flash rebooted the board out of the old session;
                // the front-end leg needs a fresh one, and the front-end
                // state is only knowable through the new firmware.
                drop(handle.take());
                match reconnect(port) {
                    Ok(mut fresh) => {
                        frontend_state = probe_board_states(Some(&mut fresh)).1;
                        handle = Some(fresh);
                    }
                    Err(e) => {
                        return self.fail(
                            BoardId::FrontEnd,
                            UploadStage::DetectState,
                            &format!("no session after computer flash: {}", e),
                        );
                    }
                }
            }
        }

        if let Some(image) = &request.frontend_image {
            let job = UploadJob {
                board: BoardId::FrontEnd,
                image: image.clone(),
                expected_checksum: request.frontend_checksum,
            };
            self.flash_frontend(handle.as_mut(), frontend_state, port, &job)?;
        }

        Ok(())
    }

    fn flash_computer(
        &mut self,
        handle: Option<&mut DeviceHandle>,
        state: BoardState,
        port: &str,
        job: &UploadJob,
    ) -> Result<()> {
        let board = job.board;
        publish(UploadEvent::Started { board });
        advance(board, UploadStage::DetectState);

        match state {
            // A blank board already sits in its boot ROM.
            BoardState::Blank => {}
            BoardState::Programmed | BoardState::Unknown => {
                advance(board, UploadStage::NeedIsp);
                let Some(handle) = handle else {
                    return self.fail(board, UploadStage::NeedIsp, "no device session");
                };
                // Not retried: an ISP reboot either takes effect or the
                // whole session is gone.
                if let Err(e) = handle.enter_computer_isp() {
                    return self.fail(board, UploadStage::NeedIsp, &e.to_string());
                }
            }
        }

        self.flash(job, port)
    }

    fn flash_frontend(
        &mut self,
        handle: Option<&mut DeviceHandle>,
        state: BoardState,
        port: &str,
        job: &UploadJob,
    ) -> Result<()> {
        let board = job.board;
        publish(UploadEvent::Started { board });
        advance(board, UploadStage::DetectState);
        advance(board, UploadStage::NeedIsp);

        let Some(handle) = handle else {
            return self.fail(board, UploadStage::NeedIsp, "no device session");
        };

        let mode = match state {
            // A blank front-end is reached through its boot ROM, with the
            // computer board passing the traffic through.
            BoardState::Blank => handle.enter_passthrough(),
            BoardState::Programmed | BoardState::Unknown => handle.enter_frontend_isp(),
        };
        if let Err(e) = mode {
            return self.fail(board, UploadStage::NeedIsp, &e.to_string());
        }

        self.flash(job, port)
    }

    /// Verify the image, then invoke the writer with the retry policy.
    fn flash(&mut self, job: &UploadJob, port: &str) -> Result<()> {
        let board = job.board;
        advance(board, UploadStage::ReadyToFlash);

        if let Some(expected) = job.expected_checksum {
            let actual = match image_checksum(&job.image) {
                Ok(actual) => actual,
                Err(e) => {
                    return self.fail(
                        board,
                        UploadStage::ReadyToFlash,
                        &format!("image unreadable: {}", e),
                    );
                }
            };
            if actual != expected {
                advance(board, UploadStage::Failed);
                let err = UploadError::ChecksumMismatch {
                    board,
                    expected,
                    actual,
                };
                publish(UploadEvent::Failed {
                    board,
                    stage: UploadStage::ReadyToFlash.to_string(),
                    error: err.to_string(),
                });
                return Err(err.into());
            }
        }

        advance(board, UploadStage::Flashing);

        for attempt in 1..=self.config.attempts {
            match self.writer.write_image(board, &job.image, port) {
                Ok(()) => {
                    advance(board, UploadStage::Success);
                    publish(UploadEvent::Completed { board });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Flash attempt {}/{} for {} failed: {}",
                        attempt,
                        self.config.attempts,
                        board,
                        e
                    );
                    publish(UploadEvent::AttemptFailed {
                        board,
                        attempt,
                        error: e.to_string(),
                    });
                    if attempt < self.config.attempts {
                        std::thread::sleep(self.config.backoff);
                    }
                }
            }
        }

        advance(board, UploadStage::Failed);
        let err = UploadError::FlashFailed {
            board,
            stage: UploadStage::Flashing.to_string(),
            attempts: self.config.attempts,
        };
        publish(UploadEvent::Failed {
            board,
            stage: UploadStage::Flashing.to_string(),
            error: err.to_string(),
        });
        Err(err.into())
    }

    fn fail(&self, board: BoardId, stage: UploadStage, reason: &str) -> Result<()> {
        advance(board, UploadStage::Failed);
        let err = UploadError::FlashFailed {
            board,
            stage: stage.to_string(),
            attempts: 0,
        };
        publish(UploadEvent::Failed {
            board,
            stage: stage.to_string(),
            error: reason.to_string(),
        });
        Err(err.into())
    }
}

fn image_checksum(path: &Path) -> std::io::Result<u32> {
    let bytes = std::fs::read(path)?;
    Ok(crc32::checksum_ieee(&bytes))
}

fn advance(board: BoardId, stage: UploadStage) {
    tracing::info!("Upload {}: {}", board, stage);
    publish(UploadEvent::StageChanged {
        board,
        stage: stage.to_string(),
    });
}

fn publish(event: UploadEvent) {
    event_bus().publish(DeviceEvent::Upload(event));
}
