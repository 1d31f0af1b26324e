//! Firmware upload sequencing for MPPCKit.
//!
//! Splits the job in three: [`detect`] reads the programming state of
//! both boards, [`sequencer`] decides the order and mode transitions, and
//! [`writer`] invokes the vendor flashing tool. The sequencer runs while
//! the control loop is stopped; the two never share the serial port.

pub mod detect;
pub mod sequencer;
pub mod writer;

pub use detect::probe_board_states;
pub use sequencer::{Reconnect, SequencerConfig, UploadRequest, UploadSequencer, UploadStage};
pub use writer::{ImageWriter, IspToolWriter};
