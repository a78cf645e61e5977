use thiserror::Error;

/// Errors surfaced by the bus transport and reply validation.
///
/// Protocol-level failures are normally absorbed by the caller (counted and
/// logged, previous state retained); only I/O problems on the underlying
/// port propagate out of a polling sweep.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reply length mismatch - expected={expected} received={received}")]
    ReplyLength { expected: usize, received: usize },

    #[error("checksum mismatch - calculated={calculated:#04X} received={received:#04X}")]
    Checksum { calculated: u8, received: u8 },

    #[error("reply header does not echo the request")]
    EchoMismatch,

    #[cfg(feature = "serialport")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}
