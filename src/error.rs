//! Transport error types

use thiserror::Error;

/// Errors that can occur during raw transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// Bad report length, bad buffer, or the device handle is closed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Report type not handled by this transport
    #[error("Report type not supported")]
    NotSupported,

    /// No device activity within the wait budget
    #[error("Read timed out")]
    Timeout,

    /// A blocked wait was woken through the signal channel instead of by
    /// device data. Absorbed by the background reader; callers of the
    /// synchronous read path may observe it when sharing the device with a
    /// transacting thread.
    #[error("Read interrupted")]
    Interrupted,

    /// The background reader may be started at most once per transport
    #[error("Event reader already started")]
    AlreadyStarted,

    /// The device accepted fewer bytes than requested
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Underlying read/write/ioctl failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
