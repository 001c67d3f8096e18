//! Error types for the urpc transport.

use std::fmt;
use std::io;

/// Error type for transport operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the shared-memory or process layer.
    Io(io::Error),
    /// Command code outside `1..=URPC_MAX_HANDLERS`.
    InvalidCommand(u8),
    /// A handler is already registered for this command code.
    HandlerExists(u8),
    /// The payload ring could not satisfy an allocation before the deadline.
    PayloadExhausted { requested: u32 },
    /// The target mailbox slot stayed busy past the put deadline.
    QueueFull,
    /// Unknown character in a pack/unpack format string.
    BadFormat(char),
    /// Argument does not match the format character at this position.
    ArgMismatch(char),
    /// The record ended before the format string was consumed.
    ShortPayload,
    /// The remote peer did not attach within the deadline.
    AttachTimeout,
    /// The per-process peer limit was reached.
    TooManyPeers,
    /// A required bootstrap environment variable is missing or malformed.
    BadBootstrap(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidCommand(cmd) => write!(f, "Invalid command code {}", cmd),
            Error::HandlerExists(cmd) => {
                write!(f, "Handler already registered for command {}", cmd)
            }
            Error::PayloadExhausted { requested } => {
                write!(f, "Payload ring exhausted ({} bytes requested)", requested)
            }
            Error::QueueFull => write!(f, "Transfer queue is full"),
            Error::BadFormat(c) => write!(f, "Unknown format character {:?}", c),
            Error::ArgMismatch(c) => {
                write!(f, "Argument does not match format character {:?}", c)
            }
            Error::ShortPayload => write!(f, "Payload shorter than its format string"),
            Error::AttachTimeout => write!(f, "Remote peer did not attach in time"),
            Error::TooManyPeers => write!(f, "Per-process peer limit reached"),
            Error::BadBootstrap(var) => {
                write!(f, "Missing or malformed bootstrap variable {}", var)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
