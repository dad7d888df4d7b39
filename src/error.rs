use std::io;
use thiserror::Error;

/// Error type shared by every fallible operation in the crate.
///
/// Success is plain `Result::Ok`; the variants below carry the failure
/// kinds the bridge dialect distinguishes. Messages received from the
/// bridge or the drive are passed through unchanged.
#[derive(Debug, Error, PartialEq, Clone)]
pub enum Error {
    /// The bridge could not be opened, configured or understood. Also
    /// covers handshake/protocol mismatches and framing violations.
    #[error("connection failure: {message}")]
    Connection { message: String },

    /// The bridge is reachable but the IEC device reported an error,
    /// either as a non-empty `s` frame or as a non-zero drive status.
    #[error("IEC connection failure: {message}")]
    Iec { message: String },

    /// Caller-supplied parameters out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A channel delivered EOI with no further data.
    #[error("end of file")]
    EndOfFile,

    /// A status line from the drive did not match `NN, MESSAGE,TRK,SEC`.
    #[error("parse error: {message}")]
    Parse { message: String },
}

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }

    pub fn iec(message: impl Into<String>) -> Self {
        Error::Iec {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Wrap an I/O error with the operation that produced it, in the
    /// style of errno-prefixed messages ("open(/dev/ttyUSB0): ...").
    pub fn from_io(context: &str, err: io::Error) -> Self {
        Error::Connection {
            message: format!("{context}: {err}"),
        }
    }
}
