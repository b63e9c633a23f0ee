//! Error taxonomy shared by every Display Handler crate.

use std::fmt;

/// Why a received packet was rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// One or both header magic constants did not match.
    BadMagic,
    /// The footer's CRC did not match `checksum(header || payload)`.
    BadChecksum,
    /// The header's `type` field is not a recognized packet type.
    UnknownType(u32),
    /// The header's `length` would make the total packet exceed 4096 bytes.
    Oversize {
        /// The offending payload length, in bytes.
        length: u32,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "packet header magic mismatch"),
            Self::BadChecksum => write!(f, "packet footer CRC mismatch"),
            Self::UnknownType(t) => write!(f, "unknown packet type {t}"),
            Self::Oversize { length } => {
                write!(f, "payload length {length} exceeds maximum packet size")
            }
        }
    }
}

/// Every way a Display Handler operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument violates the operation's contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation failed (buffer, section, or channel handle).
    #[error("out of memory")]
    OutOfMemory,

    /// The channel's send-side buffer does not have enough free space
    /// for this write right now. Transient; the caller may retry.
    #[error("no space available to send")]
    NoSpace,

    /// Not enough bytes are buffered on the receive side yet. Transient;
    /// wait for the next readable-data callback.
    #[error("insufficient data buffered, try again")]
    TryAgain,

    /// The channel is not open, or the remote end disconnected.
    #[error("channel closed")]
    Closed,

    /// No listening server exists for the requested (domain, port) tuple.
    #[error("no matching listening server")]
    NotFound,

    /// The wire data is malformed in a way that is fatal to the endpoint.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The underlying IVC transport refused an operation unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Convenience alias used throughout the Display Handler crates.
pub type Result<T> = std::result::Result<T, Error>;
