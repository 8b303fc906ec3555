//! Error types for the wire format.
//!
//! A `ProtocolError` is always scoped to the frame being encoded or decoded.
//! Whether it also kills the connection is the engine's decision: header
//! corruption (bad magic, bad version) desynchronizes the stream and is
//! fatal there, while codec errors inside an already-delimited payload are
//! recoverable frame drops.

use thiserror::Error;

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes available than a read required.
    #[error("truncated input: needed {expected} bytes, {available} available")]
    Truncated {
        /// Bytes the read required.
        expected: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A value tag that is not part of the tag set.
    #[error("unknown value tag {0:#05x}")]
    UnknownTag(u32),

    /// A packet-kind tag that is not part of the kind set.
    ///
    /// Carries the claimed payload size so the stream can skip the frame
    /// body and stay aligned on the next header.
    #[error("unknown packet kind {kind:#05x} ({payload_size} payload bytes)")]
    UnknownKind {
        /// The unrecognized kind tag.
        kind: u32,
        /// Payload size claimed by the header.
        payload_size: u32,
    },

    /// A value whose kind cannot be represented on the wire.
    #[error("unsupported value kind: {0}")]
    UnsupportedType(&'static str),

    /// Header magic number mismatch. Fatal: the stream is desynchronized.
    #[error("invalid frame magic {0:#06x}")]
    InvalidMagic(u16),

    /// Header carries a protocol version this implementation does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Payload size exceeds the per-frame bound.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed payload size.
        size: usize,
        /// Maximum permitted size.
        max: usize,
    },

    /// A hexadecimal float body that does not parse.
    #[error("malformed hexadecimal float: {0}")]
    FloatSyntax(String),

    /// A JSON map body failed to encode or decode.
    #[error("map body error: {0}")]
    MapBody(String),

    /// A string body that is not valid UTF-8.
    #[error("invalid UTF-8 in string body: {0}")]
    Utf8(String),

    /// A payload decoded to values of the wrong shape for its packet kind.
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

impl ProtocolError {
    /// Whether the enclosing connection can survive this error.
    ///
    /// Recoverable errors are confined to one delimited frame; the stream
    /// remains aligned on the next header. Unrecoverable errors mean the
    /// byte stream itself can no longer be trusted.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidMagic(_) | Self::UnsupportedVersion(_) | Self::PayloadTooLarge { .. }
        )
    }
}
