//! Fixed 19-byte frame header.
//!
//! The header is raw binary (big-endian) so the reader can make framing
//! decisions without touching the codec. Layout:
//!
//! ```text
//! offset  size  field
//! 0       2     magic        0x5743 ("WC")
//! 2       1     version      0x01
//! 3       1     flags        reserved, zero
//! 4       4     function_id  i32, correlation
//! 8       4     global_id    i32, per-connection sequence
//! 12      3     kind         u24 packet-kind tag
//! 15      4     payload_size u32
//! ```

use crate::{
    errors::{ProtocolError, Result},
    stream::ByteStream,
};

/// The `(function_id, global_id)` pair tagging every frame.
///
/// `global_id` is a single per-connection sequence advanced by every frame
/// in either direction; `function_id` pairs a request with its response via
/// the per-connection call stack. `-1` marks a packet whose ids have not
/// been assigned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationIds {
    /// Ties a request to its response.
    pub function_id: i32,
    /// Position in the per-connection frame sequence.
    pub global_id: i32,
}

impl CorrelationIds {
    /// Ids of a packet that has not been assigned yet.
    pub const UNSET: Self = Self { function_id: -1, global_id: -1 };

    /// Create an id pair.
    #[must_use]
    pub fn new(function_id: i32, global_id: i32) -> Self {
        Self { function_id, global_id }
    }
}

/// Packet kind carried in the header's 3-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Remote invocation request.
    FunctionCall,
    /// Return values for the innermost outstanding call.
    DataReturn,
    /// File metadata; `size` raw body bytes follow the frame.
    FileMeta,
}

impl PacketKind {
    /// Wire tag for this kind.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::FunctionCall => 0x101,
            Self::DataReturn => 0x103,
            Self::FileMeta => 0x104,
        }
    }

    /// Kind for a wire tag. `None` if unrecognized.
    #[must_use]
    pub fn from_u32(tag: u32) -> Option<Self> {
        match tag {
            0x101 => Some(Self::FunctionCall),
            0x103 => Some(Self::DataReturn),
            0x104 => Some(Self::FileMeta),
            _ => None,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Correlation ids of the frame.
    pub ids: CorrelationIds,
    /// Packet kind.
    pub kind: PacketKind,
    /// Payload length in bytes (excludes any trailing file body).
    pub payload_size: u32,
}

impl PacketHeader {
    /// Serialized header size.
    pub const SIZE: usize = 19;

    /// Magic number, "WC" in ASCII.
    pub const MAGIC: u16 = 0x5743;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (16 MiB).
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Create a header for a payload of `payload_size` bytes.
    #[must_use]
    pub fn new(ids: CorrelationIds, kind: PacketKind, payload_size: u32) -> Self {
        Self { ids, kind, payload_size }
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&Self::MAGIC.to_be_bytes());
        out[2] = Self::VERSION;
        out[3] = 0; // flags, reserved
        out[4..8].copy_from_slice(&self.ids.function_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.ids.global_id.to_be_bytes());
        let kind = self.kind.to_u32().to_be_bytes();
        out[12..15].copy_from_slice(&kind[1..4]);
        out[15..19].copy_from_slice(&self.payload_size.to_be_bytes());
        out
    }

    /// Parse a header from the stream, consuming exactly [`Self::SIZE`] bytes.
    ///
    /// Validation order is cheapest-first: availability, magic, version,
    /// kind, payload bound.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Truncated` if fewer than 19 bytes remain (cursor
    ///   unchanged, retry after appending).
    /// - `ProtocolError::InvalidMagic` / `ProtocolError::UnsupportedVersion`
    ///   on a corrupt or foreign stream; these are fatal to the connection.
    /// - `ProtocolError::UnknownKind` for an unrecognized kind tag; carries
    ///   the payload size so the caller can skip the frame body.
    /// - `ProtocolError::PayloadTooLarge` if the size field exceeds
    ///   [`Self::MAX_PAYLOAD_SIZE`].
    pub fn from_stream(stream: &mut ByteStream) -> Result<Self> {
        if stream.remaining() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::SIZE,
                available: stream.remaining(),
            });
        }

        let magic = stream.next_uint(2)? as u16;
        if magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = stream.next_uint(1)? as u8;
        if version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let _flags = stream.next_uint(1)?;
        let function_id = stream.next_int()?;
        let global_id = stream.next_int()?;
        let kind_tag = stream.next_uint(3)? as u32;
        let payload_size = stream.next_uint(4)? as u32;

        let Some(kind) = PacketKind::from_u32(kind_tag) else {
            return Err(ProtocolError::UnknownKind { kind: kind_tag, payload_size });
        };

        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(Self { ids: CorrelationIds::new(function_id, global_id), kind, payload_size })
    }
}
