//! Wirecall wire format.
//!
//! Everything that touches bytes on the wire lives here: the type-tagged
//! value codec, the cursor byte stream, the 19-byte frame header, the three
//! packet payloads and the incremental packet builder that reassembles
//! frames from arbitrarily chunked network reads.
//!
//! The layer is deliberately I/O-free. Sockets, correlation state and the
//! call dispatcher live in `wirecall-core`; this crate only converts between
//! typed packets and byte sequences, so every rule of the wire format can be
//! tested without a connection.
//!
//! # Wire layout
//!
//! ```text
//! Frame  := Header(19 B) Payload(payload_size B)
//! Header := magic:u16 version:u8 flags:u8
//!           function_id:i32 global_id:i32 kind:u24 payload_size:u32
//! ```
//!
//! All multi-byte integers are big-endian. After a `FileMeta` frame, exactly
//! `size` raw file bytes follow before the next frame; those bytes never
//! pass through the codec.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod builder;
mod errors;
mod header;
mod packet;
mod stream;
pub mod value;

pub use builder::PacketBuilder;
pub use errors::{ProtocolError, Result};
pub use header::{CorrelationIds, PacketHeader, PacketKind};
pub use packet::{DataReturn, FileMeta, FunctionCall, Packet, PacketBody};
pub use stream::ByteStream;
pub use value::Value;

/// Number of bytes in a type tag or packet-kind tag.
pub const TAG_LEN: usize = 3;

/// Number of bytes in a wire integer or length prefix.
pub const INT_LEN: usize = 4;
