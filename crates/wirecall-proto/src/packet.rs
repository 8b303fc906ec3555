//! Typed packets and their payload encodings.
//!
//! A [`Packet`] is one on-wire unit: correlation ids plus a typed body. The
//! body encodings reuse the value codec:
//!
//! ```text
//! FunctionCall := Value(str name)  Value(tuple positional)  Value(map named)
//! DataReturn   := Value(map fields)
//! FileMeta     := Value(str src)   Value(str|null dst)      Value(int size)
//! ```
//!
//! Ids start out as [`CorrelationIds::UNSET`] and are stamped by the
//! correlation manager at send time.

use std::collections::BTreeMap;

use crate::{
    errors::{ProtocolError, Result},
    header::{CorrelationIds, PacketHeader, PacketKind},
    value::{Value, pack_values, unpack_values},
};

/// A remote invocation request.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Handler name, resolved by exact match on the receiving side.
    pub name: String,
    /// Positional arguments (a tuple on the wire).
    pub positional: Vec<Value>,
    /// Named arguments (a map on the wire).
    pub named: BTreeMap<String, Value>,
}

/// Return values for the innermost outstanding call.
///
/// By convention a single field named `return` carries the result; an error
/// surrogate in that field re-raises on the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DataReturn {
    /// Named return fields.
    pub fields: BTreeMap<String, Value>,
}

impl DataReturn {
    /// Field name conventionally holding the call result.
    pub const RETURN_FIELD: &'static str = "return";

    /// Build a `DataReturn` with a single `return` field.
    #[must_use]
    pub fn with_return(value: Value) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(Self::RETURN_FIELD.to_string(), value);
        Self { fields }
    }

    /// Build a `DataReturn` with one arbitrary field.
    #[must_use]
    pub fn with_field(name: &str, value: Value) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(name.to_string(), value);
        Self { fields }
    }
}

/// File transfer announcement.
///
/// Exactly `size` raw file bytes follow this frame on the wire, with no
/// interleaved frames, before normal frame parsing resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Path of the file on the sending side.
    pub src_path: String,
    /// Requested destination path; the receiver picks a temporary path when
    /// absent.
    pub dst_path: Option<String>,
    /// Body length in bytes.
    pub size: i32,
}

/// Discriminated packet body.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    /// Remote invocation request.
    FunctionCall(FunctionCall),
    /// Call return values.
    DataReturn(DataReturn),
    /// File transfer announcement.
    FileMeta(FileMeta),
}

/// One on-wire unit: correlation ids plus a typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Correlation ids; [`CorrelationIds::UNSET`] until assigned at send.
    pub ids: CorrelationIds,
    /// Typed payload.
    pub body: PacketBody,
}

impl Packet {
    /// Wrap a body into an unassigned packet.
    #[must_use]
    pub fn new(body: PacketBody) -> Self {
        Self { ids: CorrelationIds::UNSET, body }
    }

    /// Build a `FunctionCall` packet.
    #[must_use]
    pub fn function_call(
        name: impl Into<String>,
        positional: Vec<Value>,
        named: BTreeMap<String, Value>,
    ) -> Self {
        Self::new(PacketBody::FunctionCall(FunctionCall {
            name: name.into(),
            positional,
            named,
        }))
    }

    /// Build a `DataReturn` packet.
    #[must_use]
    pub fn data_return(data: DataReturn) -> Self {
        Self::new(PacketBody::DataReturn(data))
    }

    /// Build a `FileMeta` packet.
    #[must_use]
    pub fn file_meta(meta: FileMeta) -> Self {
        Self::new(PacketBody::FileMeta(meta))
    }

    /// Packet kind of the body.
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        match &self.body {
            PacketBody::FunctionCall(_) => PacketKind::FunctionCall,
            PacketBody::DataReturn(_) => PacketKind::DataReturn,
            PacketBody::FileMeta(_) => PacketKind::FileMeta,
        }
    }

    /// Encode just the payload bytes (everything after the header).
    ///
    /// Exposed separately from [`Packet::pack`] so senders can validate the
    /// payload before committing correlation ids to it.
    ///
    /// # Errors
    ///
    /// - Codec errors from the payload values (see [`pack_values`]).
    /// - `ProtocolError::PayloadTooLarge` if the encoded payload exceeds
    ///   [`PacketHeader::MAX_PAYLOAD_SIZE`].
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match &self.body {
            PacketBody::FunctionCall(call) => pack_values(&[
                Value::Str(call.name.clone()),
                Value::Tuple(call.positional.clone()),
                Value::Map(call.named.clone()),
            ])?,
            PacketBody::DataReturn(data) => pack_values(&[Value::Map(data.fields.clone())])?,
            PacketBody::FileMeta(meta) => pack_values(&[
                Value::Str(meta.src_path.clone()),
                meta.dst_path.clone().map_or(Value::Null, Value::Str),
                Value::Int(meta.size),
            ])?,
        };

        if payload.len() > PacketHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: PacketHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(payload)
    }

    /// Serialize header plus payload.
    ///
    /// # Errors
    ///
    /// - See [`Packet::encode_payload`].
    pub fn pack(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        let header = PacketHeader::new(self.ids, self.kind(), payload.len() as u32);
        let mut out = Vec::with_capacity(PacketHeader::SIZE + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Reconstruct a packet from a parsed header and its payload bytes.
    ///
    /// # Errors
    ///
    /// - Codec errors from [`unpack_values`].
    /// - `ProtocolError::Malformed` if the decoded values do not match the
    ///   shape the packet kind requires.
    pub fn from_parts(header: &PacketHeader, payload: &[u8]) -> Result<Self> {
        let values = unpack_values(payload)?;
        let body = match header.kind {
            PacketKind::FunctionCall => match <[Value; 3]>::try_from(values) {
                Ok([Value::Str(name), Value::Tuple(positional), Value::Map(named)]) => {
                    PacketBody::FunctionCall(FunctionCall { name, positional, named })
                },
                _ => return Err(ProtocolError::Malformed("function call payload")),
            },
            PacketKind::DataReturn => match <[Value; 1]>::try_from(values) {
                Ok([Value::Map(fields)]) => PacketBody::DataReturn(DataReturn { fields }),
                _ => return Err(ProtocolError::Malformed("data return payload")),
            },
            PacketKind::FileMeta => match <[Value; 3]>::try_from(values) {
                Ok([Value::Str(src_path), dst, Value::Int(size)]) => {
                    let dst_path = match dst {
                        Value::Str(path) => Some(path),
                        Value::Null => None,
                        _ => return Err(ProtocolError::Malformed("file meta destination")),
                    };
                    PacketBody::FileMeta(FileMeta { src_path, dst_path, size })
                },
                _ => return Err(ProtocolError::Malformed("file meta payload")),
            },
        };

        Ok(Self { ids: header.ids, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketBuilder, stream::ByteStream};

    fn round_trip(packet: Packet) {
        let bytes = packet.pack().unwrap();
        let mut stream = ByteStream::from_bytes(&bytes);
        let header = PacketHeader::from_stream(&mut stream).unwrap();
        let payload = stream.next_bytes(header.payload_size as usize).unwrap().to_vec();
        let parsed = Packet::from_parts(&header, &payload).unwrap();
        assert_eq!(packet, parsed);
    }

    #[test]
    fn function_call_round_trip() {
        let mut named = BTreeMap::new();
        named.insert("greeting".to_string(), Value::Str("hi".to_string()));

        let mut packet =
            Packet::function_call("greet", vec![Value::Int(2), Value::Str("Ana".into())], named);
        packet.ids = CorrelationIds::new(3, 7);
        round_trip(packet);
    }

    #[test]
    fn data_return_round_trip() {
        let mut packet = Packet::data_return(DataReturn::with_return(Value::Int(5)));
        packet.ids = CorrelationIds::new(0, 1);
        round_trip(packet);
    }

    #[test]
    fn file_meta_round_trip() {
        for dst_path in [Some("/tmp/out.bin".to_string()), None] {
            let mut packet = Packet::file_meta(FileMeta {
                src_path: "/tmp/in.bin".to_string(),
                dst_path,
                size: 4096,
            });
            packet.ids = CorrelationIds::new(2, 9);
            round_trip(packet);
        }
    }

    #[test]
    fn empty_call_arguments() {
        let packet = Packet::function_call("ping", vec![], BTreeMap::new());
        round_trip(packet);
    }

    #[test]
    fn wrong_shape_rejected() {
        // A DataReturn header over a FunctionCall payload.
        let call = Packet::function_call("add", vec![Value::Int(1)], BTreeMap::new());
        let bytes = call.pack().unwrap();
        let payload = &bytes[PacketHeader::SIZE..];
        let header =
            PacketHeader::new(CorrelationIds::UNSET, PacketKind::DataReturn, payload.len() as u32);
        assert_eq!(
            Packet::from_parts(&header, payload),
            Err(ProtocolError::Malformed("data return payload"))
        );
    }

    #[test]
    fn builder_reassembles_across_chunks() {
        let mut named = BTreeMap::new();
        named.insert("x".to_string(), Value::Int(1));
        let mut packet = Packet::function_call("f", vec![Value::Bool(true)], named);
        packet.ids = CorrelationIds::new(0, 0);

        let bytes = packet.pack().unwrap();
        let mut builder = PacketBuilder::new();

        // Feed one byte at a time; the packet must appear exactly once, at
        // the final byte.
        for (i, byte) in bytes.iter().enumerate() {
            builder.push(&[*byte]);
            let parsed = builder.try_next().unwrap();
            if i + 1 < bytes.len() {
                assert!(parsed.is_none(), "packet completed early at byte {i}");
            } else {
                assert_eq!(parsed.unwrap(), packet);
            }
        }
    }
}
