//! Incremental packet reassembly from network chunks.
//!
//! The socket delivers bytes at arbitrary boundaries. The builder buffers
//! them, parses a header once 19 bytes are present, then waits for
//! `payload_size` payload bytes before producing a typed packet.
//!
//! File bodies do not pass through here as frames: after the engine sees a
//! `FileMeta` packet it pulls the trailing raw bytes out of the buffer with
//! [`PacketBuilder::take_buffered`] and routes them to the destination file.

use crate::{
    errors::{ProtocolError, Result},
    header::PacketHeader,
    packet::Packet,
    stream::ByteStream,
};

/// Reassembles typed packets from arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    stream: ByteStream,
    pending: Option<PacketHeader>,
    /// Payload bytes still to discard after an unknown-kind header.
    discard: usize,
}

impl PacketBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.stream.append(chunk);
    }

    /// Bytes buffered and not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.stream.remaining()
    }

    /// Pull up to `max` buffered bytes out of the frame stream.
    ///
    /// Only valid between frames (the engine calls this directly after a
    /// `FileMeta` packet, before resuming [`PacketBuilder::try_next`]).
    pub fn take_buffered(&mut self, max: usize) -> Vec<u8> {
        debug_assert!(self.pending.is_none());
        let n = max.min(self.stream.remaining());
        // remaining() bounds n, so the read cannot fail
        let bytes = self.stream.next_bytes(n).unwrap_or_default().to_vec();
        self.stream.trim_consumed();
        bytes
    }

    /// Try to produce the next complete packet.
    ///
    /// Returns `Ok(None)` while more bytes are needed. Frames with an
    /// unknown kind tag are skipped in full (their payload is discarded) and
    /// reported once as `ProtocolError::UnknownKind`; parsing continues with
    /// the next call.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownKind` and payload codec errors are
    ///   recoverable: the stream stays aligned on the next frame.
    /// - `ProtocolError::InvalidMagic` / `ProtocolError::UnsupportedVersion`
    ///   / `ProtocolError::PayloadTooLarge` mean the stream is corrupt and
    ///   the connection must be dropped.
    pub fn try_next(&mut self) -> Result<Option<Packet>> {
        // Finish discarding an unknown-kind frame body first.
        if self.discard > 0 {
            let n = self.discard.min(self.stream.remaining());
            let _ = self.stream.next_bytes(n);
            self.stream.trim_consumed();
            self.discard -= n;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        if self.pending.is_none() {
            if self.stream.remaining() < PacketHeader::SIZE {
                return Ok(None);
            }
            match PacketHeader::from_stream(&mut self.stream) {
                Ok(header) => {
                    self.stream.trim_consumed();
                    self.pending = Some(header);
                },
                Err(ProtocolError::UnknownKind { kind, payload_size }) => {
                    self.stream.trim_consumed();
                    self.discard = payload_size as usize;
                    return Err(ProtocolError::UnknownKind { kind, payload_size });
                },
                Err(err) => return Err(err),
            }
        }

        let Some(header) = self.pending else {
            return Ok(None);
        };

        if self.stream.remaining() < header.payload_size as usize {
            return Ok(None);
        }

        // The availability check above guarantees this read succeeds.
        let payload = self
            .stream
            .next_bytes(header.payload_size as usize)
            .unwrap_or_default()
            .to_vec();
        self.stream.trim_consumed();
        self.pending = None;

        Packet::from_parts(&header, &payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        header::{CorrelationIds, PacketKind},
        value::Value,
    };

    fn sample_packet(global_id: i32) -> Packet {
        let mut packet =
            Packet::function_call("echo", vec![Value::Int(global_id)], BTreeMap::new());
        packet.ids = CorrelationIds::new(0, global_id);
        packet
    }

    #[test]
    fn two_packets_in_one_chunk() {
        let first = sample_packet(0);
        let second = sample_packet(1);

        let mut wire = first.pack().unwrap();
        wire.extend_from_slice(&second.pack().unwrap());

        let mut builder = PacketBuilder::new();
        builder.push(&wire);

        assert_eq!(builder.try_next().unwrap().unwrap(), first);
        assert_eq!(builder.try_next().unwrap().unwrap(), second);
        assert!(builder.try_next().unwrap().is_none());
    }

    #[test]
    fn header_split_across_chunks() {
        let packet = sample_packet(3);
        let wire = packet.pack().unwrap();

        let mut builder = PacketBuilder::new();
        builder.push(&wire[..7]); // partial header
        assert!(builder.try_next().unwrap().is_none());

        builder.push(&wire[7..]);
        assert_eq!(builder.try_next().unwrap().unwrap(), packet);
    }

    #[test]
    fn unknown_kind_skips_frame_and_recovers() {
        let good = sample_packet(1);

        // Forge a frame with the retired 0x102 kind and a 5-byte payload.
        let mut forged =
            PacketHeader::new(CorrelationIds::new(0, 0), PacketKind::DataReturn, 5).to_bytes();
        forged[12..15].copy_from_slice(&[0x00, 0x01, 0x02]);
        let mut wire = forged.to_vec();
        wire.extend_from_slice(&[9u8; 5]);
        wire.extend_from_slice(&good.pack().unwrap());

        let mut builder = PacketBuilder::new();
        builder.push(&wire);

        assert!(matches!(
            builder.try_next(),
            Err(ProtocolError::UnknownKind { kind: 0x102, payload_size: 5 })
        ));
        // The frame body was discarded; the next packet parses cleanly.
        assert_eq!(builder.try_next().unwrap().unwrap(), good);
    }

    #[test]
    fn take_buffered_drains_file_body() {
        let meta = Packet::file_meta(crate::FileMeta {
            src_path: "a.bin".to_string(),
            dst_path: None,
            size: 6,
        });
        let mut wire = meta.pack().unwrap();
        wire.extend_from_slice(b"abcdef");
        let trailing = sample_packet(2);
        wire.extend_from_slice(&trailing.pack().unwrap());

        let mut builder = PacketBuilder::new();
        builder.push(&wire);

        let parsed = builder.try_next().unwrap().unwrap();
        assert!(matches!(parsed.body, crate::PacketBody::FileMeta(_)));

        assert_eq!(builder.take_buffered(6), b"abcdef");
        assert_eq!(builder.try_next().unwrap().unwrap(), trailing);
    }
}
