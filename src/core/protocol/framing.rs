// src/core/protocol/framing.rs

//! Implements the text framing shared by the handshake and the JSON hub protocol:
//! every frame is a UTF-8 payload terminated by the ASCII record separator (0x1E).

use crate::core::HubError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The byte that terminates every text frame.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Upper bound on a single frame. A peer that streams more than this without a
/// separator is treated as sending garbage.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Splits one complete frame off the front of `src`, consuming the separator.
/// Returns `Ok(None)` when the buffer does not yet hold a full frame.
pub fn try_split_frame(src: &mut BytesMut) -> Result<Option<BytesMut>, HubError> {
    match src.iter().position(|b| *b == RECORD_SEPARATOR) {
        Some(pos) => {
            let frame = src.split_to(pos);
            src.advance(1);
            Ok(Some(frame))
        }
        None if src.len() > MAX_FRAME_SIZE => Err(HubError::InvalidData(format!(
            "frame exceeds the maximum size of {MAX_FRAME_SIZE} bytes"
        ))),
        None => Ok(None),
    }
}

/// Appends `payload` followed by the record separator.
pub fn write_frame(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len() + 1);
    dst.put_slice(payload);
    dst.put_u8(RECORD_SEPARATOR);
}

/// A `tokio_util::codec` implementation for record-separated frames.
///
/// The client engine parses frames straight out of its read buffer, but servers
/// and tools that speak the same framing can drive it through `Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordSeparatorCodec;

impl Decoder for RecordSeparatorCodec {
    type Item = Bytes;
    type Error = HubError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(try_split_frame(src)?.map(BytesMut::freeze))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(HubError::InvalidData(
                "connection terminated while reading a message".to_string(),
            )),
        }
    }
}

impl Encoder<Bytes> for RecordSeparatorCodec {
    type Error = HubError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&item, dst);
        Ok(())
    }
}

impl Encoder<&str> for RecordSeparatorCodec {
    type Error = HubError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(item.as_bytes(), dst);
        Ok(())
    }
}
