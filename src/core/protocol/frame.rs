// src/core/protocol/frame.rs

//! Implements the length-prefixed wire framing and the corresponding
//! `Encoder` and `Decoder` for network communication.
//!
//! Each frame is a 4-byte big-endian length prefix followed by that many
//! bytes of payload. The payload is a UTF-8 JSON message, except for binary
//! frames whose JSON header (`type == "binary_frame"`) is followed by raw
//! bytes of the declared `binary_size` inside the same frame.

use super::message::Message;
use crate::core::LatZeroError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Length of the frame size prefix in bytes.
const LENGTH_PREFIX_LEN: usize = 4;

/// Frames larger than this terminate the connection.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A `tokio_util::codec` implementation framing `Message`s on the wire.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Message;
    type Error = LatZeroError;

    /// Decodes one frame from the buffer.
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold a complete
    /// frame, letting the `Framed` stream wait for more data.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let frame_len = u32::from_be_bytes(prefix) as usize;

        // The guard fires before the payload is buffered so an attacker
        // cannot make the server accumulate an oversized frame.
        if frame_len > MAX_FRAME_SIZE {
            return Err(LatZeroError::FrameTooLarge(frame_len));
        }

        if src.len() < LENGTH_PREFIX_LEN + frame_len {
            src.reserve(LENGTH_PREFIX_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(frame_len).freeze();
        parse_payload(payload).map(Some)
    }
}

impl Encoder<Message> for WireCodec {
    type Error = LatZeroError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = serde_json::to_vec(&item.to_json())?;
        let binary_tail = match &item {
            Message::Binary(frame) => frame.data.as_ref(),
            _ => &[],
        };

        let frame_len = header.len() + binary_tail.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(LatZeroError::FrameTooLarge(frame_len));
        }

        dst.reserve(LENGTH_PREFIX_LEN + frame_len);
        dst.put_u32(frame_len as u32);
        dst.extend_from_slice(&header);
        dst.extend_from_slice(binary_tail);
        Ok(())
    }
}

/// Parses a complete frame payload into a typed message.
///
/// A binary frame is detected by parsing the leading JSON object with a
/// stream deserializer: the byte offset where the object ends marks the
/// start of the raw tail.
fn parse_payload(payload: Bytes) -> Result<Message, LatZeroError> {
    let mut stream = serde_json::Deserializer::from_slice(&payload).into_iter::<Value>();
    let value = match stream.next() {
        Some(Ok(v)) => v,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(LatZeroError::Protocol("empty frame payload".into())),
    };
    let header_end = stream.byte_offset();

    let is_binary = value
        .as_object()
        .and_then(|m| m.get("type"))
        .and_then(Value::as_str)
        == Some("binary_frame");

    if is_binary {
        let header = match value {
            Value::Object(map) => map,
            _ => unreachable!("binary_frame detection requires an object"),
        };
        return Message::from_binary(header, payload.slice(header_end..));
    }

    if payload[header_end..].iter().any(|b| !b.is_ascii_whitespace()) {
        return Err(LatZeroError::Protocol(
            "unexpected trailing bytes after JSON payload".into(),
        ));
    }
    Message::from_json(value)
}

/// Encodes a message to a standalone frame buffer.
/// Useful in tests and for pre-rendering broadcast payloads.
pub fn encode_to_vec(message: Message) -> Result<Vec<u8>, LatZeroError> {
    let mut buf = BytesMut::new();
    WireCodec.encode(message, &mut buf)?;
    Ok(buf.to_vec())
}
