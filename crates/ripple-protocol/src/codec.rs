//! Wire codec for Ripple events.
//!
//! An event travels as a 4-byte big-endian payload length followed by the
//! MessagePack encoding of the event (named fields, so the `type` tag
//! survives). The prefix delimits every frame regardless of whether its
//! payload decodes, which is what makes the streaming decoder resilient: a
//! malformed payload costs exactly that one frame, and the next prefix
//! puts the decoder back in sync.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::events::Event;

/// Maximum encoded event size (1 MiB).
pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Event exceeds maximum size.
    #[error("Event size {0} exceeds maximum {MAX_EVENT_SIZE}")]
    EventTooLarge(usize),

    /// Not enough data to decode an event.
    #[error("Incomplete event: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid event data.
    #[error("Invalid event: {0}")]
    Invalid(String),
}

/// Serialize the payload and enforce the size cap, without framing.
fn to_payload(event: &Event) -> Result<Vec<u8>, ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;
    if payload.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(payload.len()));
    }
    Ok(payload)
}

/// Parse and validate a length prefix. `None` means fewer than four bytes
/// are available yet.
fn payload_len(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(length));
    }
    Ok(Some(length))
}

/// Encode an event as a single framed buffer.
///
/// # Errors
///
/// Returns an error if the encoded payload exceeds [`MAX_EVENT_SIZE`] or
/// serialization fails.
pub fn encode(event: &Event) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Append an event's frame to an existing buffer.
///
/// # Errors
///
/// Same conditions as [`encode`].
pub fn encode_into(event: &Event, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = to_payload(event)?;
    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Decode a single event from a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] when `data` holds less than one
/// full frame, and a decode error if the payload is malformed.
pub fn decode(data: &[u8]) -> Result<Event, ProtocolError> {
    let length = payload_len(data)?
        .ok_or_else(|| ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()))?;

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Streaming decode: take one event off the front of `buf` if a whole
/// frame has arrived.
///
/// Returns `Ok(None)` when more bytes are needed. On a payload decode
/// error the offending frame has already been consumed, so the caller can
/// log it and keep reading from the same buffer.
///
/// # Errors
///
/// Returns an error for an oversized prefix or an undecodable payload.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Event>, ProtocolError> {
    let Some(length) = payload_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PresenceStatus;

    #[test]
    fn test_encode_decode_roundtrip() {
        let events = vec![
            Event::connect(Some("token123".into()), "alice"),
            Event::join("conv:42"),
            Event::text_message("conv:42", "Hello, world!"),
            Event::presence("bob", PresenceStatus::Offline, Some(1_700_000_000_000)),
            Event::error(1002, "bad event"),
            Event::pong(Some(42)),
        ];

        for event in events {
            let encoded = encode(&event).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let event = Event::join("conv_1");
        let encoded = encode(&event).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_event_too_large() {
        let event = Event::text_message("conv_1", "x".repeat(MAX_EVENT_SIZE + 1));

        match encode(&event) {
            Err(ProtocolError::EventTooLarge(_)) => {}
            other => panic!("Expected EventTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let event1 = Event::join("conv_1");
        let event2 = Event::leave("conv_1");

        let mut buf = BytesMut::new();
        encode_into(&event1, &mut buf).unwrap();
        encode_into(&event2, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(event1, decoded1);
        assert_eq!(event2, decoded2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_prefix() {
        let mut buf = BytesMut::from(&b"\x00\x00"[..]);
        // Streaming decode waits for the rest of the prefix
        assert!(decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);

        match decode(&buf) {
            Err(ProtocolError::Incomplete(n)) => assert_eq!(n, 2),
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_frame_is_consumed() {
        let mut buf = BytesMut::new();
        // A well-framed but undecodable payload
        buf.put_u32(3);
        buf.extend_from_slice(b"\xff\xff\xff");
        encode_into(&Event::pong(None), &mut buf).unwrap();

        assert!(decode_from(&mut buf).is_err());
        // The next frame is still decodable
        let next = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(next, Event::pong(None));
    }
}
