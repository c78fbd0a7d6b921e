//! Length-prefixed MessagePack codec for Courier frames.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by the
//! MessagePack encoding of the frame. The codec is generic over the frame
//! direction so both sides share one implementation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (1 MiB). Chat payloads are small; media rides as
/// URLs, not bytes.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encoding/decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// MessagePack encoding error.
    #[error("encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a frame with its length prefix.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Try to decode one frame from the front of a read buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// consumed bytes are removed from the buffer on success.
///
/// # Errors
///
/// Returns an error if the advertised length is oversized or the payload
/// does not decode.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;
    Ok(Some(frame))
}
