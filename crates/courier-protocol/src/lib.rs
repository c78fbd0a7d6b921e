//! # courier-protocol
//!
//! Wire protocol for the Courier messaging engine.
//!
//! Defines the client/server frame vocabulary and a length-prefixed
//! MessagePack codec. The transport layer owns the actual socket; this
//! crate only translates between bytes and frames, and between server
//! frames and the engine's event types.

pub mod codec;
pub mod frames;

pub use codec::{decode_from, encode, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{code, ClientFrame, ServerFrame};
