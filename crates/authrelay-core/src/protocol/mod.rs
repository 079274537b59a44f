//! Wire protocol for the authentication relay.
//!
//! Every unit on the TCP stream is a frame:
//! - 4 bytes: payload length (big-endian, excludes these 4 bytes)
//! - N bytes: payload
//!
//! The payload of a message frame starts with a one-byte wire version
//! followed by the versioned encoding of a [`Message`].

pub mod codec;
pub mod message;

pub use codec::{read_frame, write_frame, FrameCodec, MessageCodec, DEFAULT_MAX_FRAME_SIZE, WIRE_VERSION};
pub use message::{Message, Operation};
