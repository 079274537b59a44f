//! Length-prefixed frame codec and the versioned message codec on top of it.
//!
//! Implements tokio's `Decoder` and `Encoder` traits so sockets can be wrapped
//! in `FramedRead` / `FramedWrite`. Standalone [`read_frame`] and
//! [`write_frame`] helpers cover callers that drive a stream directly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;
use crate::error::{RelayError, Result};

/// Maximum frame size (1 MiB by default).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The only message encoding currently spoken: JSON body after a version byte.
pub const WIRE_VERSION: u8 = 1;

const LENGTH_PREFIX: usize = 4;

/// Codec for raw frames.
///
/// Frames are laid out as:
/// - 4 bytes: payload length (big-endian, excludes these 4 bytes)
/// - N bytes: payload
///
/// A length above the configured maximum is rejected before anything is
/// reserved for it.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec with default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_length(&self, length: usize) -> Result<()> {
        if length > self.max_frame_size {
            return Err(RelayError::protocol(format!(
                "frame size {length} exceeds maximum {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Read length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        self.check_length(length)?;

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // Peer went away in the middle of a frame.
            None => Err(RelayError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.check_length(item.len())?;
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Codec for [`Message`] frames.
///
/// The payload of each frame is a version byte followed by the JSON body.
/// Unknown versions and malformed bodies are protocol errors.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    frames: FrameCodec,
}

impl MessageCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            frames: FrameCodec::with_max_frame_size(max_frame_size),
        }
    }

    /// Encode a message into a frame payload (version byte + body).
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the message cannot be serialized.
    pub fn encode_payload(message: &Message) -> Result<Bytes> {
        let body = serde_json::to_vec(message)
            .map_err(|e| RelayError::protocol(format!("failed to encode message: {e}")))?;
        let mut payload = BytesMut::with_capacity(1 + body.len());
        payload.put_u8(WIRE_VERSION);
        payload.extend_from_slice(&body);
        Ok(payload.freeze())
    }

    /// Decode a frame payload into a message.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an empty payload, an unknown wire version
    /// or a malformed body.
    pub fn decode_payload(payload: &[u8]) -> Result<Message> {
        let (&version, body) = payload
            .split_first()
            .ok_or_else(|| RelayError::protocol("empty frame"))?;
        if version != WIRE_VERSION {
            return Err(RelayError::protocol(format!(
                "unsupported wire version {version}"
            )));
        }
        serde_json::from_slice(body)
            .map_err(|e| RelayError::protocol(format!("malformed message: {e}")))
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.frames.decode(src)? {
            Some(frame) => Self::decode_payload(&frame).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.frames.decode_eof(src)? {
            Some(frame) => Self::decode_payload(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = Self::encode_payload(&item)?;
        self.frames.encode(payload, dst)
    }
}

/// Write one frame: the big-endian length followed by `payload`.
///
/// # Errors
///
/// Returns a protocol error if `payload` exceeds `max_frame_size`, or the
/// underlying IO error.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8], max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_frame_size {
        return Err(RelayError::protocol(format!(
            "frame size {} exceeds maximum {max_frame_size}",
            payload.len()
        )));
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one complete frame, however the transport chunks it.
///
/// # Errors
///
/// - [`RelayError::ConnectionClosed`] if the stream ends before or inside a frame
/// - [`RelayError::Protocol`] if the length exceeds `max_frame_size`
pub async fn read_frame<R>(stream: &mut R, max_frame_size: usize) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let length = match stream.read_u32().await {
        Ok(length) => length as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RelayError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };
    if length > max_frame_size {
        return Err(RelayError::protocol(format!(
            "frame size {length} exceeds maximum {max_frame_size}"
        )));
    }

    let mut payload = BytesMut::zeroed(length);
    match stream.read_exact(&mut payload).await {
        Ok(_) => Ok(payload),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RelayError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}
