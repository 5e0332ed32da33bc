//! Framing: fixed 8-byte header (u32 type tag, u32 body size, both LE) + opaque body.
//!
//! Typed bodies are bincode-encoded (fixed-width integers, little-endian), so the
//! whole frame has one canonical byte order regardless of host.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{MessageType, PeerId};

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest body a peer may declare. Anything larger is treated as a broken stream.
pub const MAX_BODY_SIZE: u32 = 16 * 1024 * 1024; // 16 MiB

/// Fixed-layout message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw type tag. Kept raw so the transport can carry tags it does not know.
    pub tag: u32,
    pub body_size: u32,
}

impl MessageHeader {
    pub fn new(kind: MessageType, body_size: u32) -> Self {
        Self {
            tag: kind.tag(),
            body_size,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.tag.to_le_bytes());
        out[4..].copy_from_slice(&self.body_size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            tag: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            body_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Reject headers whose declared body exceeds [`MAX_BODY_SIZE`].
    pub fn validate(&self) -> Result<(), WireError> {
        if self.body_size > MAX_BODY_SIZE {
            return Err(WireError::TooLarge(self.body_size));
        }
        Ok(())
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.tag).ok()
    }
}

/// One framed message. `body.len()` always equals `header.body_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    body: Vec<u8>,
}

impl Message {
    /// Message with an empty body.
    pub fn new(kind: MessageType) -> Self {
        Self {
            header: MessageHeader::new(kind, 0),
            body: Vec::new(),
        }
    }

    /// Message with a bincode-encoded typed body.
    pub fn with_body<T: Serialize>(kind: MessageType, body: &T) -> Result<Self, WireError> {
        let body = bincode::serialize(body).map_err(WireError::Encode)?;
        Self::from_raw(kind.tag(), body)
    }

    /// Message with an already-encoded body.
    pub fn from_raw(tag: u32, body: Vec<u8>) -> Result<Self, WireError> {
        let body_size = u32::try_from(body.len()).map_err(|_| WireError::TooLarge(u32::MAX))?;
        let header = MessageHeader { tag, body_size };
        header.validate()?;
        Ok(Self { header, body })
    }

    /// Reassemble a message from a header and the body bytes read for it.
    pub fn from_parts(header: MessageHeader, body: Vec<u8>) -> Result<Self, WireError> {
        if body.len() != header.body_size as usize {
            return Err(WireError::BodyMismatch {
                declared: header.body_size,
                actual: body.len(),
            });
        }
        Ok(Self { header, body })
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn kind(&self) -> Option<MessageType> {
        self.header.kind()
    }

    pub fn tag(&self) -> u32 {
        self.header.tag
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_size(&self) -> u32 {
        self.header.body_size
    }

    /// Decode the body as `T`.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        bincode::deserialize(&self.body).map_err(WireError::Decode)
    }

    /// Human-readable type name, `???` for unknown tags.
    pub fn name(&self) -> &'static str {
        self.kind().map(MessageType::name).unwrap_or("???")
    }
}

/// A message paired with the peer it came from (inbound) or goes to (outbound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: Message,
    pub peer_id: PeerId,
}

impl QueuedMessage {
    pub fn new(peer_id: PeerId, message: Message) -> Self {
        Self { message, peer_id }
    }
}

/// Error encoding or decoding a frame or a typed body.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("declared body size {0} exceeds limit")]
    TooLarge(u32),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("body encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("body decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error("body size mismatch: header declares {declared}, got {actual}")]
    BodyMismatch { declared: u32, actual: usize },
}
