//! Binary protocol for CRDT delta synchronization.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────────┐
//! │ kind     │ payload                  │
//! │ 1 byte   │ variable (rest of frame) │
//! └──────────┴──────────────────────────┘
//! ```
//!
//! There is no length prefix: the WebSocket message boundary delimits the
//! frame, and every frame carries exactly one logical event.
//!
//! | kind | frame | payload |
//! |------|-------|---------|
//! | 0 | [`Frame::StateVector`] | encoded version vector |
//! | 1 | [`Frame::Update`] | encoded delta |

use thiserror::Error;

use crate::document::{Delta, VersionVector};

/// Message kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Version vector: "this is what I already know"
    StateVector = 0,
    /// Delta: operations the receiver may not know yet
    Update = 1,
}

impl MessageKind {
    /// Tag byte written at offset 0 of the frame.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::StateVector),
            1 => Ok(Self::Update),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake probe carrying the sender's version vector.
    StateVector(VersionVector),
    /// Opaque delta to be applied by the receiver.
    Update(Delta),
}

impl Frame {
    /// The kind tag of this frame.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::StateVector(_) => MessageKind::StateVector,
            Self::Update(_) => MessageKind::Update,
        }
    }

    /// Payload bytes, without the tag.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::StateVector(sv) => sv.as_bytes(),
            Self::Update(delta) => delta.as_bytes(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.kind(), self.payload())
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let frame = match MessageKind::from_tag(tag)? {
            MessageKind::StateVector => Self::StateVector(VersionVector::from(payload)),
            MessageKind::Update => Self::Update(Delta::from(payload)),
        };
        Ok(frame)
    }
}

/// Encode a frame from a borrowed payload, without building a [`Frame`].
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(kind.tag());
    out.extend_from_slice(payload);
    out
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
}
