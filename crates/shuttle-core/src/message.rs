//! Logical messages — what producers hand in and consumers get out.
//!
//! The transport never interprets a payload. `PayloadKind` only tells the
//! receiving side how to present the reassembled bytes.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::wire::{Opcode, PayloadKind};

/// A property set, the structured payload flavour.
pub type Properties = BTreeMap<String, serde_json::Value>;

// ── Message Id ───────────────────────────────────────────────────────────────

/// Opaque token shared by every slice of one split message.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// Fresh random id. Never all-zero, which the wire reserves for "absent".
    pub fn generate() -> Self {
        let mut bytes: [u8; 16] = rand::random();
        if bytes == [0u8; 16] {
            bytes[0] = 1;
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

impl Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))?;
        Ok(Self(arr))
    }
}

// ── Logical Message ──────────────────────────────────────────────────────────

/// One unbounded-size message, before slicing or after reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    pub opcode: Opcode,
    pub kind: PayloadKind,
    /// Reply route the peer should answer on.
    pub channel: u16,
    pub payload: Bytes,
}

impl LogicalMessage {
    pub fn text(opcode: Opcode, text: impl Into<String>) -> Self {
        Self {
            opcode,
            kind: PayloadKind::Text,
            channel: 0,
            payload: Bytes::from(text.into()),
        }
    }

    pub fn bytes(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            kind: PayloadKind::Bytes,
            channel: 0,
            payload: payload.into(),
        }
    }

    pub fn properties(opcode: Opcode, properties: &Properties) -> Result<Self, MessageError> {
        let payload = serde_json::to_vec(properties).map_err(MessageError::InvalidProperties)?;
        Ok(Self {
            opcode,
            kind: PayloadKind::Properties,
            channel: 0,
            payload: Bytes::from(payload),
        })
    }

    pub fn empty(opcode: Opcode) -> Self {
        Self {
            opcode,
            kind: PayloadKind::Empty,
            channel: 0,
            payload: Bytes::new(),
        }
    }

    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = channel;
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_text(&self) -> Result<&str, MessageError> {
        self.expect_kind(PayloadKind::Text)?;
        std::str::from_utf8(&self.payload).map_err(MessageError::InvalidText)
    }

    pub fn to_properties(&self) -> Result<Properties, MessageError> {
        self.expect_kind(PayloadKind::Properties)?;
        serde_json::from_slice(&self.payload).map_err(MessageError::InvalidProperties)
    }

    fn expect_kind(&self, expected: PayloadKind) -> Result<(), MessageError> {
        if self.kind != expected {
            return Err(MessageError::WrongKind {
                expected,
                actual: self.kind,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("payload is {actual:?}, not {expected:?}")]
    WrongKind {
        expected: PayloadKind,
        actual: PayloadKind,
    },
    #[error("text payload is not valid UTF-8: {0}")]
    InvalidText(std::str::Utf8Error),
    #[error("property set is not valid JSON: {0}")]
    InvalidProperties(serde_json::Error),
}
