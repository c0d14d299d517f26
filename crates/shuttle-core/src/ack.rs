//! Acknowledgment payloads.
//!
//! The receiver answers every accepted slice with a `SliceAck` and every
//! completed message with one `MessageAck`. Both travel as single JSON
//! parcels on their control opcodes and are never acknowledged themselves.
//! Receiving one twice is a no-op on the sender.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::MessageId;
use crate::wire::{Opcode, Parcel, PayloadKind};

/// Largest ack body on the wire: a `SliceAck` with index `u32::MAX`.
/// Every parcel limit must leave room for it.
pub const MAX_ACK_BODY: usize = 74;

/// Confirms one slice.
///
/// Wire: opcode = Opcode::SliceAck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceAck {
    pub message_id: MessageId,
    pub slice_index: u32,
}

/// Confirms a whole message was reassembled and delivered.
///
/// Wire: opcode = Opcode::MessageAck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub message_id: MessageId,
}

/// Either acknowledgment, as emitted by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Slice(SliceAck),
    Message(MessageAck),
}

impl Ack {
    pub fn message_id(&self) -> MessageId {
        match self {
            Ack::Slice(a) => a.message_id,
            Ack::Message(a) => a.message_id,
        }
    }

    /// Frame the ack as a single control parcel on `channel`.
    pub fn to_parcel(&self, channel: u16) -> Result<Parcel, serde_json::Error> {
        let (opcode, body) = match self {
            Ack::Slice(a) => (Opcode::SliceAck, serde_json::to_vec(a)?),
            Ack::Message(a) => (Opcode::MessageAck, serde_json::to_vec(a)?),
        };
        Ok(Parcel::single(
            opcode,
            PayloadKind::Bytes,
            channel,
            Bytes::from(body),
        ))
    }

    /// Read an ack back out of a parcel. `None` if the opcode is not an ack.
    pub fn from_parcel(parcel: &Parcel) -> Option<Result<Self, serde_json::Error>> {
        match parcel.opcode {
            Opcode::SliceAck => Some(serde_json::from_slice(&parcel.body).map(Ack::Slice)),
            Opcode::MessageAck => Some(serde_json::from_slice(&parcel.body).map(Ack::Message)),
            _ => None,
        }
    }
}
