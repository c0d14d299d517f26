//! Slicing and reassembly of logical messages.
//!
//! A message whose payload fits in `max_single_parcel_bytes` travels as one
//! self-contained parcel. Anything larger is cut into `ceil(len / slice_size)`
//! slices that share a fresh `MessageId`. Control opcodes are never sliced.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{LogicalMessage, MessageId};
use crate::wire::{Opcode, Parcel, PayloadKind, SliceInfo};

/// Size thresholds for slicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParcelLimits {
    /// Largest payload sent unsliced.
    pub max_single_parcel_bytes: usize,
    /// Body size of each slice (the last one may be shorter).
    pub slice_size: usize,
}

impl ParcelLimits {
    pub fn new(max_single_parcel_bytes: usize, slice_size: usize) -> Result<Self, CodecError> {
        if slice_size == 0 {
            return Err(CodecError::ZeroSliceSize);
        }
        Ok(Self {
            max_single_parcel_bytes,
            slice_size,
        })
    }
}

/// Number of slices needed for `len` bytes. No phantom trailing slice when
/// `len` is an exact multiple of `slice_size`.
pub fn slice_count(len: usize, slice_size: usize) -> usize {
    len.div_ceil(slice_size)
}

/// Outcome of slicing one message.
#[derive(Debug, Clone)]
pub enum Split {
    Single(Parcel),
    Sliced {
        message_id: MessageId,
        /// In increasing slice index order.
        parcels: Vec<Parcel>,
    },
}

impl Split {
    #[cfg(test)]
    fn parcels(&self) -> &[Parcel] {
        match self {
            Split::Single(p) => std::slice::from_ref(p),
            Split::Sliced { parcels, .. } => parcels,
        }
    }
}

/// Decide how `msg` goes on the wire.
pub fn split_message(msg: &LogicalMessage, limits: &ParcelLimits) -> Result<Split, CodecError> {
    let len = msg.payload.len();

    if msg.opcode.is_control() {
        if len > limits.max_single_parcel_bytes {
            return Err(CodecError::ControlTooLarge {
                opcode: msg.opcode.into(),
                len,
                max: limits.max_single_parcel_bytes,
            });
        }
        return Ok(Split::Single(single(msg)));
    }

    if len <= limits.max_single_parcel_bytes {
        return Ok(Split::Single(single(msg)));
    }

    let total = slice_count(len, limits.slice_size);
    let total = u32::try_from(total).map_err(|_| CodecError::TooManySlices(total))?;
    let message_id = MessageId::generate();

    let parcels = (0..total)
        .map(|index| {
            let start = index as usize * limits.slice_size;
            let end = (start + limits.slice_size).min(len);
            Parcel {
                opcode: msg.opcode,
                kind: msg.kind,
                channel: msg.channel,
                slice: Some(SliceInfo {
                    message_id,
                    index,
                    total,
                }),
                resent: false,
                body: msg.payload.slice(start..end),
            }
        })
        .collect();

    Ok(Split::Sliced {
        message_id,
        parcels,
    })
}

fn single(msg: &LogicalMessage) -> Parcel {
    Parcel::single(msg.opcode, msg.kind, msg.channel, msg.payload.clone())
}

/// Turn a self-contained parcel straight into a message.
pub fn unwrap_single(parcel: Parcel) -> Result<LogicalMessage, CodecError> {
    check_payload(parcel.kind, &parcel.body)?;
    Ok(LogicalMessage {
        opcode: parcel.opcode,
        kind: parcel.kind,
        channel: parcel.channel,
        payload: parcel.body,
    })
}

/// Concatenate slice bodies, already sorted by index, into the original
/// message. Text is validated as UTF-8 only here, on the joined bytes,
/// because a slice boundary may fall inside a multi-byte character.
pub fn reassemble(
    opcode: Opcode,
    kind: PayloadKind,
    channel: u16,
    bodies: impl IntoIterator<Item = Bytes>,
) -> Result<LogicalMessage, CodecError> {
    let mut payload = BytesMut::new();
    for body in bodies {
        payload.put(body);
    }
    let payload = payload.freeze();
    check_payload(kind, &payload)?;
    Ok(LogicalMessage {
        opcode,
        kind,
        channel,
        payload,
    })
}

fn check_payload(kind: PayloadKind, payload: &[u8]) -> Result<(), CodecError> {
    match kind {
        PayloadKind::Text => {
            std::str::from_utf8(payload).map_err(CodecError::InvalidText)?;
        }
        PayloadKind::Empty if !payload.is_empty() => {
            return Err(CodecError::NonEmptyEmpty(payload.len()));
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("slice size must be non-zero")]
    ZeroSliceSize,

    #[error("control opcode 0x{opcode:04x} payload of {len} bytes exceeds the {max}-byte single parcel limit")]
    ControlTooLarge { opcode: u16, len: usize, max: usize },

    #[error("{0} slices do not fit the 32-bit slice counter")]
    TooManySlices(usize),

    #[error("reassembled text is not valid UTF-8: {0}")]
    InvalidText(std::str::Utf8Error),

    #[error("payload marked empty carries {0} bytes")]
    NonEmptyEmpty(usize),
}
