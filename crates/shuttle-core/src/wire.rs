//! Shuttle wire format — the parcel, the only unit the primitive moves.
//!
//! Every frame handed to the underlying one-way primitive is a 36-byte
//! `ParcelHeader` followed by the body. The header carries everything the
//! receiver needs to route, acknowledge, and reassemble a parcel before it
//! looks at a single body byte.
//!
//! The header is #[repr(C, packed)] with zerocopy derives, in host byte
//! order: both ends of the primitive live on the same device. There is no
//! unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::message::MessageId;

// ── Parcel Header ────────────────────────────────────────────────────────────

/// Fixed header preceding every parcel body.
///
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ParcelHeader {
    /// Identifier shared by all slices of one logical message.
    /// All-zero when the parcel is not sliced.
    pub message_id: [u8; 16],

    /// Zero-based position of this slice. Zero when not sliced.
    pub slice_index: u32,

    /// Number of slices the message was split into. Zero when not sliced.
    pub total_slices: u32,

    /// Length of the body in bytes, not including this header.
    pub body_len: u32,

    /// Opcode, see [`Opcode`].
    pub opcode: u16,

    /// Channel tag: which reply route the peer should answer on.
    pub channel: u16,

    /// How the body is interpreted once reassembled, see [`PayloadKind`].
    pub kind: u8,

    /// Bit flags:
    ///   bit 0: resent (retransmitted by the retry coordinator)
    ///   bit 1: sliced (message_id / slice_index / total_slices are valid)
    ///   bits 2-7: reserved, must be zero
    pub flags: u8,

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub reserved: u8,
}

assert_eq_size!(ParcelHeader, [u8; 36]);

/// Header length in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<ParcelHeader>();

/// Current parcel format version.
pub const PARCEL_VERSION: u8 = 0x01;

pub const FLAG_RESENT: u8 = 0b0000_0001;
pub const FLAG_SLICED: u8 = 0b0000_0010;
const FLAGS_KNOWN: u8 = FLAG_RESENT | FLAG_SLICED;

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// Highest opcode reserved for control traffic.
pub const CONTROL_OPCODE_MAX: u16 = 0x00ff;

/// Data opcode used by the device-resident service towards the engine.
pub const SERVICE_MESSAGE: u16 = 0x0100;

/// Data opcode used by the instrumented engine towards the service.
pub const ENGINE_MESSAGE: u16 = 0x0101;

/// What a parcel is for.
///
/// Control opcodes are never sliced. Every opcode above
/// `CONTROL_OPCODE_MAX` is data-bearing and subject to slicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Acknowledges one `(message_id, slice_index)`.
    SliceAck,
    /// Acknowledges a fully reassembled message.
    MessageAck,
    Ready,
    Running,
    Shutdown,
    Register,
    Unregister,
    Data(u16),
}

impl Opcode {
    /// Build a data opcode. Codes in the control range are rejected.
    pub fn data(code: u16) -> Result<Self, WireError> {
        if code <= CONTROL_OPCODE_MAX {
            return Err(WireError::ReservedOpcode(code));
        }
        Ok(Opcode::Data(code))
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Opcode::Data(_))
    }

    /// The lifecycle signal this opcode carries, if any.
    pub fn control_signal(&self) -> Option<ControlSignal> {
        match self {
            Opcode::Ready => Some(ControlSignal::Ready),
            Opcode::Running => Some(ControlSignal::Running),
            Opcode::Shutdown => Some(ControlSignal::Shutdown),
            Opcode::Register => Some(ControlSignal::Register),
            Opcode::Unregister => Some(ControlSignal::Unregister),
            Opcode::SliceAck | Opcode::MessageAck | Opcode::Data(_) => None,
        }
    }
}

impl TryFrom<u16> for Opcode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Opcode::SliceAck),
            0x0002 => Ok(Opcode::MessageAck),
            0x0003 => Ok(Opcode::Ready),
            0x0004 => Ok(Opcode::Running),
            0x0005 => Ok(Opcode::Shutdown),
            0x0006 => Ok(Opcode::Register),
            0x0007 => Ok(Opcode::Unregister),
            other if other <= CONTROL_OPCODE_MAX => Err(WireError::UnknownOpcode(other)),
            other => Ok(Opcode::Data(other)),
        }
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> u16 {
        match op {
            Opcode::SliceAck => 0x0001,
            Opcode::MessageAck => 0x0002,
            Opcode::Ready => 0x0003,
            Opcode::Running => 0x0004,
            Opcode::Shutdown => 0x0005,
            Opcode::Register => 0x0006,
            Opcode::Unregister => 0x0007,
            Opcode::Data(code) => code,
        }
    }
}

/// Endpoint lifecycle signals. Always single-parcel, never acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// The device service is up and accepting engine traffic.
    Ready,
    /// The engine has started executing.
    Running,
    /// The device service is going away.
    Shutdown,
    /// The engine attaches to the service.
    Register,
    /// The engine detaches from the service.
    Unregister,
}

impl From<ControlSignal> for Opcode {
    fn from(signal: ControlSignal) -> Opcode {
        match signal {
            ControlSignal::Ready => Opcode::Ready,
            ControlSignal::Running => Opcode::Running,
            ControlSignal::Shutdown => Opcode::Shutdown,
            ControlSignal::Register => Opcode::Register,
            ControlSignal::Unregister => Opcode::Unregister,
        }
    }
}

// ── Payload Kind ─────────────────────────────────────────────────────────────

/// How a reassembled body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    /// No payload.
    Empty = 0x00,
    /// UTF-8 text. Validated once, after reassembly.
    Text = 0x01,
    /// Opaque byte buffer.
    Bytes = 0x02,
    /// JSON-serialized property set.
    Properties = 0x03,
}

impl TryFrom<u8> for PayloadKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PayloadKind::Empty),
            0x01 => Ok(PayloadKind::Text),
            0x02 => Ok(PayloadKind::Bytes),
            0x03 => Ok(PayloadKind::Properties),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<PayloadKind> for u8 {
    fn from(k: PayloadKind) -> u8 {
        k as u8
    }
}

// ── Parcel ───────────────────────────────────────────────────────────────────

/// Sequencing metadata of one slice of a split message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInfo {
    pub message_id: MessageId,
    pub index: u32,
    pub total: u32,
}

/// A decoded parcel: header fields lifted into typed form, plus the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    pub opcode: Opcode,
    pub kind: PayloadKind,
    pub channel: u16,
    /// `None` for a self-contained parcel.
    pub slice: Option<SliceInfo>,
    pub resent: bool,
    pub body: Bytes,
}

impl Parcel {
    /// A self-contained parcel with no slicing metadata.
    pub fn single(opcode: Opcode, kind: PayloadKind, channel: u16, body: Bytes) -> Self {
        Self {
            opcode,
            kind,
            channel,
            slice: None,
            resent: false,
            body,
        }
    }

    /// Frame length once encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Serialize header and body into one frame.
    pub fn encode(&self) -> Bytes {
        let mut flags = 0u8;
        if self.resent {
            flags |= FLAG_RESENT;
        }
        let (message_id, slice_index, total_slices) = match self.slice {
            Some(info) => {
                flags |= FLAG_SLICED;
                (*info.message_id.as_bytes(), info.index, info.total)
            }
            None => ([0u8; 16], 0, 0),
        };

        let header = ParcelHeader {
            message_id,
            slice_index,
            total_slices,
            body_len: self.body.len() as u32,
            opcode: self.opcode.into(),
            channel: self.channel,
            kind: self.kind.into(),
            flags,
            version: PARCEL_VERSION,
            reserved: 0,
        };

        let mut frame = BytesMut::with_capacity(self.encoded_len());
        frame.put_slice(header.as_bytes());
        frame.put_slice(&self.body);
        frame.freeze()
    }

    /// Parse and validate one frame.
    ///
    /// A frame that fails here is unprocessable: the caller drops it with a
    /// diagnostic. Nothing about a bad frame reaches the reassembly buffers.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated(frame.len()));
        }
        let header =
            ParcelHeader::read_from_prefix(frame).ok_or(WireError::Truncated(frame.len()))?;

        // Packed fields — copy out before use.
        let version = header.version;
        let flags = header.flags;
        let body_len = header.body_len as usize;
        let slice_index = header.slice_index;
        let total_slices = header.total_slices;
        let message_id = header.message_id;

        if version != PARCEL_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        if flags & !FLAGS_KNOWN != 0 || header.reserved != 0 {
            return Err(WireError::ReservedFlagsSet(flags));
        }
        let actual = frame.len() - HEADER_LEN;
        if body_len != actual {
            return Err(WireError::LengthMismatch {
                declared: body_len,
                actual,
            });
        }

        let opcode = Opcode::try_from(header.opcode)?;
        let kind = PayloadKind::try_from(header.kind)?;

        let slice = if flags & FLAG_SLICED != 0 {
            if opcode.is_control() {
                return Err(WireError::SlicedControl(header.opcode));
            }
            if total_slices == 0 {
                return Err(WireError::ZeroSlices);
            }
            if slice_index >= total_slices {
                return Err(WireError::SliceOutOfRange {
                    index: slice_index,
                    total: total_slices,
                });
            }
            if message_id == [0u8; 16] {
                return Err(WireError::MissingMessageId);
            }
            Some(SliceInfo {
                message_id: MessageId::from_bytes(message_id),
                index: slice_index,
                total: total_slices,
            })
        } else {
            if message_id != [0u8; 16] || slice_index != 0 || total_slices != 0 {
                return Err(WireError::StraySliceMetadata);
            }
            None
        };

        Ok(Self {
            opcode,
            kind,
            channel: header.channel,
            slice,
            resent: flags & FLAG_RESENT != 0,
            body: Bytes::copy_from_slice(&frame[HEADER_LEN..]),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the parcel header")]
    Truncated(usize),

    #[error("unknown parcel version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("header declares {declared} body bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown control opcode: 0x{0:04x}")]
    UnknownOpcode(u16),

    #[error("opcode 0x{0:04x} is reserved for control traffic")]
    ReservedOpcode(u16),

    #[error("unknown payload kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("control opcode 0x{0:04x} must never be sliced")]
    SlicedControl(u16),

    #[error("sliced parcel declares zero total slices")]
    ZeroSlices,

    #[error("slice index {index} out of range for {total} slices")]
    SliceOutOfRange { index: u32, total: u32 },

    #[error("sliced parcel has no message id")]
    MissingMessageId,

    #[error("unsliced parcel carries slice metadata")]
    StraySliceMetadata,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
