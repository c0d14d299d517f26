//! shuttle-core — wire format, message model, slicing codec, and config.
//! All other Shuttle crates depend on this one.

pub mod ack;
pub mod codec;
pub mod config;
pub mod message;
pub mod wire;

pub use ack::{Ack, MessageAck, SliceAck, MAX_ACK_BODY};
pub use codec::{ParcelLimits, Split};
pub use message::{LogicalMessage, MessageId, Properties};
pub use wire::{ControlSignal, Opcode, Parcel, PayloadKind, SliceInfo};
