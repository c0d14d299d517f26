//! Receive-side reassembly.
//!
//! Buffers slices by message id until every index in `[0, total)` is
//! present, then joins them in index order. Arrival order does not matter.
//! A short history of completed ids absorbs late retransmissions so a
//! message is never delivered twice.
//!
//! A buffer that sees no slice for `assembly_timeout` is evicted and its id
//! remembered. Later slices of that id are dropped without an ack, so the
//! sender can never settle a message the consumer will not receive.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use shuttle_core::codec;
use shuttle_core::config::TransportSettings;
use shuttle_core::{
    Ack, LogicalMessage, MessageAck, MessageId, Opcode, Parcel, PayloadKind, SliceAck, SliceInfo,
};

/// What the caller must do after handing a parcel to the assembler.
#[derive(Debug, Default)]
pub struct Assembly {
    /// Acknowledgments to send back, in order.
    pub acks: Vec<Ack>,
    /// The complete message, when this parcel finished one.
    pub delivered: Option<LogicalMessage>,
}

impl Assembly {
    fn dropped() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblerSettings {
    /// Completed ids remembered for duplicate suppression, and evicted ids
    /// remembered for refusal. At least 1.
    pub completed_history: usize,
    pub assembly_timeout: Duration,
}

impl From<&TransportSettings> for AssemblerSettings {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            completed_history: settings.completed_history,
            assembly_timeout: settings.assembly_timeout(),
        }
    }
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self::from(&TransportSettings::default())
    }
}

struct ReceiveBuffer {
    opcode: Opcode,
    kind: PayloadKind,
    channel: u16,
    total: u32,
    slices: BTreeMap<u32, Bytes>,
    last_activity: Instant,
}

pub struct Assembler {
    buffers: HashMap<MessageId, ReceiveBuffer>,
    completed: VecDeque<MessageId>,
    evicted: VecDeque<MessageId>,
    settings: AssemblerSettings,
}

impl Assembler {
    pub fn new(settings: AssemblerSettings) -> Self {
        Self {
            buffers: HashMap::new(),
            completed: VecDeque::with_capacity(settings.completed_history.max(1)),
            evicted: VecDeque::new(),
            settings,
        }
    }

    /// Feed one decoded parcel.
    pub fn accept(&mut self, parcel: Parcel) -> Assembly {
        let Some(info) = parcel.slice else {
            return match codec::unwrap_single(parcel) {
                Ok(message) => Assembly {
                    acks: Vec::new(),
                    delivered: Some(message),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "unprocessable single parcel, discarding");
                    Assembly::dropped()
                }
            };
        };

        if info.total == 0 || info.index >= info.total {
            tracing::warn!(
                message_id = %info.message_id,
                slice_index = info.index,
                total_slices = info.total,
                "slice index out of range, discarding"
            );
            return Assembly::dropped();
        }

        let slice_ack = Ack::Slice(SliceAck {
            message_id: info.message_id,
            slice_index: info.index,
        });

        if self.was_completed(&info.message_id) {
            tracing::debug!(
                message_id = %info.message_id,
                slice_index = info.index,
                resent = parcel.resent,
                "slice of already delivered message, discarding"
            );
            return Assembly {
                acks: vec![slice_ack],
                delivered: None,
            };
        }

        self.evict_stale();

        if self.evicted.contains(&info.message_id) {
            tracing::debug!(
                message_id = %info.message_id,
                slice_index = info.index,
                "slice of an evicted message, discarding without ack"
            );
            return Assembly::dropped();
        }

        let buffer = self
            .buffers
            .entry(info.message_id)
            .or_insert_with(|| ReceiveBuffer {
                opcode: parcel.opcode,
                kind: parcel.kind,
                channel: parcel.channel,
                total: info.total,
                slices: BTreeMap::new(),
                last_activity: Instant::now(),
            });

        if let Some(reason) = conflict(buffer, &parcel, &info) {
            tracing::warn!(
                message_id = %info.message_id,
                slice_index = info.index,
                total_slices = info.total,
                buffered_total = buffer.total,
                reason,
                "slice disagrees with buffered message, discarding"
            );
            return Assembly::dropped();
        }

        buffer.last_activity = Instant::now();
        if buffer.slices.insert(info.index, parcel.body).is_some() {
            tracing::debug!(
                message_id = %info.message_id,
                slice_index = info.index,
                "duplicate slice replaced"
            );
        }

        tracing::trace!(
            message_id = %info.message_id,
            slice_index = info.index,
            received = buffer.slices.len(),
            total_slices = info.total,
            "slice buffered"
        );

        if buffer.slices.len() < buffer.total as usize {
            return Assembly {
                acks: vec![slice_ack],
                delivered: None,
            };
        }

        let Some(buffer) = self.buffers.remove(&info.message_id) else {
            return Assembly::dropped();
        };
        self.remember_completed(info.message_id);

        match codec::reassemble(
            buffer.opcode,
            buffer.kind,
            buffer.channel,
            buffer.slices.into_values(),
        ) {
            Ok(message) => {
                tracing::debug!(
                    message_id = %info.message_id,
                    total_slices = buffer.total,
                    bytes = message.len(),
                    "message reassembled"
                );
                Assembly {
                    acks: vec![
                        slice_ack,
                        Ack::Message(MessageAck {
                            message_id: info.message_id,
                        }),
                    ],
                    delivered: Some(message),
                }
            }
            Err(e) => {
                tracing::warn!(
                    message_id = %info.message_id,
                    error = %e,
                    "reassembled message is unprocessable, discarding"
                );
                Assembly {
                    acks: vec![slice_ack],
                    delivered: None,
                }
            }
        }
    }

    /// Messages with at least one slice buffered.
    pub fn in_progress(&self) -> usize {
        self.buffers.len()
    }

    pub fn was_completed(&self, message_id: &MessageId) -> bool {
        self.completed.contains(message_id)
    }

    fn remember_completed(&mut self, message_id: MessageId) {
        while self.completed.len() >= self.settings.completed_history.max(1) {
            self.completed.pop_front();
        }
        self.completed.push_back(message_id);
    }

    /// Drop buffers that have not seen a slice within the timeout.
    fn evict_stale(&mut self) {
        let timeout = self.settings.assembly_timeout;
        let mut stale = Vec::new();
        self.buffers.retain(|message_id, buffer| {
            if buffer.last_activity.elapsed() <= timeout {
                return true;
            }
            tracing::warn!(
                message_id = %message_id,
                received = buffer.slices.len(),
                total_slices = buffer.total,
                "removing stale message assembly (timed out)"
            );
            stale.push(*message_id);
            false
        });

        let limit = self.settings.completed_history.max(1);
        for message_id in stale {
            while self.evicted.len() >= limit {
                self.evicted.pop_front();
            }
            self.evicted.push_back(message_id);
        }
    }
}

fn conflict(buffer: &ReceiveBuffer, parcel: &Parcel, info: &SliceInfo) -> Option<&'static str> {
    if buffer.total != info.total {
        Some("total_slices mismatch")
    } else if buffer.opcode != parcel.opcode {
        Some("opcode mismatch")
    } else if buffer.kind != parcel.kind {
        Some("payload kind mismatch")
    } else {
        None
    }
}
