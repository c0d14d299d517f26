//! Routes every inbound frame by opcode.
//!
//! Acks settle the send record, lifecycle signals go straight up, and data
//! parcels go through the assembler, whose acks are sent back best effort.

use std::sync::Arc;

use tokio::sync::Mutex;

use shuttle_core::{Ack, ControlSignal, LogicalMessage, Opcode, Parcel};

use crate::assembler::Assembler;
use crate::send_record::SendRecord;
use crate::stats::EndpointStats;
use crate::transport::RawTransport;

/// What inbound traffic means to the layer above.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A complete message, reassembled if it was sliced.
    Message(LogicalMessage),
    Control(ControlSignal),
}

pub struct Dispatcher<T: RawTransport> {
    transport: Arc<T>,
    record: Arc<SendRecord>,
    assembler: Mutex<Assembler>,
    stats: Arc<EndpointStats>,
}

impl<T: RawTransport> Dispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        record: Arc<SendRecord>,
        assembler: Assembler,
        stats: Arc<EndpointStats>,
    ) -> Self {
        Self {
            transport,
            record,
            assembler: Mutex::new(assembler),
            stats,
        }
    }

    /// Handle one raw frame. Malformed frames are logged and dropped.
    pub async fn dispatch(&self, frame: &[u8]) -> Option<Inbound> {
        let parcel = match Parcel::decode(frame) {
            Ok(parcel) => parcel,
            Err(e) => {
                tracing::warn!(len = frame.len(), error = %e, "malformed parcel, discarding");
                self.stats.parcel_rejected();
                return None;
            }
        };

        match parcel.opcode {
            Opcode::SliceAck | Opcode::MessageAck => {
                self.settle(&parcel).await;
                None
            }
            Opcode::Ready
            | Opcode::Running
            | Opcode::Shutdown
            | Opcode::Register
            | Opcode::Unregister => {
                let signal = parcel.opcode.control_signal()?;
                tracing::debug!(?signal, "control signal received");
                self.stats.control_received();
                Some(Inbound::Control(signal))
            }
            Opcode::Data(_) => {
                let channel = parcel.channel;
                let assembly = self.assembler.lock().await.accept(parcel);
                for ack in &assembly.acks {
                    self.send_ack(ack, channel);
                }
                let message = assembly.delivered?;
                self.stats.message_delivered();
                Some(Inbound::Message(message))
            }
        }
    }

    pub async fn in_progress(&self) -> usize {
        self.assembler.lock().await.in_progress()
    }

    async fn settle(&self, parcel: &Parcel) {
        match Ack::from_parcel(parcel) {
            Some(Ok(Ack::Slice(ack))) => {
                if !self.record.ack_slice(&ack).await {
                    tracing::trace!(
                        message_id = %ack.message_id,
                        slice_index = ack.slice_index,
                        "slice-ack for nothing pending"
                    );
                }
            }
            Some(Ok(Ack::Message(ack))) => {
                self.record.ack_message(&ack).await;
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "unreadable ack, discarding");
                self.stats.parcel_rejected();
            }
            None => {}
        }
    }

    /// Acks are never retried: a lost ack is covered by the sender's resend.
    fn send_ack(&self, ack: &Ack, channel: u16) {
        let parcel = match ack.to_parcel(channel) {
            Ok(parcel) => parcel,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode ack");
                return;
            }
        };
        match self.transport.send_raw(&parcel.encode()) {
            Ok(()) => self.stats.ack_sent(),
            Err(e) => tracing::debug!(
                message_id = %ack.message_id(),
                error = %e,
                "ack send failed"
            ),
        }
    }
}
