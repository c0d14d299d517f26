//! One side of the channel: the device service or the instrumented engine.
//!
//! An endpoint owns the send primitive towards its peer, the send record,
//! and the assembler. Producers call `send` from any task; a single
//! `run` worker drains the inbound queue in arrival order.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use shuttle_core::codec::{self, ParcelLimits, Split};
use shuttle_core::config::{ConfigError, EndpointRole, TransportSettings};
use shuttle_core::wire::{ENGINE_MESSAGE, HEADER_LEN, SERVICE_MESSAGE};
use shuttle_core::{
    ControlSignal, LogicalMessage, Opcode, Parcel, PayloadKind, Properties, MAX_ACK_BODY,
};

use crate::assembler::{Assembler, AssemblerSettings};
use crate::coordinator::{Delivered, RetryCoordinator, RetryPolicy, SendError};
use crate::dispatch::{Dispatcher, Inbound};
use crate::send_record::SendRecord;
use crate::stats::EndpointStats;
use crate::transport::RawTransport;

pub struct Endpoint<T: RawTransport> {
    role: EndpointRole,
    limits: ParcelLimits,
    coordinator: RetryCoordinator<T>,
    dispatcher: Dispatcher<T>,
    stats: Arc<EndpointStats>,
}

impl<T: RawTransport> Endpoint<T> {
    /// Fails if a full data parcel or the widest ack under `settings` would
    /// not fit the transport.
    pub fn new(
        role: EndpointRole,
        transport: Arc<T>,
        settings: &TransportSettings,
    ) -> Result<Self, ConfigError> {
        let limits = settings.limits()?;
        let largest = limits
            .max_single_parcel_bytes
            .max(limits.slice_size)
            .max(MAX_ACK_BODY)
            + HEADER_LEN;
        if largest > transport.max_frame_len() {
            return Err(ConfigError::Invalid(format!(
                "{largest}-byte parcels exceed the transport's {}-byte frame ceiling",
                transport.max_frame_len()
            )));
        }

        let record = Arc::new(SendRecord::new());
        let stats = Arc::new(EndpointStats::new());
        Ok(Self {
            role,
            limits,
            coordinator: RetryCoordinator::new(
                transport.clone(),
                record.clone(),
                RetryPolicy::from(settings),
            ),
            dispatcher: Dispatcher::new(
                transport,
                record,
                Assembler::new(AssemblerSettings::from(settings)),
                stats.clone(),
            ),
            stats,
        })
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    /// Opcode this role's outbound data travels on.
    pub fn data_opcode(&self) -> Opcode {
        match self.role {
            EndpointRole::Service => Opcode::Data(SERVICE_MESSAGE),
            EndpointRole::Engine => Opcode::Data(ENGINE_MESSAGE),
        }
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Messages still waiting for acknowledgment.
    pub async fn in_flight(&self) -> usize {
        self.coordinator.record().in_flight().await
    }

    /// Send one logical message and wait until the peer has all of it.
    ///
    /// Unsliced messages carry no id and complete once the transport
    /// accepts the frame.
    pub async fn send(&self, message: LogicalMessage) -> Result<Delivered, SendError> {
        let result = match codec::split_message(&message, &self.limits) {
            Ok(Split::Single(parcel)) => self
                .coordinator
                .transmit(&parcel)
                .map(|()| Delivered {
                    message_id: None,
                    slices: 1,
                    resent: 0,
                })
                .map_err(SendError::from),
            Ok(Split::Sliced {
                message_id,
                parcels,
            }) => {
                tracing::debug!(
                    message_id = %message_id,
                    opcode = u16::from(message.opcode),
                    bytes = message.len(),
                    slices = parcels.len(),
                    "sending sliced message"
                );
                self.coordinator.deliver(message_id, &parcels).await
            }
            Err(e) => Err(SendError::from(e)),
        };

        match &result {
            Ok(delivered) => self.stats.message_sent(delivered.resent),
            Err(e) => {
                self.stats.send_failed();
                tracing::warn!(error = %e, "send failed");
            }
        }
        result
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<Delivered, SendError> {
        self.send(LogicalMessage::text(self.data_opcode(), text))
            .await
    }

    pub async fn send_bytes(&self, payload: impl Into<Bytes>) -> Result<Delivered, SendError> {
        self.send(LogicalMessage::bytes(self.data_opcode(), payload))
            .await
    }

    /// Send a property set on the role's data opcode.
    pub async fn send_properties(&self, properties: &Properties) -> anyhow::Result<Delivered> {
        let message = LogicalMessage::properties(self.data_opcode(), properties)?;
        Ok(self.send(message).await?)
    }

    /// Lifecycle signals are single, unacknowledged parcels.
    pub fn send_control(&self, signal: ControlSignal) -> Result<(), SendError> {
        let parcel = Parcel::single(signal.into(), PayloadKind::Empty, 0, Bytes::new());
        self.coordinator.transmit(&parcel)?;
        tracing::debug!(?signal, "control signal sent");
        Ok(())
    }

    /// Tell the peer this endpoint is up.
    pub fn announce(&self) -> Result<(), SendError> {
        match self.role {
            EndpointRole::Engine => {
                self.send_control(ControlSignal::Register)?;
                self.send_control(ControlSignal::Running)
            }
            EndpointRole::Service => self.send_control(ControlSignal::Ready),
        }
    }

    /// Tell the peer this endpoint is going away.
    pub fn retire(&self) -> Result<(), SendError> {
        match self.role {
            EndpointRole::Engine => self.send_control(ControlSignal::Unregister),
            EndpointRole::Service => self.send_control(ControlSignal::Shutdown),
        }
    }

    /// Process one inbound frame.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<Inbound> {
        let inbound = self.dispatcher.dispatch(frame).await?;
        if self.role == EndpointRole::Service && inbound == Inbound::Control(ControlSignal::Register)
        {
            if let Err(e) = self.send_control(ControlSignal::Ready) {
                tracing::warn!(error = %e, "failed to answer register");
            }
        }
        Some(inbound)
    }

    /// The dispatch worker. Drains `inbound` until shutdown or until either
    /// channel closes.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Bytes>,
        events: mpsc::UnboundedSender<Inbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        tracing::info!(role = ?self.role, "endpoint dispatch worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(role = ?self.role, "endpoint shutting down");
                    return Ok(());
                }

                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        tracing::info!(role = ?self.role, "inbound channel closed");
                        return Ok(());
                    };
                    let Some(event) = self.handle_frame(&frame).await else {
                        continue;
                    };
                    if events.send(event).is_err() {
                        tracing::info!(role = ?self.role, "event consumer gone, stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}
