//! Acknowledgment and retry coordinator.
//!
//! After every slice of a message is on the wire, the sender waits on the
//! send record's notify until the message settles. Each retry interval
//! without settlement retransmits the slices still outstanding, flagged as
//! resent. Acks for other messages wake the waiter but do not move its
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use shuttle_core::codec::CodecError;
use shuttle_core::config::TransportSettings;
use shuttle_core::{MessageId, Parcel};

use crate::send_record::SendRecord;
use crate::transport::{RawTransport, TransportError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Retransmission rounds before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl From<&TransportSettings> for RetryPolicy {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            interval: settings.retry_interval(),
            max_retries: settings.retry_limit(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(
        "message {message_id} unacknowledged after {attempts} retransmission rounds \
         ({outstanding} slices outstanding)"
    )]
    RetriesExhausted {
        message_id: MessageId,
        attempts: u32,
        outstanding: usize,
    },

    #[error("cannot frame message: {0}")]
    Codec(#[from] CodecError),
}

/// Outcome of one acknowledged send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// `None` for unsliced sends, which carry no id.
    pub message_id: Option<MessageId>,
    pub slices: usize,
    /// Parcels transmitted again after a timeout.
    pub resent: usize,
}

pub struct RetryCoordinator<T: RawTransport> {
    transport: Arc<T>,
    record: Arc<SendRecord>,
    policy: RetryPolicy,
}

impl<T: RawTransport> RetryCoordinator<T> {
    pub fn new(transport: Arc<T>, record: Arc<SendRecord>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            record,
            policy,
        }
    }

    pub fn record(&self) -> &Arc<SendRecord> {
        &self.record
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Encode and hand one parcel to the transport.
    pub fn transmit(&self, parcel: &Parcel) -> Result<(), TransportError> {
        self.transport.send_raw(&parcel.encode())
    }

    /// Record, transmit in index order, then block until every slice is
    /// acknowledged. A transport failure or exhausted retries clears the
    /// record before returning.
    ///
    /// Parcels that are not slices of `message_id` cannot be acknowledged;
    /// if that is all of them, they are transmitted once and nothing waits.
    pub async fn deliver(
        &self,
        message_id: MessageId,
        parcels: &[Parcel],
    ) -> Result<Delivered, SendError> {
        let ackable = parcels
            .iter()
            .any(|p| p.slice.is_some_and(|s| s.message_id == message_id));
        if !ackable {
            for parcel in parcels {
                self.transmit(parcel)?;
            }
            return Ok(Delivered {
                message_id: None,
                slices: parcels.len(),
                resent: 0,
            });
        }

        self.record.insert(message_id, parcels).await;

        for parcel in parcels {
            if let Err(e) = self.transmit(parcel) {
                self.abandon(&message_id).await;
                return Err(e.into());
            }
        }
        tracing::debug!(
            message_id = %message_id,
            slices = parcels.len(),
            "slices transmitted, awaiting acks"
        );

        let mut attempts = 0u32;
        let mut resent = 0usize;
        loop {
            let deadline = Instant::now() + self.policy.interval;
            if self.wait_until_settled(&message_id, deadline).await {
                tracing::debug!(
                    message_id = %message_id,
                    rounds = attempts,
                    "message acknowledged"
                );
                return Ok(Delivered {
                    message_id: Some(message_id),
                    slices: parcels.len(),
                    resent,
                });
            }

            if self.policy.max_retries.is_some_and(|max| attempts >= max) {
                let outstanding = self.record.forget(&message_id).await;
                tracing::warn!(
                    message_id = %message_id,
                    attempts,
                    outstanding,
                    "giving up on message"
                );
                return Err(SendError::RetriesExhausted {
                    message_id,
                    attempts,
                    outstanding,
                });
            }

            let again = self.record.take_for_resend(&message_id).await;
            attempts += 1;
            tracing::debug!(
                message_id = %message_id,
                attempt = attempts,
                slices = again.len(),
                "retry interval elapsed, resending"
            );
            for parcel in &again {
                if let Err(e) = self.transmit(parcel) {
                    self.abandon(&message_id).await;
                    return Err(e.into());
                }
            }
            resent += again.len();
        }
    }

    /// True once the message settles, false if `deadline` passes first.
    async fn wait_until_settled(&self, message_id: &MessageId, deadline: Instant) -> bool {
        loop {
            let notified = self.record.notified();
            if self.record.is_settled(message_id).await {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.record.is_settled(message_id).await;
            }
        }
    }

    async fn abandon(&self, message_id: &MessageId) {
        let dropped = self.record.forget(message_id).await;
        tracing::warn!(
            message_id = %message_id,
            dropped,
            "transport failed, message abandoned"
        );
    }
}
