//! Sender-side bookkeeping: every transmitted slice, until acknowledged.
//!
//! `message_id → (slice_index → Parcel)` behind one lock. Acks remove
//! entries; a message is settled once its map is gone. Every removal wakes
//! the senders waiting on `notified()`.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};

use shuttle_core::{MessageAck, MessageId, Parcel, SliceAck};

#[derive(Default)]
pub struct SendRecord {
    pending: Mutex<HashMap<MessageId, BTreeMap<u32, Parcel>>>,
    changed: Notify,
}

impl SendRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache slices of `message_id` before any of them goes out.
    /// Parcels without slice metadata are ignored.
    pub async fn insert(&self, message_id: MessageId, parcels: &[Parcel]) {
        let mut pending = self.pending.lock().await;
        let slices = pending.entry(message_id).or_default();
        for parcel in parcels {
            if let Some(info) = parcel.slice {
                slices.insert(info.index, parcel.clone());
            }
        }
    }

    /// Drop one acknowledged slice. Returns false if it was already gone.
    pub async fn ack_slice(&self, ack: &SliceAck) -> bool {
        let removed = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(&ack.message_id) {
                Some(slices) => {
                    let removed = slices.remove(&ack.slice_index).is_some();
                    if slices.is_empty() {
                        pending.remove(&ack.message_id);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Drop every slice of an acknowledged message.
    pub async fn ack_message(&self, ack: &MessageAck) -> bool {
        let removed = self.pending.lock().await.remove(&ack.message_id).is_some();
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Give up on a message. Returns how many slices were still unacknowledged.
    pub async fn forget(&self, message_id: &MessageId) -> usize {
        let dropped = self
            .pending
            .lock()
            .await
            .remove(message_id)
            .map(|slices| slices.len())
            .unwrap_or(0);
        if dropped > 0 {
            self.changed.notify_waiters();
        }
        dropped
    }

    pub async fn is_settled(&self, message_id: &MessageId) -> bool {
        !self.pending.lock().await.contains_key(message_id)
    }

    /// Unacknowledged slices of a message, in index order.
    #[cfg(test)]
    pub(crate) async fn outstanding(&self, message_id: &MessageId) -> Vec<Parcel> {
        self.pending
            .lock()
            .await
            .get(message_id)
            .map(|slices| slices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Flag every unacknowledged slice as resent and return them, in index order.
    pub async fn take_for_resend(&self, message_id: &MessageId) -> Vec<Parcel> {
        let mut pending = self.pending.lock().await;
        let Some(slices) = pending.get_mut(message_id) else {
            return Vec::new();
        };
        slices
            .values_mut()
            .map(|parcel| {
                parcel.resent = true;
                parcel.clone()
            })
            .collect()
    }

    /// Messages with at least one unacknowledged slice.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Resolves on the next removal. The future registers as soon as it is
    /// created: create it first, then check `is_settled`, then await.
    pub fn notified(&self) -> Notified<'_> {
        self.changed.notified()
    }
}
