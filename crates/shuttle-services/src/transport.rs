//! The one-way send primitive the core sits on.
//!
//! A `RawTransport` moves one frame at a time, best effort, up to a hard
//! size ceiling. It never blocks: a frame it cannot move right now is a
//! dropped unit, recovered by the retry coordinator. An `Err` means the
//! channel itself is unusable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use shuttle_core::Parcel;

pub trait RawTransport: Send + Sync + 'static {
    /// Hand one encoded parcel to the peer.
    fn send_raw(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Hard ceiling of one frame, header included.
    fn max_frame_len(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer endpoint is gone")]
    PeerGone,

    #[error("frame of {len} bytes exceeds the {max}-byte transport ceiling")]
    FrameTooLarge { len: usize, max: usize },

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Loopback ──────────────────────────────────────────────────────────────────

/// Decides whether a parcel is silently lost in transit.
pub type DropFilter = Box<dyn FnMut(&Parcel) -> bool + Send>;

/// In-process transport: frames go straight into the peer's inbound queue.
///
/// Used to run both endpoints in one process. A drop filter simulates a
/// lossy channel.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    max_frame_len: usize,
    filter: Mutex<Option<DropFilter>>,
    sent: AtomicUsize,
    dropped: AtomicUsize,
}

/// Two connected transports and the inbound queues they deliver into.
/// Frames sent on `.0.0` arrive on `.1.1`, and the other way around.
pub fn loopback_pair(
    max_frame_len: usize,
) -> (
    (LoopbackTransport, mpsc::UnboundedReceiver<Bytes>),
    (LoopbackTransport, mpsc::UnboundedReceiver<Bytes>),
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (LoopbackTransport::new(b_tx, max_frame_len), a_rx),
        (LoopbackTransport::new(a_tx, max_frame_len), b_rx),
    )
}

impl LoopbackTransport {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>, max_frame_len: usize) -> Self {
        Self {
            tx,
            max_frame_len,
            filter: Mutex::new(None),
            sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Install a filter; every frame for which it returns true is lost.
    pub fn set_drop_filter(&self, filter: impl FnMut(&Parcel) -> bool + Send + 'static) {
        if let Ok(mut slot) = self.filter.lock() {
            *slot = Some(Box::new(filter));
        }
    }

    pub fn clear_drop_filter(&self) {
        if let Ok(mut slot) = self.filter.lock() {
            *slot = None;
        }
    }

    /// Frames accepted, including the ones the filter dropped.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn should_drop(&self, frame: &[u8]) -> bool {
        let Ok(mut slot) = self.filter.lock() else {
            return false;
        };
        let Some(filter) = slot.as_mut() else {
            return false;
        };
        match Parcel::decode(frame) {
            Ok(parcel) => filter(&parcel),
            Err(_) => false,
        }
    }
}

impl RawTransport for LoopbackTransport {
    fn send_raw(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        if self.tx.is_closed() {
            return Err(TransportError::PeerGone);
        }
        self.sent.fetch_add(1, Ordering::Relaxed);

        if self.should_drop(frame) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(len = frame.len(), "loopback dropped frame");
            return Ok(());
        }

        self.tx
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| TransportError::PeerGone)
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}
