//! UDP send primitive and receive loop.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use shuttle_services::{RawTransport, TransportError};

/// Datagram towards one fixed peer. Never blocks: a datagram the socket
/// cannot take right now is counted as lost and left to the retry timer.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    max_frame_len: usize,
    dropped: AtomicU64,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, max_frame_len: usize) -> Self {
        Self {
            socket,
            peer,
            max_frame_len,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RawTransport for UdpTransport {
    fn send_raw(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        match self.socket.try_send_to(frame, self.peer) {
            Ok(_) => Ok(()),
            // Peer not listening yet, or socket buffer full.
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::ConnectionRefused) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(peer = %self.peer, error = %e, "datagram dropped");
                Ok(())
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

/// Forward every datagram from `peer` into the endpoint's inbound queue.
pub async fn receive_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("receive loop shutting down");
                return Ok(());
            }

            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    // ICMP port unreachable from an earlier send.
                    Err(e) if e.kind() == ErrorKind::ConnectionRefused => continue,
                    Err(e) => return Err(e).context("recv_from failed"),
                };
                if from != peer {
                    tracing::debug!(%from, "datagram from unknown sender, discarding");
                    continue;
                }
                if inbound_tx.send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                    tracing::info!("dispatch worker gone, receive loop exiting");
                    return Ok(());
                }
            }
        }
    }
}
