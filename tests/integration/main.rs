//! Shuttle integration test harness.
//!
//! Every test wires a service and an engine endpoint back to back over the
//! in-process loopback transport, each with its own dispatch worker, and
//! drives them from the outside. Timer-driven tests run on tokio's paused
//! clock, so retry intervals elapse instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use shuttle_core::config::{EndpointRole, TransportSettings};
use shuttle_core::{ControlSignal, LogicalMessage, MAX_ACK_BODY};
use shuttle_services::{loopback_pair, Endpoint, Inbound, LoopbackTransport};

mod delivery;
mod fault;
mod lifecycle;
mod recovery;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a helper waits for an event before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Small parcels so modest payloads span many slices. The single-parcel
/// limit is as low as the widest ack allows.
pub fn small_settings() -> TransportSettings {
    TransportSettings {
        max_parcel_bytes: 512,
        max_single_parcel_bytes: MAX_ACK_BODY + 2,
        slice_size: 16,
        retry_interval_ms: 1_000,
        max_retries: 3,
        completed_history: 8,
        assembly_timeout_secs: 60,
    }
}

pub fn retry_interval() -> Duration {
    small_settings().retry_interval()
}

pub type LoopbackEndpoint = Endpoint<LoopbackTransport>;

/// A service and an engine talking to each other.
pub struct Pair {
    pub service: Arc<LoopbackEndpoint>,
    pub engine: Arc<LoopbackEndpoint>,
    /// What the service puts on the wire, for fault injection.
    pub service_link: Arc<LoopbackTransport>,
    /// What the engine puts on the wire, for fault injection.
    pub engine_link: Arc<LoopbackTransport>,
    pub service_events: mpsc::UnboundedReceiver<Inbound>,
    pub engine_events: mpsc::UnboundedReceiver<Inbound>,
    shutdown: broadcast::Sender<()>,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl Pair {
    pub fn start(settings: &TransportSettings) -> Result<Self> {
        let ((service_tx, service_rx), (engine_tx, engine_rx)) =
            loopback_pair(settings.max_parcel_bytes);
        let service_link = Arc::new(service_tx);
        let engine_link = Arc::new(engine_tx);

        let service = Arc::new(
            Endpoint::new(EndpointRole::Service, service_link.clone(), settings)
                .context("service endpoint")?,
        );
        let engine = Arc::new(
            Endpoint::new(EndpointRole::Engine, engine_link.clone(), settings)
                .context("engine endpoint")?,
        );

        let (shutdown, _) = broadcast::channel(1);
        let (service_events_tx, service_events) = mpsc::unbounded_channel();
        let (engine_events_tx, engine_events) = mpsc::unbounded_channel();
        let workers = vec![
            tokio::spawn(service.clone().run(
                service_rx,
                service_events_tx,
                shutdown.subscribe(),
            )),
            tokio::spawn(engine.clone().run(
                engine_rx,
                engine_events_tx,
                shutdown.subscribe(),
            )),
        ];

        Ok(Self {
            service,
            engine,
            service_link,
            engine_link,
            service_events,
            engine_events,
            shutdown,
            workers,
        })
    }

    /// Stop both dispatch workers and wait for them to exit.
    pub async fn stop_workers(&mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        for worker in self.workers.drain(..) {
            worker.await.context("dispatch worker panicked")??;
        }
        Ok(())
    }
}

/// Next complete message, skipping control signals.
pub async fn next_message(events: &mut mpsc::UnboundedReceiver<Inbound>) -> Result<LogicalMessage> {
    loop {
        match next_event(events).await? {
            Inbound::Message(message) => return Ok(message),
            Inbound::Control(_) => continue,
        }
    }
}

/// Next control signal; a data message first is a failure.
pub async fn next_control(events: &mut mpsc::UnboundedReceiver<Inbound>) -> Result<ControlSignal> {
    match next_event(events).await? {
        Inbound::Control(signal) => Ok(signal),
        Inbound::Message(message) => bail!("expected a control signal, got {message:?}"),
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Inbound>) -> Result<Inbound> {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .context("timed out waiting for an event")?
        .context("event channel closed")
}

/// Let queued frames drain, then report whether any event is left over.
pub async fn settle_quietly(events: &mut mpsc::UnboundedReceiver<Inbound>) -> Option<Inbound> {
    tokio::time::sleep(retry_interval() * 3).await;
    events.try_recv().ok()
}

/// `len` bytes of printable text, distinct per `seed`.
pub fn sample_text(seed: u8, len: usize) -> String {
    (0..len)
        .map(|i| char::from(b'a' + ((i + seed as usize) % 26) as u8))
        .collect()
}
