//! shuttled — one endpoint of a Shuttle channel over UDP.
//!
//! `shuttled [service|engine] [bind_addr] [peer_addr]`. Each stdin line is
//! sent to the peer as one message; a line holding a JSON object goes out
//! as a property set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use shuttle_core::config::ShuttleConfig;
use shuttle_core::{PayloadKind, Properties};
use shuttle_services::{Endpoint, Inbound};

mod udp;

use udp::UdpTransport;

type UdpEndpoint = Endpoint<UdpTransport>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ShuttleConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = ShuttleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ShuttleConfig::default()
    });

    let mut args = std::env::args().skip(1);
    if let Some(role) = args.next() {
        config.endpoint.role = role.parse().context("invalid role")?;
    }
    if let Some(bind) = args.next() {
        config.endpoint.bind_addr = bind;
    }
    if let Some(peer) = args.next() {
        config.endpoint.peer_addr = peer;
    }

    let role = config.endpoint.role;
    let bind_addr: SocketAddr = config
        .endpoint
        .bind_addr
        .parse()
        .context("invalid bind address")?;
    let peer_addr: SocketAddr = config
        .endpoint
        .peer_addr
        .parse()
        .context("invalid peer address")?;

    let socket = Arc::new(
        UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind endpoint socket")?,
    );
    tracing::info!(
        ?role,
        bind = %socket.local_addr()?,
        peer = %peer_addr,
        retry_interval_ms = config.transport.retry_interval_ms,
        max_retries = config.transport.max_retries,
        "shuttled starting"
    );

    let transport = Arc::new(UdpTransport::new(
        socket.clone(),
        peer_addr,
        config.transport.max_parcel_bytes,
    ));
    let endpoint = Arc::new(
        Endpoint::new(role, transport.clone(), &config.transport)
            .context("invalid transport settings")?,
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let receive_task = tokio::spawn(udp::receive_loop(
        socket,
        peer_addr,
        inbound_tx,
        shutdown_tx.subscribe(),
    ));

    let dispatch_task = tokio::spawn(endpoint.clone().run(
        inbound_rx,
        events_tx,
        shutdown_tx.subscribe(),
    ));

    let event_task = tokio::spawn(log_events(events_rx));

    // Stdin closing is not a reason to stop receiving.
    let _stdin_task = tokio::spawn(forward_stdin(endpoint.clone()));

    let stats_printer = {
        let endpoint = endpoint.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                endpoint.stats().print_stats();
                let dropped = transport.dropped();
                if dropped > 0 {
                    tracing::info!(dropped, "datagrams dropped by the socket");
                }
            }
        })
    };

    if let Err(e) = endpoint.announce() {
        tracing::warn!(error = %e, "announce failed");
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = receive_task        => tracing::error!("receive loop exited: {:?}", r),
        r = dispatch_task       => tracing::error!("dispatch worker exited: {:?}", r),
        r = event_task          => tracing::error!("event logger exited: {:?}", r),
        r = stats_printer       => tracing::error!("stats printer exited: {:?}", r),
    }

    if let Err(e) = endpoint.retire() {
        tracing::warn!(error = %e, "retire failed");
    }
    let _ = shutdown_tx.send(());

    Ok(())
}

/// Send stdin line by line, each one acknowledged before the next.
async fn forward_stdin(endpoint: Arc<UdpEndpoint>) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.is_empty() {
            continue;
        }
        let sent = match serde_json::from_str::<Properties>(&line) {
            Ok(properties) => endpoint.send_properties(&properties).await,
            Err(_) => endpoint.send_text(line).await.map_err(Into::into),
        };
        match sent {
            Ok(delivered) => tracing::info!(
                slices = delivered.slices,
                resent = delivered.resent,
                "message delivered"
            ),
            Err(e) => tracing::error!(error = %e, "message not delivered"),
        }
    }
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(event) = events.recv().await {
        match event {
            Inbound::Control(signal) => tracing::info!(?signal, "peer signal"),
            Inbound::Message(message) => match message.kind {
                PayloadKind::Text => match message.as_text() {
                    Ok(text) => tracing::info!(channel = message.channel, %text, "text message"),
                    Err(e) => tracing::warn!(error = %e, "undecodable text message"),
                },
                PayloadKind::Properties => match message.to_properties() {
                    Ok(properties) => tracing::info!(
                        channel = message.channel,
                        properties = %serde_json::Value::from(serde_json::Map::from_iter(properties)),
                        "property message"
                    ),
                    Err(e) => tracing::warn!(error = %e, "undecodable property message"),
                },
                PayloadKind::Bytes | PayloadKind::Empty => tracing::info!(
                    channel = message.channel,
                    bytes = message.len(),
                    "binary message"
                ),
            },
        }
    }
}
