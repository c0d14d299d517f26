use shuttle_core::config::TransportSettings;
use shuttle_core::Opcode;
use shuttle_services::{SendError, TransportError};
use tokio::time::Instant;

use crate::fault::*;
use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Retry — lost slices, lost acks, total loss
// ══════════════════════════════════════════════════════════════════════════════

/// One slice lost once: resent after one interval, send completes before two.
#[tokio::test(start_paused = true)]
async fn test_lost_slice_is_resent_within_two_intervals() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    pair.service_link.set_drop_filter(drop_slice_once(1));
    let text = sample_text(1, 48);
    let text = format!("{text}{text}");

    let start = Instant::now();
    let delivered = pair.service.send_text(text.clone()).await?;
    let elapsed = start.elapsed();

    assert!(elapsed >= retry_interval(), "resend waited for the timer");
    assert!(elapsed < retry_interval() * 2, "took {elapsed:?}");
    assert_eq!(delivered.resent, 1, "only the missing slice goes again");
    assert_eq!(pair.service_link.dropped(), 1);

    assert_eq!(next_message(&mut pair.engine_events).await?.as_text()?, text);
    assert!(settle_quietly(&mut pair.engine_events).await.is_none());
    assert_eq!(pair.service.stats().snapshot().parcels_resent, 1);
    Ok(())
}

/// A lost slice-ack with the whole-message ack also lost: the sender resends
/// that slice, the receiver re-acks it and does not deliver again.
#[tokio::test(start_paused = true)]
async fn test_late_duplicate_is_acked_but_not_redelivered() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    pair.engine_link.set_drop_filter(any_of(
        drop_slice_ack_once(2),
        drop_opcode(Opcode::MessageAck),
    ));
    let text = sample_text(2, 100);

    let delivered = pair.service.send_text(text.clone()).await?;
    assert_eq!(delivered.slices, 7);
    assert_eq!(delivered.resent, 1);

    assert_eq!(next_message(&mut pair.engine_events).await?.as_text()?, text);
    assert!(
        settle_quietly(&mut pair.engine_events).await.is_none(),
        "message delivered twice"
    );
    assert_eq!(pair.engine.stats().snapshot().messages_delivered, 1);
    Ok(())
}

/// Whole-message acks alone settle the sender when every slice-ack is lost.
#[tokio::test(start_paused = true)]
async fn test_message_ack_alone_settles_the_sender() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    pair.engine_link.set_drop_filter(drop_opcode(Opcode::SliceAck));

    let delivered = pair.service.send_text(sample_text(4, 300)).await?;
    assert_eq!(delivered.resent, 0);
    assert_eq!(pair.service.in_flight().await, 0);
    next_message(&mut pair.engine_events).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_total_loss_exhausts_retries() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    pair.service_link.set_drop_filter(black_hole());

    let start = Instant::now();
    let err = pair
        .service
        .send_text(sample_text(5, 80))
        .await
        .expect_err("nothing can arrive");

    match err {
        SendError::RetriesExhausted {
            attempts,
            outstanding,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(outstanding, 5);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(start.elapsed() >= retry_interval() * 4);
    assert_eq!(pair.service.in_flight().await, 0, "record cleared on give-up");
    assert_eq!(pair.service.stats().snapshot().send_failures, 1);
    assert!(settle_quietly(&mut pair.engine_events).await.is_none());
    Ok(())
}

/// A periodically lossy link in both directions still delivers every
/// message exactly once when retries are unbounded.
#[tokio::test(start_paused = true)]
async fn test_lossy_link_converges() -> Result<()> {
    let mut settings = small_settings();
    settings.max_retries = 0;
    let mut pair = Pair::start(&settings)?;
    pair.service_link.set_drop_filter(drop_every_nth(3));
    pair.engine_link.set_drop_filter(drop_every_nth(4));

    let texts: Vec<String> = (0..5).map(|i| sample_text(i, 120 + i as usize * 20)).collect();
    for text in &texts {
        pair.service.send_text(text.clone()).await?;
    }

    for text in &texts {
        assert_eq!(next_message(&mut pair.engine_events).await?.as_text()?, text.as_str());
    }
    assert!(settle_quietly(&mut pair.engine_events).await.is_none());
    assert!(pair.service.stats().snapshot().parcels_resent > 0);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Slow assemblies — receive buffers versus the retry timer
// ══════════════════════════════════════════════════════════════════════════════

/// Two retry intervals of patience on the receiver, unbounded retries.
fn impatient_settings() -> TransportSettings {
    TransportSettings {
        max_retries: 0,
        assembly_timeout_secs: 2,
        ..small_settings()
    }
}

/// The message is in flight longer than the assembly timeout, but one
/// resent slice lands every interval, so the buffer survives.
#[tokio::test(start_paused = true)]
async fn test_resent_slices_keep_a_slow_assembly_alive() -> Result<()> {
    let mut pair = Pair::start(&impatient_settings())?;
    pair.service_link.set_drop_filter(any_of(
        any_of(drop_slice_times(1, 3), drop_slice_times(2, 1)),
        drop_slice_times(3, 2),
    ));
    let text = sample_text(8, 96);

    let start = Instant::now();
    let delivered = pair.service.send_text(text.clone()).await?;
    assert!(start.elapsed() >= retry_interval() * 3);
    assert_eq!(delivered.resent, 6, "3 + 2 + 1 over three rounds");

    assert_eq!(next_message(&mut pair.engine_events).await?.as_text()?, text);
    Ok(())
}

/// Once the receiver gives up on a partial message it refuses the rest of
/// it, so the sender keeps retrying instead of reporting success.
#[tokio::test(start_paused = true)]
async fn test_evicted_message_is_never_reported_delivered() -> Result<()> {
    let mut pair = Pair::start(&impatient_settings())?;
    pair.service_link.set_drop_filter(drop_slice_times(1, 3));

    let service = pair.service.clone();
    let send = tokio::spawn(async move { service.send_text(sample_text(9, 96)).await });

    tokio::time::sleep(retry_interval() * 30).await;
    assert!(!send.is_finished(), "nothing may settle the evicted message");
    assert_eq!(pair.service.in_flight().await, 1);
    assert_eq!(pair.engine.stats().snapshot().messages_delivered, 0);
    assert!(pair.engine_events.try_recv().is_err());

    send.abort();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gone_peer_fails_the_send_at_once() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    pair.stop_workers().await?;

    let start = Instant::now();
    let err = pair
        .service
        .send_text(sample_text(6, 200))
        .await
        .expect_err("the engine's queue is closed");

    assert!(matches!(err, SendError::Transport(TransportError::PeerGone)));
    assert!(start.elapsed() < retry_interval());
    assert_eq!(pair.service.in_flight().await, 0);
    Ok(())
}
