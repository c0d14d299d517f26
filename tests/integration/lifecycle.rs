use shuttle_core::ControlSignal;
use shuttle_services::RawTransport;

use crate::*;

#[tokio::test(start_paused = true)]
async fn test_engine_registers_and_service_answers_ready() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;

    pair.engine.announce()?;
    assert_eq!(next_control(&mut pair.service_events).await?, ControlSignal::Register);
    assert_eq!(next_control(&mut pair.service_events).await?, ControlSignal::Running);
    assert_eq!(next_control(&mut pair.engine_events).await?, ControlSignal::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retire_signals_follow_the_role() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;

    pair.service.announce()?;
    assert_eq!(next_control(&mut pair.engine_events).await?, ControlSignal::Ready);

    pair.engine.retire()?;
    assert_eq!(next_control(&mut pair.service_events).await?, ControlSignal::Unregister);

    pair.service.retire()?;
    assert_eq!(next_control(&mut pair.engine_events).await?, ControlSignal::Shutdown);
    Ok(())
}

/// Control traffic is never acknowledged and never waits on the timer.
#[tokio::test(start_paused = true)]
async fn test_control_signals_are_fire_and_forget() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    let sent_before = pair.engine_link.sent();

    pair.service.send_control(ControlSignal::Ready)?;
    next_control(&mut pair.engine_events).await?;

    assert_eq!(pair.engine_link.sent(), sent_before, "engine sent nothing back");
    assert_eq!(pair.service.in_flight().await, 0);
    Ok(())
}

/// Garbage on the wire is dropped and the link keeps working.
#[tokio::test(start_paused = true)]
async fn test_malformed_frames_do_not_disturb_traffic() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;

    pair.service_link.send_raw(&[0xde, 0xad, 0xbe, 0xef])?;
    pair.service_link.send_raw(&[0u8; 64])?;

    let text = sample_text(7, 150);
    pair.service.send_text(text.clone()).await?;
    assert_eq!(next_message(&mut pair.engine_events).await?.as_text()?, text);
    assert_eq!(pair.engine.stats().snapshot().parcels_rejected, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_workers_stop_on_shutdown() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    pair.engine.announce()?;
    next_control(&mut pair.service_events).await?;

    pair.stop_workers().await?;
    let mut leftover = 0;
    while next_event(&mut pair.service_events).await.is_ok() {
        leftover += 1;
    }
    assert!(leftover <= 1, "only Running may still be queued");
    Ok(())
}
