use std::collections::BTreeSet;

use bytes::Bytes;
use serde_json::json;

use shuttle_core::wire::{ENGINE_MESSAGE, SERVICE_MESSAGE};
use shuttle_core::{Opcode, PayloadKind, Properties};

use crate::*;

#[tokio::test(start_paused = true)]
async fn test_large_text_crosses_in_slices() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    let text = sample_text(0, 1000);

    let delivered = pair.service.send_text(text.clone()).await?;
    assert!(delivered.message_id.is_some());
    assert_eq!(delivered.slices, 63, "ceil(1000 / 16)");
    assert_eq!(delivered.resent, 0);

    let message = next_message(&mut pair.engine_events).await?;
    assert_eq!(message.opcode, Opcode::Data(SERVICE_MESSAGE));
    assert_eq!(message.kind, PayloadKind::Text);
    assert_eq!(message.as_text()?, text);
    assert_eq!(pair.service.in_flight().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_multibyte_text_survives_slice_boundaries() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    // Three-byte characters never line up with 16-byte slices.
    let text = "€→✓".repeat(40);

    pair.engine.send_text(text.clone()).await?;
    let message = next_message(&mut pair.service_events).await?;
    assert_eq!(message.opcode, Opcode::Data(ENGINE_MESSAGE));
    assert_eq!(message.as_text()?, text);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_property_set_round_trips() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    let mut properties = Properties::new();
    properties.insert("command".into(), json!("dump_hierarchy"));
    properties.insert("depth".into(), json!(12));
    properties.insert(
        "filters".into(),
        json!({ "classes": ["Button", "TextView"], "visible_only": true }),
    );

    let delivered = pair.engine.send_properties(&properties).await?;
    assert!(delivered.slices > 1);

    let message = next_message(&mut pair.service_events).await?;
    assert_eq!(message.kind, PayloadKind::Properties);
    assert_eq!(message.to_properties()?, properties);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exact_multiple_of_slice_size() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    let payload: Vec<u8> = (0..160u8).collect();

    let delivered = pair.service.send_bytes(payload.clone()).await?;
    assert_eq!(delivered.slices, 10, "no trailing empty slice");

    let message = next_message(&mut pair.engine_events).await?;
    assert_eq!(message.kind, PayloadKind::Bytes);
    assert_eq!(message.payload, Bytes::from(payload));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_small_and_empty_messages_go_unsliced() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;

    let at_threshold = sample_text(3, small_settings().max_single_parcel_bytes);
    let delivered = pair.service.send_text(at_threshold.clone()).await?;
    assert_eq!(delivered.message_id, None);
    assert_eq!(delivered.slices, 1);
    assert_eq!(next_message(&mut pair.engine_events).await?.as_text()?, at_threshold);

    let delivered = pair.service.send_text("").await?;
    assert_eq!(delivered.message_id, None);
    let empty = next_message(&mut pair.engine_events).await?;
    assert!(empty.is_empty());
    assert_eq!(empty.as_text()?, "");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sends_in_both_directions() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    let outbound: Vec<String> = (0..3).map(|i| sample_text(i, 200 + i as usize * 37)).collect();
    let inbound: Vec<String> = (3..5).map(|i| sample_text(i, 150 + i as usize * 11)).collect();

    let (s0, s1, s2, e0, e1) = tokio::join!(
        pair.service.send_text(outbound[0].clone()),
        pair.service.send_text(outbound[1].clone()),
        pair.service.send_text(outbound[2].clone()),
        pair.engine.send_text(inbound[0].clone()),
        pair.engine.send_text(inbound[1].clone()),
    );
    for result in [s0, s1, s2, e0, e1] {
        assert_eq!(result?.resent, 0);
    }

    let mut at_engine = BTreeSet::new();
    for _ in 0..outbound.len() {
        at_engine.insert(next_message(&mut pair.engine_events).await?.as_text()?.to_string());
    }
    let mut at_service = BTreeSet::new();
    for _ in 0..inbound.len() {
        at_service.insert(next_message(&mut pair.service_events).await?.as_text()?.to_string());
    }

    assert_eq!(at_engine, outbound.into_iter().collect::<BTreeSet<_>>());
    assert_eq!(at_service, inbound.into_iter().collect::<BTreeSet<_>>());
    assert!(settle_quietly(&mut pair.engine_events).await.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_messages_on_other_channels_keep_their_channel() -> Result<()> {
    let mut pair = Pair::start(&small_settings())?;
    let message = shuttle_core::LogicalMessage::text(pair.service.data_opcode(), sample_text(9, 90))
        .with_channel(7);

    pair.service.send(message.clone()).await?;
    let received = next_message(&mut pair.engine_events).await?;
    assert_eq!(received, message);
    Ok(())
}
