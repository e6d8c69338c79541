mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::MockConnector;
use live_voice::{ConnectionStatus, LiveClient, LiveEvent, MediaChunk, Part, SessionConfig};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_event(rx: &mut broadcast::Receiver<LiveEvent>) -> LiveEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if !matches!(event, LiveEvent::Log(_)) {
            return event;
        }
    }
}

async fn assert_no_event(rx: &mut broadcast::Receiver<LiveEvent>) {
    loop {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Err(_) => return,
            Ok(Ok(LiveEvent::Log(_))) => continue,
            Ok(event) => panic!("unexpected event: {event:?}"),
        }
    }
}

#[tokio::test]
async fn connect_sends_setup_and_publishes_open() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    let config = SessionConfig::new().with_voice("Aoede");
    client.connect(&config).await.unwrap();

    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert!(client.session_id().is_some());

    let sent = connector.latest().sent();
    assert_eq!(sent.len(), 1);
    let frame: Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(frame["setup"]["model"], "models/gemini-2.0-flash-exp");
    assert_eq!(
        frame["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
            ["voiceName"],
        "Aoede"
    );
}

#[tokio::test]
async fn second_connect_is_rejected_without_a_second_open() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    assert!(client.connect(&SessionConfig::new()).await.is_err());
    assert_eq!(connector.connect_calls(), 1);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn disconnect_during_inflight_connect_wins() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();
    let release = connector.hold_next_connect();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(&SessionConfig::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.status(), ConnectionStatus::Connecting);

    client.disconnect().await;
    release.send(()).unwrap();

    // the attempt fails, the fresh transport is closed again, and no open
    // event is published for it
    assert!(pending.await.unwrap().is_err());
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(connector.latest().close_calls(), 1);
    assert!(client.session_id().is_none());
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn setup_complete_then_audio_frame_scenario() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new().with_voice("A")).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    let transport = connector.latest();
    transport.push_frame(r#"{"setupComplete": {}}"#).await;
    assert!(matches!(next_event(&mut events).await, LiveEvent::SetupComplete));
    assert_eq!(client.status(), ConnectionStatus::Connected);

    let payload = BASE64.encode(vec![0u8; 480]);
    transport
        .push_frame(&format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[
                {{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{payload}"}}}}
            ]}}}}}}"#
        ))
        .await;

    match next_event(&mut events).await {
        LiveEvent::Audio(bytes) => assert_eq!(bytes.len(), 480),
        other => panic!("unexpected event: {other:?}"),
    }
    // no content event for an audio-only frame
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn events_from_one_frame_precede_the_next_frame() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    let transport = connector.latest();
    transport
        .push_frame(
            r#"{"serverContent":{"turnComplete":true,"modelTurn":{"parts":[{"text":"a"}]}}}"#,
        )
        .await;
    transport
        .push_frame(r#"{"serverContent":{"modelTurn":{"parts":[{"text":"b"}]}}}"#)
        .await;

    assert!(matches!(next_event(&mut events).await, LiveEvent::TurnComplete));
    match next_event(&mut events).await {
        LiveEvent::Content(parts) => assert_eq!(parts[0].text.as_deref(), Some("a")),
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut events).await {
        LiveEvent::Content(parts) => assert_eq!(parts[0].text.as_deref(), Some("b")),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn realtime_input_before_ready_is_dropped_silently() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    let transport = connector.latest();
    transport.set_open(false);

    client
        .send_realtime_input(vec![MediaChunk::audio_pcm(BASE64.encode([0u8; 16]), 16_000)])
        .await;

    // setup frame only, nothing queued, no error published
    assert_eq!(transport.sent().len(), 1);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn realtime_input_goes_out_in_order() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    client
        .send_realtime_input(vec![
            MediaChunk::audio_pcm("first".to_string(), 16_000),
            MediaChunk::audio_pcm("second".to_string(), 16_000),
        ])
        .await;

    let sent = connector.latest().sent();
    assert_eq!(sent.len(), 3);
    let first: Value = serde_json::from_str(&sent[1]).unwrap();
    let second: Value = serde_json::from_str(&sent[2]).unwrap();
    assert_eq!(first["realtimeInput"]["mediaChunks"][0]["data"], "first");
    assert_eq!(first["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");
    assert_eq!(second["realtimeInput"]["mediaChunks"][0]["data"], "second");
}

#[tokio::test]
async fn send_wraps_parts_as_a_single_turn() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    client.send(vec![Part::text("hello")], true).await;

    let sent = connector.latest().sent();
    let frame: Value = serde_json::from_str(&sent[1]).unwrap();
    assert_eq!(frame["clientContent"]["turnComplete"], true);
    assert_eq!(frame["clientContent"]["turns"][0]["role"], "user");
    assert_eq!(frame["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
}

#[tokio::test]
async fn empty_tool_response_never_hits_the_wire() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    client.send_tool_response(Vec::new()).await;
    assert_eq!(connector.latest().sent().len(), 1);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn remote_close_publishes_close_with_extracted_detail() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    connector.latest().push_closed(1011, "[INTERNAL ERROR] quota exhausted").await;

    match next_event(&mut events).await {
        LiveEvent::Close { code, reason, detail } => {
            assert_eq!(code, 1011);
            assert_eq!(reason, "[INTERNAL ERROR] quota exhausted");
            assert_eq!(detail.as_deref(), Some("quota exhausted"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn transport_error_publishes_error_and_drops_status() {
    let connector = MockConnector::new();
    let client = LiveClient::new(connector.clone());
    let mut events = client.events();

    client.connect(&SessionConfig::new()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, LiveEvent::Open));

    connector.latest().push_error("read failure").await;

    match next_event(&mut events).await {
        LiveEvent::Error(message) => assert!(message.contains("read failure")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
}
