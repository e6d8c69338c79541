mod common;

use common::MockConnector;
use live_voice::{ConnectionStatus, Coordinator, LiveEvent, SessionConfig, DISCONNECT_TIMEOUT};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

fn drain_errors(rx: &mut broadcast::Receiver<LiveEvent>) -> Vec<String> {
    let mut errors = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LiveEvent::Error(message) = event {
            errors.push(message);
        }
    }
    errors
}

#[tokio::test]
async fn concurrent_disconnects_share_one_teardown() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());

    coordinator.connect(None).await.unwrap();
    let transport = connector.latest();

    let mut waiters = Vec::new();
    for _ in 0..5 {
        let coordinator = coordinator.clone();
        waiters.push(tokio::spawn(async move { coordinator.disconnect().await }));
    }
    for waiter in waiters {
        tokio::time::timeout(DISCONNECT_TIMEOUT + Duration::from_secs(1), waiter)
            .await
            .expect("disconnect caller hung")
            .unwrap();
    }

    assert_eq!(transport.close_calls(), 1);
    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn disconnect_during_inflight_connect_leaves_nothing_connected() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());
    let release = connector.hold_next_connect();

    let pending = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.connect(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.status(), ConnectionStatus::Connecting);

    // resolves promptly: with no transport yet there is no close to wait for
    tokio::time::timeout(Duration::from_secs(1), coordinator.disconnect())
        .await
        .expect("disconnect caller hung");

    release.send(()).unwrap();
    assert!(pending.await.unwrap().is_err());
    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
    assert_eq!(connector.latest().close_calls(), 1);
}

#[tokio::test]
async fn disconnect_when_disconnected_touches_no_transport() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());

    tokio::time::timeout(Duration::from_millis(100), coordinator.disconnect())
        .await
        .expect("resolved immediately");
    assert_eq!(connector.connect_calls(), 0);
}

#[tokio::test]
async fn connect_is_a_no_op_when_already_connected() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());

    coordinator.connect(None).await.unwrap();
    coordinator.connect(None).await.unwrap();
    assert_eq!(connector.connect_calls(), 1);
}

#[tokio::test]
async fn grounding_accumulates_in_order_and_resets_on_reconnect() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());

    coordinator.connect(None).await.unwrap();
    let transport = connector.latest();

    transport
        .push_frame(
            r#"{"serverContent":{
                "groundingMetadata":{"groundingChunks":[{"web":{"uri":"https://a","title":"A"}}]},
                "modelTurn":{"parts":[{"text":"one"}]}}}"#,
        )
        .await;
    transport
        .push_frame(
            r#"{"serverContent":{
                "groundingMetadata":{"groundingChunks":[
                    {"web":{"uri":"https://b","title":"B"}},
                    {"web":{"uri":"https://a","title":"A"}}
                ]},
                "modelTurn":{"parts":[{"text":"two"}]}}}"#,
        )
        .await;

    wait_until(|| coordinator.grounding().len() == 3).await;
    let uris: Vec<_> = coordinator.grounding().into_iter().map(|r| r.uri).collect();
    // arrival order preserved, duplicates kept for the presentation layer
    assert_eq!(uris, vec!["https://a", "https://b", "https://a"]);

    coordinator.disconnect().await;
    coordinator.connect(None).await.unwrap();
    assert!(coordinator.grounding().is_empty());
}

#[tokio::test]
async fn config_change_reconnects_exactly_once_with_new_config() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());
    coordinator.set_config(SessionConfig::new().with_voice("Aoede"));

    coordinator.connect(None).await.unwrap();
    let first = connector.latest();
    let mut events = coordinator.events();

    coordinator
        .update_config(SessionConfig::new().with_voice("Puck"))
        .await;

    assert_eq!(first.close_calls(), 1);
    assert_eq!(connector.connect_calls(), 2);
    assert_eq!(coordinator.status(), ConnectionStatus::Connected);

    let second = connector.latest();
    let setup: Value = serde_json::from_str(&second.sent()[0]).unwrap();
    assert_eq!(
        setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
            ["voiceName"],
        "Puck"
    );
    assert!(drain_errors(&mut events).is_empty());
}

#[tokio::test]
async fn unchanged_config_triggers_no_reconnect() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());
    coordinator.set_config(SessionConfig::new().with_voice("Aoede"));

    coordinator.connect(None).await.unwrap();
    coordinator
        .update_config(SessionConfig::new().with_voice("Aoede"))
        .await;

    assert_eq!(connector.connect_calls(), 1);
    assert_eq!(connector.latest().close_calls(), 0);
}

#[tokio::test]
async fn config_edit_during_reconnect_still_gets_applied() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());
    coordinator.set_config(SessionConfig::new().with_voice("Aoede"));
    coordinator.connect(None).await.unwrap();

    // hold the reconnect triggered by the first edit mid-open
    let release = connector.hold_next_connect();
    let reconnecting = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.update_config(SessionConfig::new().with_voice("Puck")).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // second edit lands while the reconnect is in flight
    coordinator.update_config(SessionConfig::new().with_voice("Kore")).await;
    release.send(()).unwrap();
    reconnecting.await.unwrap();

    assert_eq!(coordinator.status(), ConnectionStatus::Connected);
    assert_eq!(coordinator.config().voice.as_deref(), Some("Kore"));
    let setup: Value = serde_json::from_str(&connector.latest().sent()[0]).unwrap();
    assert_eq!(
        setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
            ["voiceName"],
        "Kore"
    );
}

#[tokio::test]
async fn reconnect_failure_surfaces_as_error_event() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());
    coordinator.set_config(SessionConfig::new().with_voice("Aoede"));

    coordinator.connect(None).await.unwrap();
    let mut events = coordinator.events();

    connector.fail_next_connect();
    coordinator
        .update_config(SessionConfig::new().with_voice("Puck"))
        .await;

    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
    let errors = drain_errors(&mut events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("reconnect failed"));
}

#[tokio::test]
async fn override_config_wins_and_becomes_the_held_config() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());
    coordinator.set_config(SessionConfig::new().with_voice("Aoede"));

    coordinator
        .connect(Some(SessionConfig::new().with_voice("Charon")))
        .await
        .unwrap();

    let setup: Value = serde_json::from_str(&connector.latest().sent()[0]).unwrap();
    assert_eq!(
        setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
            ["voiceName"],
        "Charon"
    );
    assert_eq!(coordinator.config().voice.as_deref(), Some("Charon"));
}

#[tokio::test]
async fn remote_close_resets_status_for_a_fresh_connect() {
    let connector = MockConnector::new();
    let coordinator = Coordinator::new(connector.clone());

    coordinator.connect(None).await.unwrap();
    connector.latest().push_closed(1006, "going away").await;

    wait_until(|| coordinator.status() == ConnectionStatus::Disconnected).await;
    coordinator.connect(None).await.unwrap();
    assert_eq!(connector.connect_calls(), 2);
}
