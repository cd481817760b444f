//! Integration tests for the machine channel.
//!
//! These run the real connection loop against an in-process WebSocket
//! server on a loopback listener: no mocks on the client side, no
//! external network.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use floorlink::{ChannelConfig, ChannelEvent, ConnectionState, MachineChannel};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind a loopback listener and return it with the client URL.
async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let url = format!(
        "ws://{}/machine",
        listener.local_addr().expect("local addr")
    );
    (listener, url)
}

/// Drain channel events until `pred` matches, panicking on timeout.
async fn wait_for_event<F>(events: &mut floorlink::ChannelEvents, pred: F) -> ChannelEvent
where
    F: Fn(&ChannelEvent) -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for channel event")
}

fn test_config(url: &str) -> ChannelConfig {
    ChannelConfig::new(url)
        .reconnect_base_delay(Duration::from_millis(50))
        .reconnect_jitter(Duration::ZERO)
        .connect_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_state_image_command_and_clean_close() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");

        ws.send(Message::Text(
            r#"{"type":"state","payload":{"isCapturing":true,"spindleRpm":12000}}"#.into(),
        ))
        .await
        .expect("send state");
        ws.send(Message::Binary(vec![0xAA, 0xBB, 0xCC]))
            .await
            .expect("send image");

        // Wait for the client's command, then close cleanly
        let command = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("server expected command, got {other:?}"),
            }
        };
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "cycle done".into(),
        }))
        .await
        .expect("close");
        command
    });

    let (channel, mut events) = MachineChannel::connect(test_config(&url));
    let mut snapshot_rx = channel.watch_snapshot();

    wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::Connected { recovered: false })
    })
    .await;

    // Snapshot reflects the state envelope and the binary frame
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            {
                let snapshot = snapshot_rx.borrow();
                if snapshot.is_capturing && snapshot.image.is_some() {
                    assert_eq!(
                        snapshot.extra.get("spindleRpm"),
                        Some(&json!(12000)),
                        "unmodelled fields land in extra"
                    );
                    assert_eq!(
                        snapshot.image.as_ref().expect("image").bytes.as_ref(),
                        &[0xAA, 0xBB, 0xCC]
                    );
                    break;
                }
            }
            snapshot_rx.changed().await.expect("snapshot watch closed");
        }
    })
    .await
    .expect("snapshot never reflected server frames");

    channel
        .send("jog", &json!({"axis": "x", "mm": 5}))
        .expect("send command while open");

    // Clean close: Closed event, Closed state, no reconnect
    let event = wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Closed { .. })).await;
    assert_eq!(
        event,
        ChannelEvent::Closed {
            code: 1000,
            reason: "cycle done".to_string()
        }
    );

    let command = server.await.expect("server task");
    let command: serde_json::Value = serde_json::from_str(&command).expect("command is JSON");
    assert_eq!(command["type"], "jog");
    assert_eq!(command["payload"]["axis"], "x");

    // Still Closed a beat later: the clean close scheduled nothing
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_reconnects_after_abnormal_drop() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        // First connection: handshake, then drop with no close frame
        let (stream, _) = listener.accept().await.expect("accept first");
        let ws = accept_async(stream).await.expect("handshake first");
        drop(ws);

        // Second connection: stay up until the client goes away
        let (stream, _) = listener.accept().await.expect("accept second");
        let mut ws = accept_async(stream).await.expect("handshake second");
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (channel, mut events) = MachineChannel::connect(test_config(&url));

    wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::Connected { recovered: false })
    })
    .await;

    // The drop is abnormal: a retry is scheduled with attempt 1
    let event = wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::Reconnecting { .. })
    })
    .await;
    assert!(matches!(
        event,
        ChannelEvent::Reconnecting { attempt: 1, .. }
    ));

    // And the retry lands as a recovery
    wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::Connected { recovered: true })
    })
    .await;

    channel.close();
    server.await.expect("server task");
}

#[tokio::test]
async fn test_malformed_frame_does_not_disturb_channel() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");

        ws.send(Message::Text("{definitely not json".into()))
            .await
            .expect("send garbage");
        ws.send(Message::Text(
            r#"{"type":"unknownKind","payload":{"x":1}}"#.into(),
        ))
        .await
        .expect("send unknown");
        ws.send(Message::Text(
            r#"{"type":"state","payload":{"isAnalyzing":true}}"#.into(),
        ))
        .await
        .expect("send state");

        while let Some(Ok(_)) = ws.next().await {}
    });

    let (channel, mut events) = MachineChannel::connect(test_config(&url));
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Connected { .. })).await;

    // The valid frame behind the garbage still lands
    let mut snapshot_rx = channel.watch_snapshot();
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if snapshot_rx.borrow().is_analyzing {
                break;
            }
            snapshot_rx.changed().await.expect("snapshot watch closed");
        }
    })
    .await
    .expect("state frame after malformed frame never applied");

    assert!(channel.state().is_open());
    channel.close();
    server.await.expect("server task");
}

#[tokio::test]
async fn test_heartbeat_frames_flow_while_open() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");

        // Expect a PING liveness frame well within the test timeout
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&text).expect("liveness frame is JSON");
                    if value["type"] == "PING" {
                        return;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("server expected PING, got {other:?}"),
            }
        }
    });

    let config = test_config(&url).heartbeat_interval(Duration::from_millis(100));
    let (channel, mut events) = MachineChannel::connect(config);
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Connected { .. })).await;

    tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("no heartbeat observed")
        .expect("server task");
    channel.close();
}

#[tokio::test]
async fn test_log_and_alert_envelopes_surface_as_events() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");

        ws.send(Message::Text(
            r#"{"type":"log","payload":"vacuum pump primed","level":"info"}"#.into(),
        ))
        .await
        .expect("send log");
        ws.send(Message::Text(
            r#"{"type":"alert","payload":{"message":"bin nearly full"},"level":"warning"}"#.into(),
        ))
        .await
        .expect("send alert");

        while let Some(Ok(_)) = ws.next().await {}
    });

    let (channel, mut events) = MachineChannel::connect(test_config(&url));

    let log = wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Log { .. })).await;
    assert_eq!(
        log,
        ChannelEvent::Log {
            severity: floorlink::Severity::Info,
            message: "vacuum pump primed".to_string()
        }
    );

    let alert = wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Alert { .. })).await;
    assert_eq!(
        alert,
        ChannelEvent::Alert {
            severity: floorlink::Severity::Warning,
            message: "bin nearly full".to_string()
        }
    );

    channel.close();
    server.await.expect("server task");
}
