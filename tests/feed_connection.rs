//! Connection manager against a local WebSocket server.

use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::{
    accept_async, accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};

use ltp_recorder::{
    aggregator::Aggregator,
    feed::{
        envelope::Envelope, ConnectionConfig, ConnectionManager, ConnectionState, SessionConfig,
        StaticToken, Tick,
    },
    registry::{InstrumentMeta, SubscriptionRegistry},
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn registry() -> Arc<SubscriptionRegistry> {
    Arc::new(SubscriptionRegistry::new(vec![
        InstrumentMeta::new(1000, 1, "Alpha Ltd"),
        InstrumentMeta::new(2000, 1, "Beta Corp"),
    ]))
}

fn session(reconnect: bool) -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
        reconnect,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        ..SessionConfig::default()
    }
}

fn manager(
    url: String,
    session: SessionConfig,
    registry: Arc<SubscriptionRegistry>,
    aggregator: Arc<Aggregator>,
) -> ConnectionManager {
    ConnectionManager::new(
        ConnectionConfig {
            feed_url: url,
            session,
        },
        registry,
        Arc::new(StaticToken::new("test-token")),
        aggregator,
    )
}

fn frame(token: u32, price: u32) -> Vec<u8> {
    Tick {
        mode: 1,
        exchange_code: 1,
        instrument_token: token,
        last_traded_price: price,
        last_traded_time: 1_700_000_000,
        last_traded_qty: 10,
    }
    .to_bytes()
    .to_vec()
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

#[tokio::test]
async fn test_subscribe_once_dispatch_heartbeat_and_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let request_uri = Arc::new(Mutex::new(None::<String>));
    let uri_slot = request_uri.clone();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let capture_uri = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *uri_slot.lock() = Some(req.uri().to_string());
            Ok(resp)
        };
        let mut ws = accept_hdr_async(stream, capture_uri).await.unwrap();

        let mut texts = Vec::new();
        match ws.next().await {
            Some(Ok(Message::Text(text))) => texts.push(text),
            other => panic!("expected subscription, got {other:?}"),
        }

        ws.send(Message::Text(r#"{"status":"subscribed"}"#.into())).await.unwrap();
        ws.send(Message::Binary(frame(1000, 15075))).await.unwrap();
        ws.send(Message::Binary(frame(1000, 15080)[..10].to_vec())).await.unwrap();
        ws.send(Message::Binary(frame(2000, 990))).await.unwrap();

        let heartbeat = Envelope::heartbeat().to_json();
        let mut heartbeats = 0;
        while heartbeats < 2 {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text == heartbeat {
                        heartbeats += 1;
                    }
                    texts.push(text);
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended early: {other:?}"),
            }
        }

        ws.send(normal_close()).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
        texts
    });

    let registry = registry();
    let aggregator = Aggregator::new(registry.clone(), None, 64);
    let manager = manager(
        format!("ws://{addr}/ws/v1/feeds"),
        session(true),
        registry.clone(),
        aggregator.clone(),
    );

    let result = tokio::time::timeout(TEST_TIMEOUT, manager.run())
        .await
        .expect("run timed out");
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(manager.state(), ConnectionState::Closed);

    let texts = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("server timed out")
        .unwrap();

    // Exactly one subscription, first, covering every registered instrument
    let subscribe = Envelope::subscribe(&registry).to_json();
    assert_eq!(texts[0], subscribe);
    assert_eq!(texts.iter().filter(|t| **t == subscribe).count(), 1);
    assert_eq!(
        request_uri.lock().as_deref(),
        Some("/ws/v1/feeds?token=test-token")
    );

    // Two valid frames buffered, the short one dropped
    let stats = aggregator.stats().snapshot();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(aggregator.pending(), 2);

    let metrics = manager.session().metrics().snapshot();
    assert_eq!(metrics.subscriptions_sent, 1);
    assert_eq!(metrics.text_frames_ignored, 1);
    assert!(metrics.heartbeats_sent >= 2);

    // No heartbeats once the connection is closed
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        manager.session().metrics().snapshot().heartbeats_sent,
        metrics.heartbeats_sent
    );
}

#[tokio::test]
async fn test_fault_without_reconnect_is_terminal_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        // Drop without a close frame
    });

    let registry = registry();
    let aggregator = Aggregator::new(registry.clone(), None, 64);
    let manager = manager(format!("ws://{addr}"), session(false), registry, aggregator);

    let result = tokio::time::timeout(TEST_TIMEOUT, manager.run())
        .await
        .expect("run timed out");

    assert!(result.is_err());
    assert_eq!(manager.state(), ConnectionState::Error);
    assert_eq!(manager.session().metrics().snapshot().reconnects, 0);
}

#[tokio::test]
async fn test_reconnect_resubscribes_after_fault() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut subscriptions = Vec::new();

        // First connection drops abruptly after the subscription
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            subscriptions.push(text);
        }
        drop(ws);

        // Second connection closes normally
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            subscriptions.push(text);
        }
        ws.send(Message::Binary(frame(2000, 5))).await.unwrap();
        ws.send(normal_close()).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}

        subscriptions
    });

    let registry = registry();
    let aggregator = Aggregator::new(registry.clone(), None, 64);
    let manager = manager(
        format!("ws://{addr}"),
        session(true),
        registry.clone(),
        aggregator.clone(),
    );

    let result = tokio::time::timeout(TEST_TIMEOUT, manager.run())
        .await
        .expect("run timed out");
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(manager.state(), ConnectionState::Closed);

    let subscriptions = server.await.unwrap();
    let expected = Envelope::subscribe(&registry).to_json();
    assert_eq!(subscriptions, vec![expected.clone(), expected]);

    let metrics = manager.session().metrics().snapshot();
    assert_eq!(metrics.subscriptions_sent, 2);
    assert_eq!(metrics.reconnects, 1);
    assert_eq!(metrics.connects_succeeded, 2);
    assert_eq!(aggregator.pending(), 1);
}

#[tokio::test]
async fn test_connect_failures_exhaust_attempts() {
    // Reserve a port, then free it so connects are refused
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let registry = registry();
    let aggregator = Aggregator::new(registry.clone(), None, 64);
    let config = SessionConfig {
        max_reconnect_attempts: Some(2),
        ..session(true)
    };
    let manager = manager(format!("ws://{addr}"), config, registry, aggregator);

    let result = tokio::time::timeout(TEST_TIMEOUT, manager.run())
        .await
        .expect("run timed out");

    assert!(result.is_err());
    assert_eq!(manager.state(), ConnectionState::Error);

    let metrics = manager.session().metrics().snapshot();
    assert_eq!(metrics.connects_attempted, 3);
    assert_eq!(metrics.connects_succeeded, 0);
    assert_eq!(metrics.subscriptions_sent, 0);
}
