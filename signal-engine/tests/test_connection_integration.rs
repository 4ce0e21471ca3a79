use futures::{SinkExt, StreamExt};
use signal_engine::{
    ConnectionManager, ConnectionPhase, ConnectionStatus, InboundMessage, OutboundMessage,
    SignalAggregator, WebSocketConfig,
};
use std::time::Duration;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time::timeout,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};

const STEP: Duration = Duration::from_secs(5);

type ServerStream = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, WebSocketConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = WebSocketConfig::new(format!("ws://{addr}"))
        .with_refresh_interval(Duration::from_secs(60))
        .with_keepalive_interval(Duration::from_secs(60))
        .with_backoff(Duration::from_millis(50), Duration::from_millis(200));
    (listener, config)
}

async fn accept(listener: &TcpListener) -> ServerStream {
    let (stream, _) = timeout(STEP, listener.accept())
        .await
        .expect("client did not connect")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_text(ws: &mut ServerStream) -> String {
    loop {
        let message = timeout(STEP, ws.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return text.as_str().to_owned();
        }
    }
}

async fn wait_for_status(
    status_rx: &mut watch::Receiver<ConnectionStatus>,
    predicate: impl FnMut(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    timeout(STEP, status_rx.wait_for(predicate))
        .await
        .expect("timed out waiting for connection status")
        .unwrap()
        .clone()
}

#[tokio::test]
async fn test_normal_close_does_not_reconnect() {
    let (listener, config) = listen().await;
    let (mut manager, mut messages) = ConnectionManager::start(config).unwrap();
    let mut status_rx = manager.subscribe();

    let mut server = accept(&listener).await;
    assert_eq!(next_text(&mut server).await, r#"{"type":"get_latest"}"#);

    let data = r#"{"data":{"signals_by_market":{"NQ":{"signals":[
        {"direction":"Long","setup_name":"SMA 5/20","timeframe":"5m",
         "has_active_signal":true,"signal_strength":80},
        {"direction":"Long","setup_name":"MACD Convergence","timeframe":"15m",
         "has_active_signal":true,"signal_strength":60}
    ]}}}}"#;
    server.send(Message::text(data)).await.unwrap();
    server.send(Message::text(r#"{"type":"pong"}"#)).await.unwrap();
    server.send(Message::text("not json")).await.unwrap();
    server.send(Message::binary(vec![0xff, 0xfe, 0x00])).await.unwrap();
    server
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "shutdown".into(),
        }))
        .await
        .unwrap();

    let message = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    assert!(matches!(message, InboundMessage::Data(_)));

    let mut aggregator = SignalAggregator::default();
    let update = aggregator.process_message(message, chrono::Utc::now());
    assert!(update.snapshot_updated);
    let nq = aggregator.market("NQ").unwrap();
    assert!((nq.long.final_score - 53.75).abs() < 1e-9);

    let status = wait_for_status(&mut status_rx, |status| {
        status.state.phase == ConnectionPhase::Disconnected
            && status.counters.malformed_messages == 2
    })
    .await;
    assert_eq!(status.counters.pongs_received, 1);
    assert_eq!(status.counters.messages_forwarded, 1);
    assert_eq!(status.counters.reconnects_scheduled, 0);
    assert_eq!(status.state.attempt_count, 0);

    // Well past the reconnect backoff
    assert!(timeout(Duration::from_millis(500), listener.accept()).await.is_err());

    manager.dispose().await;
}

#[tokio::test]
async fn test_dropped_connection_reconnects_and_dispose_closes_normally() {
    let (listener, config) = listen().await;
    let (mut manager, mut messages) = ConnectionManager::start(config).unwrap();
    let mut status_rx = manager.subscribe();

    let mut first = accept(&listener).await;
    assert_eq!(next_text(&mut first).await, r#"{"type":"get_latest"}"#);
    drop(first);

    let mut second = accept(&listener).await;
    assert_eq!(next_text(&mut second).await, r#"{"type":"get_latest"}"#);

    let status = wait_for_status(&mut status_rx, |status| {
        status.state.phase == ConnectionPhase::Connected
            && status.counters.reconnects_scheduled == 1
    })
    .await;
    assert_eq!(status.state.attempt_count, 0);

    manager.dispose().await;

    let close = loop {
        let message = timeout(STEP, second.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended before close frame")
            .unwrap();
        if let Message::Close(frame) = message {
            break frame;
        }
    };
    assert_eq!(close.map(|frame| frame.code), Some(CloseCode::Normal));

    // Second dispose is a no-op
    manager.dispose().await;
    assert_eq!(manager.status().state.phase, ConnectionPhase::Disconnected);
    assert!(timeout(STEP, messages.recv()).await.unwrap().is_none());
    assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
}

#[tokio::test]
async fn test_timers_and_consumer_requests() {
    let (listener, config) = listen().await;
    let config = config
        .with_refresh_interval(Duration::from_millis(100))
        .with_keepalive_interval(Duration::from_millis(150));
    let (mut manager, _messages) = ConnectionManager::start(config).unwrap();

    let mut server = accept(&listener).await;
    assert_eq!(next_text(&mut server).await, r#"{"type":"get_latest"}"#);

    let mut saw_refresh = false;
    let mut saw_ping = false;
    while !(saw_refresh && saw_ping) {
        match next_text(&mut server).await.as_str() {
            r#"{"type":"get_latest"}"# => saw_refresh = true,
            r#"{"type":"ping"}"# => saw_ping = true,
            other => panic!("unexpected request {other}"),
        }
    }

    server.send(Message::text(r#"{"type":"pong"}"#)).await.unwrap();
    let mut status_rx = manager.subscribe();
    wait_for_status(&mut status_rx, |status| status.counters.pongs_received >= 1).await;

    manager.dispose().await;
    manager.send(OutboundMessage::Ping);
    assert_eq!(manager.status().counters.sends_while_disconnected, 0);
}

#[tokio::test]
async fn test_dispose_while_consumer_is_not_draining() {
    let (listener, config) = listen().await;
    let (mut manager, mut messages) =
        ConnectionManager::start(config.with_channel_buffer_size(1)).unwrap();
    let mut status_rx = manager.subscribe();

    let mut server = accept(&listener).await;
    assert_eq!(next_text(&mut server).await, r#"{"type":"get_latest"}"#);

    for _ in 0..5 {
        server.send(Message::text(r#"{"data":{}}"#)).await.unwrap();
    }

    // First message fills the channel, the second waits for capacity
    wait_for_status(&mut status_rx, |status| status.counters.messages_forwarded >= 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(STEP, manager.dispose())
        .await
        .expect("dispose blocked on a full message channel");
    assert_eq!(manager.status().state.phase, ConnectionPhase::Disconnected);

    let buffered = timeout(STEP, messages.recv()).await.unwrap();
    assert!(matches!(buffered, Some(InboundMessage::Data(_))));
    assert!(timeout(STEP, messages.recv()).await.unwrap().is_none());
}
