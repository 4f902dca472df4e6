mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use market_ws::testing::{HandlerEvent, MockTransport, RecordingHandler};
use market_ws::{ClientState, DisconnectReason, Generation, WebSocketError};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_connects_and_is_idempotent() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport.clone());

    assert_eq!(client.state(), ClientState::Disconnected);
    client.start().await.expect("start");
    let _server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    assert_eq!(expect_connected(&mut events).await, Generation::new(1));
    client
        .wait_for_state(ClientState::Connected, EVENT_TIMEOUT)
        .await
        .expect("connected");

    client.start().await.expect("second start");
    client.start().await.expect("third start");
    assert_quiet(&mut events, Duration::from_millis(100)).await;
    assert_eq!(transport.attempt_count(), 1);

    let (url, options) = transport.last_connect().expect("connect recorded");
    assert_eq!(url, "ws://mock.local/stream");
    assert!(options.proxy_url.is_none());
    assert!(options.tls.validate_certs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn double_stop_reports_one_disconnect() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport);

    client.start().await.expect("start");
    let mut server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    client.stop().await.expect("first stop");
    client.stop().await.expect("second stop");
    assert_eq!(client.state(), ClientState::Disconnected);

    match next_event(&mut events).await {
        HandlerEvent::Disconnected(DisconnectReason::Stopped) => {}
        other => panic!("expected Disconnected(Stopped), got {other:?}"),
    }
    assert_quiet(&mut events, Duration::from_millis(100)).await;

    tokio::time::timeout(EVENT_TIMEOUT, server.wait_closed())
        .await
        .expect("writer released");
    assert!(server.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_after_stop_fails_with_client_closed() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport);

    client.start().await.expect("start");
    let _server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;
    assert!(client.is_accepting());
    client.stop().await.expect("stop");
    assert!(!client.is_accepting());

    assert!(matches!(
        client.try_enqueue(Tick { seq: 1 }),
        Err(WebSocketError::ClientClosed)
    ));
    assert!(matches!(
        client.enqueue(Tick { seq: 2 }).await,
        Err(WebSocketError::ClientClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_before_start_closes_queue_without_callbacks() {
    init_tracing();
    let (transport, _listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport.clone());

    let receipt = client
        .try_enqueue_with_receipt(Tick { seq: 1 })
        .expect("held before start");
    client.stop().await.expect("stop");

    assert!(matches!(
        receipt.wait().await,
        Err(WebSocketError::ClientClosed)
    ));
    assert_quiet(&mut events, Duration::from_millis(100)).await;
    assert_eq!(transport.attempt_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_after_stop_opens_a_new_generation() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport);

    client.start().await.expect("start");
    let _first = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    assert_eq!(expect_connected(&mut events).await, Generation::new(1));
    client.stop().await.expect("stop");
    assert!(matches!(
        next_event(&mut events).await,
        HandlerEvent::Disconnected(DisconnectReason::Stopped)
    ));

    client.start().await.expect("restart");
    let mut second = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    assert_eq!(expect_connected(&mut events).await, Generation::new(2));

    client.enqueue(Tick { seq: 7 }).await.expect("enqueue");
    assert_eq!(second.recv_text().await.as_deref(), Some(Tick::json(7).as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_last_handle_stops_the_client() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport);

    client.start().await.expect("start");
    let mut server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    let clone = client.clone();
    drop(client);
    assert_eq!(clone.state(), ClientState::Connected);
    drop(clone);

    tokio::time::timeout(EVENT_TIMEOUT, server.wait_closed())
        .await
        .expect("connection closed after drop");
    assert!(matches!(
        next_event(&mut events).await,
        HandlerEvent::Disconnected(DisconnectReason::Stopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_reflect_traffic() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport);

    client.start().await.expect("start");
    let mut server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    server.send_text(Tick::json(1)).expect("send");
    server.send_text(Tick::json(2)).expect("send");
    expect_message(&mut events).await;
    expect_message(&mut events).await;
    client.enqueue(Tick { seq: 3 }).await.expect("enqueue");
    server.recv_text().await.expect("written");

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.state, ClientState::Connected);
    assert_eq!(stats.generation, Some(Generation::new(1)));
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(stats.messages_in, 2);
    assert_eq!(stats.frames_in, 2);
    assert_eq!(stats.frames_out, 1);
    assert_eq!(stats.decode_errors, 0);
}

#[tokio::test]
async fn spawn_rejects_invalid_config() {
    let (transport, _listener) = MockTransport::new();
    let (handler, _events) = RecordingHandler::<Tick>::new();
    let result = market_ws::WsClient::spawn(market_ws::WsClientArgs::new(
        market_ws::WsClientConfig::new("http://not-a-websocket"),
        handler,
        TickCodec::new(),
        transport,
    ));
    assert!(matches!(result, Err(WebSocketError::InvalidConfig(_))));
}
