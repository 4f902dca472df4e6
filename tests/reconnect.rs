mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use market_ws::testing::{FixedDelayReconnect, HandlerEvent, MockTransport, RecordingHandler};
use market_ws::{ClientState, DisconnectReason, Generation, WebSocketError, WsFrame};
use tokio::time::Instant;

const SLACK: Duration = Duration::from_millis(5);

fn assert_gap(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual <= expected + SLACK,
        "expected gap of {expected:?}, got {actual:?}"
    );
}

fn gaps(instants: &[Instant]) -> Vec<Duration> {
    instants.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_exponentially() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    transport.fail_next(3);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport.clone());

    client.start().await.expect("start");
    for _ in 0..3 {
        match next_event(&mut events).await {
            HandlerEvent::Error(WebSocketError::ConnectionFailed(_)) => {}
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        assert_eq!(client.state(), ClientState::Connecting);
    }
    let _server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    assert_eq!(expect_connected(&mut events).await, Generation::new(1));

    let attempts = transport.attempt_instants();
    assert_eq!(attempts.len(), 4);
    let gaps = gaps(&attempts);
    assert_gap(gaps[0], Duration::from_millis(50));
    assert_gap(gaps[1], Duration::from_millis(100));
    assert_gap(gaps[2], Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped_at_max() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    transport.fail_next(6);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport.clone());

    client.start().await.expect("start");
    let _server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    let gaps = gaps(&transport.attempt_instants());
    let expected = [50, 100, 200, 400, 400, 400];
    assert_eq!(gaps.len(), expected.len());
    for (gap, ms) in gaps.iter().zip(expected) {
        assert_gap(*gap, Duration::from_millis(ms));
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_resets_after_a_successful_connect() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    transport.fail_next(2);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client(test_config(), Arc::new(handler), transport.clone());

    client.start().await.expect("start");
    let mut first = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    let dropped_at = Instant::now();
    first.drop_socket();
    match next_lifecycle_or_message(&mut events).await {
        HandlerEvent::Disconnected(DisconnectReason::StreamEnded) => {}
        other => panic!("expected StreamEnded, got {other:?}"),
    }
    let _second = listener.accept_timeout(EVENT_TIMEOUT).await.expect("reconnected");
    assert_eq!(expect_connected(&mut events).await, Generation::new(2));

    let attempts = transport.attempt_instants();
    assert_eq!(attempts.len(), 4);
    assert_gap(attempts[3] - dropped_at, Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn custom_strategy_drives_retry_timing() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    transport.fail_next(2);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let client = spawn_client_with(
        test_config(),
        Arc::new(handler),
        transport.clone(),
        FixedDelayReconnect::new(Duration::from_millis(300)),
    );

    client.start().await.expect("start");
    let _server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    for gap in gaps(&transport.attempt_instants()) {
        assert_gap(gap, Duration::from_millis(300));
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_forces_exactly_one_reconnect() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let config = test_config().with_ping(Duration::from_secs(1), 3);
    let client = spawn_client(config, Arc::new(handler), transport.clone());

    client.start().await.expect("start");
    let mut silent = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    assert_eq!(expect_connected(&mut events).await, Generation::new(1));
    let connected_at = Instant::now();

    match next_event(&mut events).await {
        HandlerEvent::Disconnected(DisconnectReason::HeartbeatTimeout { silent_for }) => {
            assert!(silent_for > Duration::from_secs(3), "{silent_for:?}");
        }
        other => panic!("expected HeartbeatTimeout, got {other:?}"),
    }
    let elapsed = connected_at.elapsed();
    assert!(
        elapsed > Duration::from_secs(3) && elapsed <= Duration::from_secs(4) + SLACK,
        "timed out after {elapsed:?}"
    );
    match next_event(&mut events).await {
        HandlerEvent::Error(WebSocketError::HeartbeatTimeout { .. }) => {}
        other => panic!("expected HeartbeatTimeout report, got {other:?}"),
    }

    // The silent server saw the client's pings.
    let mut pings = 0;
    while let Some(frame) = silent.recv_outbound_timeout(Duration::from_millis(1)).await {
        if matches!(frame, WsFrame::Ping(_)) {
            pings += 1;
        }
    }
    assert_eq!(pings, 3);

    let mut responsive = listener.accept_timeout(EVENT_TIMEOUT).await.expect("reconnected");
    assert_eq!(expect_connected(&mut events).await, Generation::new(2));
    let echo = tokio::spawn(async move {
        while let Some(frame) = responsive.recv_outbound().await {
            if let WsFrame::Ping(payload) = frame {
                if responsive.send_inbound(WsFrame::Pong(payload)).is_err() {
                    break;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempt_count(), 2);
    assert_eq!(client.state(), ClientState::Connected);
    assert!(events.try_recv().is_err(), "no further lifecycle events expected");

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.reconnects, 1);
    assert!(stats.rtt_samples > 0);

    client.stop().await.expect("stop");
    echo.await.expect("echo task");
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_close_the_client() {
    init_tracing();
    let (transport, _listener) = MockTransport::new();
    transport.fail_next(10);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let config = test_config().with_max_reconnect_attempts(2);
    let client = spawn_client(config, Arc::new(handler), transport.clone());

    client.try_enqueue(Tick { seq: 1 }).expect("held");
    let pending = client
        .try_enqueue_with_receipt(Tick { seq: 2 })
        .expect("held");
    client.start().await.expect("start");

    for _ in 0..3 {
        assert!(matches!(
            next_event(&mut events).await,
            HandlerEvent::Error(WebSocketError::ConnectionFailed(_))
        ));
    }
    match next_event(&mut events).await {
        HandlerEvent::Error(WebSocketError::ReconnectExhausted { attempts }) => {
            assert_eq!(attempts, 2)
        }
        other => panic!("expected ReconnectExhausted, got {other:?}"),
    }

    client
        .wait_for_state(ClientState::Disconnected, EVENT_TIMEOUT)
        .await
        .expect("disconnected");
    assert_eq!(transport.attempt_count(), 3);
    assert!(matches!(
        pending.wait().await,
        Err(WebSocketError::ClientClosed)
    ));
    assert!(matches!(
        client.try_enqueue(Tick { seq: 3 }),
        Err(WebSocketError::ClientClosed)
    ));

    // Never connected, so there is no disconnect to report.
    assert_quiet(&mut events, Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn start_after_exhaustion_tries_again() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    transport.fail_next(2);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let config = test_config().with_max_reconnect_attempts(1);
    let client = spawn_client(config, Arc::new(handler), transport.clone());

    client.start().await.expect("start");
    client
        .wait_for_state(ClientState::Disconnected, EVENT_TIMEOUT)
        .await
        .expect("exhausted");
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, HandlerEvent::Error(_)), "{event:?}");
    }

    client.start().await.expect("restart");
    let mut server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    assert_eq!(expect_connected(&mut events).await, Generation::new(1));
    client.enqueue(Tick { seq: 5 }).await.expect("enqueue");
    assert_eq!(server.recv_text().await, Some(Tick::json(5)));
}

#[tokio::test(start_paused = true)]
async fn hung_connect_times_out_and_retries() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    transport.hang_connects(true);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let config = test_config().with_connect_timeout(Duration::from_secs(2));
    let client = spawn_client(config, Arc::new(handler), transport.clone());

    let started = Instant::now();
    client.start().await.expect("start");
    match next_event(&mut events).await {
        HandlerEvent::Error(WebSocketError::ConnectTimeout(timeout)) => {
            assert_eq!(timeout, Duration::from_secs(2))
        }
        other => panic!("expected ConnectTimeout, got {other:?}"),
    }
    assert_gap(started.elapsed(), Duration::from_secs(2));

    transport.hang_connects(false);
    let _server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    assert_eq!(expect_connected(&mut events).await, Generation::new(1));
    assert_eq!(transport.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_pending_retry() {
    init_tracing();
    let (transport, _listener) = MockTransport::new();
    transport.fail_next(1);
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let config = test_config().with_backoff(
        Duration::from_secs(10),
        Duration::from_secs(10),
        0.0,
    );
    let client = spawn_client(config, Arc::new(handler), transport.clone());

    client.start().await.expect("start");
    assert!(matches!(
        next_event(&mut events).await,
        HandlerEvent::Error(WebSocketError::ConnectionFailed(_))
    ));
    client.stop().await.expect("stop");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempt_count(), 1);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_quiet(&mut events, Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_after_a_fault_reports_one_disconnect() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let config = test_config().with_backoff(
        Duration::from_secs(10),
        Duration::from_secs(10),
        0.0,
    );
    let client = spawn_client(config, Arc::new(handler), transport.clone());

    client.start().await.expect("start");
    let mut server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    server.drop_socket();
    match next_lifecycle_or_message(&mut events).await {
        HandlerEvent::Disconnected(DisconnectReason::StreamEnded) => {}
        other => panic!("expected StreamEnded, got {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Connecting);

    client.stop().await.expect("stop");
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_quiet(&mut events, Duration::from_secs(1)).await;
    assert_eq!(transport.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn huge_ping_interval_never_fires_a_heartbeat() {
    init_tracing();
    let (transport, mut listener) = MockTransport::new();
    let (handler, mut events) = RecordingHandler::<Tick>::new();
    let config = test_config().with_ping(Duration::MAX, 3);
    let client = spawn_client(config, Arc::new(handler), transport);

    client.start().await.expect("start");
    let mut server = listener.accept_timeout(EVENT_TIMEOUT).await.expect("accepted");
    expect_connected(&mut events).await;

    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
    assert_quiet(&mut events, Duration::from_secs(1)).await;
    assert_eq!(client.state(), ClientState::Connected);
    assert!(server.recv_outbound_timeout(Duration::from_secs(1)).await.is_none());

    server.send_text(Tick::json(9)).expect("send");
    assert_eq!(expect_message(&mut events).await, Tick { seq: 9 });
}
