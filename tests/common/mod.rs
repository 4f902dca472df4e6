#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use market_ws::core::{ExponentialBackoffReconnect, WsReconnectStrategy};
use market_ws::testing::{HandlerEvent, MockTransport, RecordingHandler};
use market_ws::{JsonCodec, WsClient, WsClientArgs, WsClientConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub seq: u64,
}

impl Tick {
    pub fn json(seq: u64) -> String {
        format!(r#"{{"seq":{seq}}}"#)
    }
}

pub type TickCodec = JsonCodec<Tick, Tick>;
pub type TickHandler = RecordingHandler<Tick>;
pub type Events = mpsc::UnboundedReceiver<HandlerEvent<Tick>>;
pub type TestClient<R = ExponentialBackoffReconnect> =
    WsClient<TickHandler, TickCodec, MockTransport, R>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> WsClientConfig {
    WsClientConfig::new("ws://mock.local/stream")
        .with_backoff(Duration::from_millis(50), Duration::from_millis(400), 0.0)
}

pub fn spawn_client(
    config: WsClientConfig,
    handler: Arc<TickHandler>,
    transport: MockTransport,
) -> TestClient {
    let reconnect = config.reconnect_strategy();
    spawn_client_with(config, handler, transport, reconnect)
}

pub fn spawn_client_with<R: WsReconnectStrategy>(
    config: WsClientConfig,
    handler: Arc<TickHandler>,
    transport: MockTransport,
    reconnect: R,
) -> TestClient<R> {
    WsClient::spawn(WsClientArgs {
        config,
        handler,
        codec: TickCodec::new(),
        transport,
        reconnect,
    })
    .expect("valid config")
}

pub async fn next_event(events: &mut Events) -> HandlerEvent<Tick> {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for handler event")
        .expect("handler event channel closed")
}

/// Next event that is not an `on_error` report.
pub async fn next_lifecycle_or_message(events: &mut Events) -> HandlerEvent<Tick> {
    loop {
        match next_event(events).await {
            HandlerEvent::Error(_) => continue,
            other => return other,
        }
    }
}

pub async fn expect_connected(events: &mut Events) -> market_ws::Generation {
    match next_lifecycle_or_message(events).await {
        HandlerEvent::Connected(generation) => generation,
        other => panic!("expected Connected, got {other:?}"),
    }
}

pub async fn expect_message(events: &mut Events) -> Tick {
    match next_lifecycle_or_message(events).await {
        HandlerEvent::Message(tick) => tick,
        other => panic!("expected Message, got {other:?}"),
    }
}

/// Assert no event arrives within `window`.
pub async fn assert_quiet(events: &mut Events, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, events.recv()).await {
        panic!("unexpected handler event: {event:?}");
    }
}
