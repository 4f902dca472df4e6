//! In-memory transport and recording handler for driving [`WsClient`](crate::ws::WsClient)
//! without a socket.
//!
//! [`MockTransport`] accepts any number of connections; each successful connect yields a
//! [`MockServer`] on the paired [`MockListener`]. Connect failures can be scripted ahead of
//! time, and every attempt is timestamped on tokio's clock so backoff can be asserted under a
//! paused runtime.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::task::AtomicWaker;
use futures_util::{Sink, Stream};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::{
    DisconnectReason, Generation, WebSocketError, WsClientHandler, WsErrorReport, WsFrame,
    WsReconnectStrategy, into_ws_frame,
};
use crate::transport::{WsConnectOptions, WsTransport, WsTransportConnectFuture};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MockShared {
    accept_tx: mpsc::UnboundedSender<MockServer>,
    scripted_failures: Mutex<VecDeque<WebSocketError>>,
    hang_connects: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
    last_options: Mutex<Option<(String, WsConnectOptions)>>,
}

#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn new() -> (Self, MockListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(MockShared {
                    accept_tx,
                    scripted_failures: Mutex::new(VecDeque::new()),
                    hang_connects: AtomicBool::new(false),
                    attempts: Mutex::new(Vec::new()),
                    last_options: Mutex::new(None),
                }),
            },
            MockListener { accept_rx },
        )
    }

    /// Fail the next `n` connect attempts with `ConnectionFailed`.
    pub fn fail_next(&self, n: usize) {
        let mut failures = lock(&self.shared.scripted_failures);
        for i in 0..n {
            failures.push_back(WebSocketError::ConnectionFailed(format!(
                "scripted failure {}",
                i + 1
            )));
        }
    }

    pub fn fail_next_with(&self, error: WebSocketError) {
        lock(&self.shared.scripted_failures).push_back(error);
    }

    /// Connect attempts never complete while set.
    pub fn hang_connects(&self, hang: bool) {
        self.shared.hang_connects.store(hang, Ordering::Release);
    }

    pub fn attempt_count(&self) -> usize {
        lock(&self.shared.attempts).len()
    }

    /// Tokio instants at which each connect attempt started.
    pub fn attempt_instants(&self) -> Vec<Instant> {
        lock(&self.shared.attempts).clone()
    }

    /// URL and options of the most recent attempt.
    pub fn last_connect(&self) -> Option<(String, WsConnectOptions)> {
        lock(&self.shared.last_options).clone()
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        url: String,
        options: WsConnectOptions,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = self.shared.clone();
        Box::pin(async move {
            lock(&shared.attempts).push(Instant::now());
            *lock(&shared.last_options) = Some((url, options));

            if shared.hang_connects.load(Ordering::Acquire) {
                std::future::pending::<()>().await;
            }
            let scripted = lock(&shared.scripted_failures).pop_front();
            if let Some(error) = scripted {
                return Err(error);
            }

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let fail_writes = Arc::new(AtomicBool::new(false));
            let closed = Arc::new(AtomicBool::new(false));
            let stall = Arc::new(WriteStall::default());

            let server = MockServer {
                inbound_tx: Some(inbound_tx),
                outbound_rx,
                fail_writes: fail_writes.clone(),
                closed: closed.clone(),
                stall: stall.clone(),
            };
            shared
                .accept_tx
                .send(server)
                .map_err(|_| WebSocketError::ConnectionFailed("mock listener dropped".to_string()))?;

            Ok((
                MockReader { rx: inbound_rx },
                MockWriter {
                    tx: outbound_tx,
                    fail_writes,
                    closed,
                    stall,
                },
            ))
        })
    }
}

/// Accept side of [`MockTransport`]: one [`MockServer`] per successful connect.
pub struct MockListener {
    accept_rx: mpsc::UnboundedReceiver<MockServer>,
}

impl MockListener {
    pub async fn accept(&mut self) -> Option<MockServer> {
        self.accept_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockServer> {
        tokio::time::timeout(timeout, self.accept_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum MockServerError {
    #[error("mock socket already dropped")]
    SocketDropped,
    #[error("client side of the mock connection is gone")]
    ChannelClosed,
}

/// Server end of one mock connection.
pub struct MockServer {
    inbound_tx: Option<mpsc::UnboundedSender<Result<WsFrame, WebSocketError>>>,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    fail_writes: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    stall: Arc<WriteStall>,
}

/// Holds client writes pending while set.
#[derive(Default)]
struct WriteStall {
    stalled: AtomicBool,
    waker: AtomicWaker,
}

impl MockServer {
    /// Next frame the client wrote, control frames included.
    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next text or binary frame the client wrote, skipping pings and pongs.
    pub async fn recv_data(&mut self) -> Option<WsFrame> {
        loop {
            let frame = self.outbound_rx.recv().await?;
            if !frame.is_control() {
                return Some(frame);
            }
        }
    }

    /// Next text frame as a string, skipping control frames.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.recv_data().await? {
                WsFrame::Text(bytes) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
                _ => continue,
            }
        }
    }

    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Ok(frame)).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> Result<(), MockServerError> {
        self.send_inbound(into_ws_frame(text.as_ref().as_bytes().to_vec()))
    }

    /// Surface a read error on the client's next poll.
    pub fn inject_read_error(&self, error: impl Into<String>) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Err(WebSocketError::TransportError {
            context: "mock_read",
            error: error.into(),
        }))
        .map_err(|_| MockServerError::ChannelClosed)
    }

    /// End the inbound stream without a close frame.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    /// Every further client write fails.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }

    /// Client writes stay pending until [`resume_writes`](Self::resume_writes).
    pub fn stall_writes(&self) {
        self.stall.stalled.store(true, Ordering::Release);
    }

    pub fn resume_writes(&self) {
        self.stall.stalled.store(false, Ordering::Release);
        self.stall.waker.wake();
    }

    /// Whether the client closed its write half.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the client dropped or closed its write half, discarding frames meanwhile.
    pub async fn wait_closed(&mut self) {
        while self.outbound_rx.recv().await.is_some() {}
    }
}

pub struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<WsFrame, WebSocketError>>,
}

impl Stream for MockReader {
    type Item = Result<WsFrame, WebSocketError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

pub struct MockWriter {
    tx: mpsc::UnboundedSender<WsFrame>,
    fail_writes: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    stall: Arc<WriteStall>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = WebSocketError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if !self.stall.stalled.load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }
        self.stall.waker.register(cx.waker());
        if self.stall.stalled.load(Ordering::Acquire) {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        let this = self.get_mut();
        if this.fail_writes.load(Ordering::Acquire) || this.closed.load(Ordering::Acquire) {
            return Err(WebSocketError::TransportError {
                context: "mock_write",
                error: "broken pipe".to_string(),
            });
        }
        this.tx.send(item).map_err(|_| WebSocketError::TransportError {
            context: "mock_write",
            error: "mock server gone".to_string(),
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.closed.store(true, Ordering::Release);
        Poll::Ready(Ok(()))
    }
}

/// Reconnect strategy with a fixed delay.
#[derive(Clone, Copy, Debug)]
pub struct FixedDelayReconnect {
    delay: Duration,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl FixedDelayReconnect {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempts: 0,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl WsReconnectStrategy for FixedDelayReconnect {
    fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn should_retry(&self) -> bool {
        self.max_attempts.is_none_or(|max| self.attempts < max)
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Callback observed by [`RecordingHandler`].
#[derive(Debug, Clone)]
pub enum HandlerEvent<M> {
    Connected(Generation),
    Disconnected(DisconnectReason),
    Message(M),
    Error(WebSocketError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RecordingError(pub String);

type MessageCheck<M> = Arc<dyn Fn(&M) -> Result<(), String> + Send + Sync>;

/// Handler that forwards every callback into a channel and tracks callback concurrency.
pub struct RecordingHandler<M = sonic_rs::Value> {
    events_tx: mpsc::UnboundedSender<HandlerEvent<M>>,
    initial_frames: Vec<WsFrame>,
    check: Option<MessageCheck<M>>,
    callback_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl<M: Clone + Send + 'static> RecordingHandler<M> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HandlerEvent<M>>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                events_tx,
                initial_frames: Vec::new(),
                check: None,
                callback_delay: None,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            },
            events_rx,
        )
    }

    #[must_use]
    pub fn with_initial_frames(mut self, frames: Vec<WsFrame>) -> Self {
        self.initial_frames = frames;
        self
    }

    /// `on_message` fails for every message `check` rejects; the message is still recorded.
    #[must_use]
    pub fn with_check(
        mut self,
        check: impl Fn(&M) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.check = Some(Arc::new(check));
        self
    }

    /// Block inside `on_message` for `delay` to widen any overlap window.
    #[must_use]
    pub fn with_callback_delay(mut self, delay: Duration) -> Self {
        self.callback_delay = Some(delay);
        self
    }

    /// Highest number of `on_message` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }
}

impl<M: Clone + Send + 'static> WsClientHandler for RecordingHandler<M> {
    type Message = M;
    type Error = RecordingError;

    fn on_connected(&self, generation: Generation) {
        let _ = self.events_tx.send(HandlerEvent::Connected(generation));
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        let _ = self
            .events_tx
            .send(HandlerEvent::Disconnected(reason.clone()));
    }

    fn on_message(&self, message: M) -> Result<(), RecordingError> {
        let running = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(running, Ordering::AcqRel);

        if let Some(delay) = self.callback_delay {
            std::thread::sleep(delay);
        }
        let verdict = self.check.as_ref().map(|check| check(&message));
        let _ = self.events_tx.send(HandlerEvent::Message(message));

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        match verdict {
            Some(Err(reason)) => Err(RecordingError(reason)),
            _ => Ok(()),
        }
    }

    fn on_error(&self, report: &WsErrorReport) {
        let _ = self.events_tx.send(HandlerEvent::Error(report.error.clone()));
    }

    fn initial_frames(&self) -> Vec<WsFrame> {
        self.initial_frames.clone()
    }
}
