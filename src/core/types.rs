use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for websocket operations.
pub type WebSocketResult<T> = Result<T, WebSocketError>;

/// Canonical websocket error surface shared across the client.
///
/// Only `ConnectionFailed`, `ConnectTimeout`, `TransportError` and `HeartbeatTimeout` mean the
/// physical connection is unusable; everything else is contained and reported.
#[derive(Debug, Clone, Error)]
pub enum WebSocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Backpressure: outbound queue full")]
    QueueFull,

    #[error("Client closed")]
    ClientClosed,

    #[error("Stale connection generation {generation}")]
    Stale { generation: Generation },

    #[error("Callback failed: {0}")]
    CallbackFailed(String),

    #[error("Heartbeat timeout: no inbound frame for {silent_for:?}")]
    HeartbeatTimeout { silent_for: Duration },

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Actor error: {0}")]
    ActorError(String),

    #[error("Timeout: {context}")]
    Timeout { context: String },
}

/// Lifecycle state of a client. Only the supervisor actor ever writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Closing => "closing",
        }
    }

    /// `Connecting` or `Connected`: a `start()` in this state is a no-op.
    pub fn is_running(self) -> bool {
        matches!(self, ClientState::Connecting | ClientState::Connected)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonically increasing id of one connect-to-disconnect lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application payload plus optional correlation id. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage<T> {
    payload: T,
    correlation_id: Option<u64>,
}

impl<T> OutboundMessage<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(payload: T, correlation_id: u64) -> Self {
        Self {
            payload,
            correlation_id: Some(correlation_id),
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<u64> {
        self.correlation_id
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T> From<T> for OutboundMessage<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}

/// Why a connection generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `stop()` was called.
    Stopped,
    /// The peer sent a close frame.
    RemoteClosed { code: Option<u16>, reason: String },
    /// The inbound stream ended without a close frame.
    StreamEnded,
    ReadFailure { error: String },
    WriteFailure { error: String },
    HeartbeatTimeout { silent_for: Duration },
}

impl DisconnectReason {
    /// The error surfaced through `on_error` for this disconnect, if it was a failure.
    pub fn as_error(&self) -> Option<WebSocketError> {
        match self {
            DisconnectReason::ReadFailure { error } => Some(WebSocketError::TransportError {
                context: "read",
                error: error.clone(),
            }),
            DisconnectReason::WriteFailure { error } => Some(WebSocketError::TransportError {
                context: "write",
                error: error.clone(),
            }),
            DisconnectReason::HeartbeatTimeout { silent_for } => {
                Some(WebSocketError::HeartbeatTimeout {
                    silent_for: *silent_for,
                })
            }
            DisconnectReason::Stopped
            | DisconnectReason::RemoteClosed { .. }
            | DisconnectReason::StreamEnded => None,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Stopped => f.write_str("stopped"),
            DisconnectReason::RemoteClosed { code, reason } => match code {
                Some(code) => write!(f, "remote closed: code={code} reason={reason}"),
                None => f.write_str("remote closed"),
            },
            DisconnectReason::StreamEnded => f.write_str("stream ended"),
            DisconnectReason::ReadFailure { error } => write!(f, "read failure: {error}"),
            DisconnectReason::WriteFailure { error } => write!(f, "write failure: {error}"),
            DisconnectReason::HeartbeatTimeout { silent_for } => {
                write!(f, "heartbeat timeout after {silent_for:?} of silence")
            }
        }
    }
}

/// Error handed to `on_error`, with the context needed to debug it after the fact.
#[derive(Debug, Clone)]
pub struct WsErrorReport {
    pub error: WebSocketError,
    pub generation: Option<Generation>,
    pub at_epoch_us: Option<i64>,
    pub last_sent: Option<String>,
    pub last_received: Option<String>,
}

impl fmt::Display for WsErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}us] websocket error", self.at_epoch_us.unwrap_or_default())?;
        if let Some(generation) = self.generation {
            write!(f, " (generation {generation})")?;
        }
        writeln!(f, ": {}", self.error)?;
        writeln!(f, "last sent: {}", self.last_sent.as_deref().unwrap_or(""))?;
        write!(f, "last received: {}", self.last_received.as_deref().unwrap_or(""))
    }
}

/// Best-effort current time as Unix epoch microseconds.
#[inline]
pub fn now_epoch_us() -> Option<i64> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    Some(dur.as_micros().min(i64::MAX as u128) as i64)
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WebSocketBufferConfig {
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            read_buffer_bytes: 128 << 10,
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// TLS configuration for websocket connections.
///
/// Certificate validation is on unless explicitly disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WsTlsConfig {
    pub validate_certs: bool,
}

impl Default for WsTlsConfig {
    fn default() -> Self {
        Self {
            validate_certs: true,
        }
    }
}

/// Connection statistics snapshot.
#[derive(Clone, Debug)]
pub struct WsConnectionStats {
    pub state: ClientState,
    pub generation: Option<Generation>,
    pub reconnect_attempt: u32,
    pub connects: u64,
    pub reconnects: u64,
    pub frames_in: u64,
    pub messages_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub decode_errors: u64,
    pub callback_errors: u64,
    pub recent_errors: usize,
    pub p50_rtt_us: u64,
    pub p99_rtt_us: u64,
    pub rtt_samples: u64,
}
