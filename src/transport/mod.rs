use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Sink, Stream};

use crate::core::{WebSocketBufferConfig, WebSocketError, WsFrame, WsTlsConfig};

pub mod tungstenite;

/// Everything a transport needs to open one connection besides the URL.
#[derive(Clone, Debug, PartialEq)]
pub struct WsConnectOptions {
    /// `http://host:port` of an HTTP CONNECT proxy.
    pub proxy_url: Option<String>,
    pub tls: WsTlsConfig,
    /// Added to the upgrade request.
    pub extra_headers: Vec<(String, String)>,
    /// Enforced by the supervisor around the whole `connect` future.
    pub connect_timeout: Duration,
    pub buffers: WebSocketBufferConfig,
}

impl Default for WsConnectOptions {
    fn default() -> Self {
        Self {
            proxy_url: None,
            tls: WsTlsConfig::default(),
            extra_headers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            buffers: WebSocketBufferConfig::default(),
        }
    }
}

pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), WebSocketError>> + Send>>;

/// Transport boundary for websocket IO.
///
/// A connection is a read half and a write half. Dropping both closes the socket; the send
/// loop closes the write half explicitly on orderly shutdown. Implementations own the wire
/// format and TLS, the client owns lifecycle and policy.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, WebSocketError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = WebSocketError> + Send + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        options: WsConnectOptions,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;

    /// Whether the transport replies to inbound pings on its own. When false the client
    /// queues the pong itself.
    fn answers_pings(&self) -> bool {
        false
    }
}
