use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config,
    tungstenite::{
        Message as TungsteniteMessage, Utf8Bytes,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderName, HeaderValue},
        protocol::{CloseFrame as TungCloseFrame, WebSocketConfig},
    },
};
use tracing::debug;

use crate::core::{WebSocketBufferConfig, WebSocketError, WsCloseFrame, WsFrame};
use crate::tls::{insecure_client_config, install_rustls_crypto_provider};
use crate::transport::{WsConnectOptions, WsTransport, WsTransportConnectFuture};

const MAX_PROXY_RESPONSE_BYTES: usize = 8 * 1024;

type TungsteniteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn map_ws_error(context: &'static str, err: impl ToString) -> WebSocketError {
    WebSocketError::TransportError {
        context,
        error: err.to_string(),
    }
}

fn connect_error(err: impl ToString) -> WebSocketError {
    WebSocketError::ConnectionFailed(err.to_string())
}

fn close_to_core(frame: Option<TungCloseFrame>) -> Option<WsCloseFrame> {
    frame.map(|f| WsCloseFrame {
        code: u16::from(f.code),
        reason: AsRef::<Bytes>::as_ref(&f.reason).clone(),
    })
}

fn core_to_close(frame: WsCloseFrame) -> TungCloseFrame {
    TungCloseFrame {
        code: frame.code.into(),
        reason: Utf8Bytes::try_from(frame.reason).unwrap_or_else(|_| Utf8Bytes::from_static("")),
    }
}

fn msg_to_frame(msg: TungsteniteMessage) -> WsFrame {
    match msg {
        TungsteniteMessage::Text(text) => WsFrame::Text(AsRef::<Bytes>::as_ref(&text).clone()),
        TungsteniteMessage::Binary(bytes) => WsFrame::Binary(bytes),
        TungsteniteMessage::Ping(bytes) => WsFrame::Ping(bytes),
        TungsteniteMessage::Pong(bytes) => WsFrame::Pong(bytes),
        TungsteniteMessage::Close(frame) => WsFrame::Close(close_to_core(frame)),
        // Raw frames are only produced when writing.
        TungsteniteMessage::Frame(_) => WsFrame::Binary(Bytes::new()),
    }
}

fn frame_to_msg(frame: WsFrame) -> TungsteniteMessage {
    match frame {
        WsFrame::Text(bytes) => match Utf8Bytes::try_from(bytes.clone()) {
            Ok(text) => TungsteniteMessage::Text(text),
            Err(_) => TungsteniteMessage::Binary(bytes),
        },
        WsFrame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
        WsFrame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
        WsFrame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
        WsFrame::Close(frame) => TungsteniteMessage::Close(frame.map(core_to_close)),
    }
}

fn websocket_config(buffers: WebSocketBufferConfig) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.read_buffer_size = buffers.read_buffer_bytes;
    config.write_buffer_size = buffers.write_buffer_bytes;
    config.max_write_buffer_size = buffers.max_write_buffer_bytes;
    config.max_message_size = Some(buffers.max_message_bytes.max(buffers.read_buffer_bytes));
    config.max_frame_size = Some(buffers.max_frame_bytes.max(buffers.read_buffer_bytes));
    config
}

fn build_request(url: &str, headers: &[(String, String)]) -> Result<Request, WebSocketError> {
    let mut request = url.into_client_request().map_err(connect_error)?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| WebSocketError::InvalidConfig(format!("header {name}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| WebSocketError::InvalidConfig(format!("header {name}: {err}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

fn target_authority(request: &Request) -> Result<(String, u16), WebSocketError> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| connect_error(format!("url has no host: {uri}")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = match uri.port_u16() {
        Some(port) => port,
        None if uri.scheme_str() == Some("wss") => 443,
        None => 80,
    };
    Ok((host, port))
}

fn proxy_authority(proxy_url: &str) -> Result<String, WebSocketError> {
    let authority = proxy_url
        .strip_prefix("http://")
        .unwrap_or(proxy_url)
        .trim_end_matches('/');
    if authority.is_empty() {
        return Err(WebSocketError::InvalidConfig(format!(
            "invalid proxy url {proxy_url}"
        )));
    }
    Ok(authority.to_string())
}

/// Open a TCP tunnel to `host:port` through an HTTP CONNECT proxy.
async fn connect_via_proxy(
    proxy_url: &str,
    host: &str,
    port: u16,
) -> Result<TcpStream, WebSocketError> {
    let proxy = proxy_authority(proxy_url)?;
    let mut stream = TcpStream::connect(proxy.as_str())
        .await
        .map_err(|err| connect_error(format!("proxy {proxy}: {err}")))?;

    let target = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| connect_error(format!("proxy {proxy}: {err}")))?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        if response.len() > MAX_PROXY_RESPONSE_BYTES {
            return Err(connect_error(format!(
                "proxy {proxy}: response header too large"
            )));
        }
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| connect_error(format!("proxy {proxy}: {err}")))?;
        if read == 0 {
            return Err(connect_error(format!(
                "proxy {proxy}: closed during CONNECT"
            )));
        }
        response.extend_from_slice(&chunk[..read]);
    }

    let status_line = response
        .split(|b| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    if status != Some("200") {
        return Err(connect_error(format!(
            "proxy {proxy} refused CONNECT {target}: {status_line}"
        )));
    }
    debug!(proxy = %proxy, target = %target, "proxy tunnel established");
    Ok(stream)
}

/// tokio-tungstenite transport: direct TCP or HTTP CONNECT tunnel, then TLS via rustls for
/// `wss://`.
#[derive(Clone, Default)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
}

impl TungsteniteTransport {
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }
}

pub struct TungsteniteReader {
    inner: futures_util::stream::SplitStream<TungsteniteStream>,
}

impl Stream for TungsteniteReader {
    type Item = Result<WsFrame, WebSocketError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg_to_frame(msg)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(map_ws_error("read", err)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TungsteniteWriter {
    inner: futures_util::stream::SplitSink<TungsteniteStream, TungsteniteMessage>,
}

impl Sink<WsFrame> for TungsteniteWriter {
    type Error = WebSocketError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(frame_to_msg(item))
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| map_ws_error("write", e))
    }
}

impl WsTransport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(
        &self,
        url: String,
        options: WsConnectOptions,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let request = build_request(&url, &options.extra_headers)?;
            let (host, port) = target_authority(&request)?;

            let tcp = match options.proxy_url.as_deref() {
                Some(proxy_url) => connect_via_proxy(proxy_url, &host, port).await?,
                None => TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(|err| connect_error(format!("{host}:{port}: {err}")))?,
            };
            let _ = tcp.set_nodelay(true);

            let connector = if options.tls.validate_certs {
                connector
            } else {
                Some(Connector::Rustls(insecure_client_config()?))
            };

            let (stream, response) = client_async_tls_with_config(
                request,
                tcp,
                Some(websocket_config(options.buffers)),
                connector,
            )
            .await
            .map_err(connect_error)?;
            debug!(url = %url, status = %response.status(), "websocket handshake complete");

            let (write, read) = stream.split();
            Ok((
                TungsteniteReader { inner: read },
                TungsteniteWriter { inner: write },
            ))
        })
    }

    /// tungstenite queues a pong for every ping it reads and flushes it with the next read
    /// or write.
    fn answers_pings(&self) -> bool {
        true
    }
}
