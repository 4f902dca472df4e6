//! Reconnecting websocket client built on a kameo supervisor actor.
//!
//! A [`WsClient`] keeps exactly one live connection to its endpoint. Each connection
//! generation runs a receive dispatcher, a send loop and a heartbeat monitor as tokio tasks;
//! the supervisor tears all three down on any I/O fault or heartbeat timeout and reconnects
//! with capped, jittered exponential backoff. Outbound messages go through a bounded queue
//! that holds them across reconnects.

pub mod config;
pub mod core;
pub mod testing;
pub mod tls;
pub mod transport;
pub mod ws;

pub use config::WsClientConfig;
pub use crate::core::{
    ClientState, DisconnectReason, Generation, JsonCodec, OutboundMessage, RawCodec,
    WebSocketError, WebSocketResult, WsClientHandler, WsCodec, WsErrorReport, WsFrame,
};
pub use transport::tungstenite::TungsteniteTransport;
pub use ws::{DeliveryReceipt, WsClient, WsClientArgs};
