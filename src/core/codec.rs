//! Frame codec: outbound application messages to wire frames and inbound data frames to
//! application messages.
//!
//! Codecs are stateless and shared between the send loop and the dispatcher of every
//! generation. A decode failure only skips the offending frame.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::frame::WsFrame;
use super::types::{OutboundMessage, WebSocketError, WebSocketResult};

pub trait WsCodec: Send + Sync + 'static {
    type Outbound: Send + 'static;
    type Inbound: Send + 'static;

    fn encode(&self, message: &OutboundMessage<Self::Outbound>) -> WebSocketResult<WsFrame>;

    /// Decode a data frame. Control frames never reach the codec.
    fn decode(&self, frame: &WsFrame) -> WebSocketResult<Self::Inbound>;
}

/// JSON text frames via sonic-rs. Binary frames are parsed as JSON as well.
pub struct JsonCodec<In = sonic_rs::Value, Out = sonic_rs::Value> {
    _phantom: PhantomData<fn(Out) -> In>,
}

impl<In, Out> JsonCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<In, Out> Default for JsonCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> Clone for JsonCodec<In, Out> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<In, Out> std::fmt::Debug for JsonCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<In, Out> WsCodec for JsonCodec<In, Out>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    type Outbound = Out;
    type Inbound = In;

    fn encode(&self, message: &OutboundMessage<Out>) -> WebSocketResult<WsFrame> {
        let text = sonic_rs::to_string(message.payload())
            .map_err(|err| WebSocketError::EncodeFailed(err.to_string()))?;
        Ok(WsFrame::Text(Bytes::from(text)))
    }

    fn decode(&self, frame: &WsFrame) -> WebSocketResult<In> {
        let bytes = match frame {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => bytes,
            other => {
                return Err(WebSocketError::DecodeFailed(format!(
                    "unexpected {:?} frame",
                    other.kind()
                )));
            }
        };
        sonic_rs::from_slice(bytes.as_ref())
            .map_err(|err| WebSocketError::DecodeFailed(err.to_string()))
    }
}

/// Pass-through codec for callers that handle framing themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl WsCodec for RawCodec {
    type Outbound = WsFrame;
    type Inbound = WsFrame;

    fn encode(&self, message: &OutboundMessage<WsFrame>) -> WebSocketResult<WsFrame> {
        Ok(message.payload().clone())
    }

    fn decode(&self, frame: &WsFrame) -> WebSocketResult<WsFrame> {
        Ok(frame.clone())
    }
}
