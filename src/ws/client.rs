use std::sync::Arc;
use std::time::Duration;

use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use tokio::sync::watch;

use super::actor::{GetConnectionStats, Start, Stop, WsSupervisor, WsSupervisorArgs};
use super::queue::{DeliveryReceipt, QueuedMessage, SendQueue, receipt_pair};
use crate::config::WsClientConfig;
use crate::core::{
    ClientState, ExponentialBackoffReconnect, JsonCodec, OutboundMessage, WebSocketError,
    WebSocketResult, WsClientHandler, WsCodec, WsConnectionStats, WsHealthMonitor,
    WsReconnectStrategy,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

fn map_send_error<M>(err: SendError<M, WebSocketError>) -> WebSocketError {
    match err {
        SendError::HandlerError(err) => err,
        SendError::ActorNotRunning(_) | SendError::ActorStopped => WebSocketError::ClientClosed,
        _ => WebSocketError::ActorError("supervisor unavailable".to_string()),
    }
}

/// Everything needed to build a client.
pub struct WsClientArgs<H, C, T, R> {
    pub config: WsClientConfig,
    pub handler: Arc<H>,
    pub codec: C,
    pub transport: T,
    pub reconnect: R,
}

impl<H, C, T> WsClientArgs<H, C, T, ExponentialBackoffReconnect> {
    /// Backoff is derived from the config.
    pub fn new(config: WsClientConfig, handler: H, codec: C, transport: T) -> Self {
        let reconnect = config.reconnect_strategy();
        Self {
            config,
            handler: Arc::new(handler),
            codec,
            transport,
            reconnect,
        }
    }
}

impl<H> WsClientArgs<H, JsonCodec, TungsteniteTransport, ExponentialBackoffReconnect>
where
    H: WsClientHandler<Message = sonic_rs::Value>,
{
    /// JSON text frames over tokio-tungstenite.
    pub fn json(config: WsClientConfig, handler: H) -> Self {
        Self::new(config, handler, JsonCodec::new(), TungsteniteTransport::default())
    }
}

impl<H, C, T, R> WsClientArgs<H, C, T, R> {
    pub fn with_reconnect<R2>(self, reconnect: R2) -> WsClientArgs<H, C, T, R2> {
        WsClientArgs {
            config: self.config,
            handler: self.handler,
            codec: self.codec,
            transport: self.transport,
            reconnect,
        }
    }
}

/// Handle to a reconnecting websocket client.
///
/// Cheap to clone. Enqueueing goes straight into the shared send queue; lifecycle calls go
/// through the supervisor actor. Dropping the last handle stops the client.
pub struct WsClient<
    H,
    C = JsonCodec,
    T = TungsteniteTransport,
    R = ExponentialBackoffReconnect,
> where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    actor: ActorRef<WsSupervisor<H, C, T, R>>,
    queue: Arc<SendQueue<C::Outbound>>,
    state_rx: watch::Receiver<ClientState>,
    health: Arc<WsHealthMonitor>,
}

impl<H, C, T, R> Clone for WsClient<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            queue: self.queue.clone(),
            state_rx: self.state_rx.clone(),
            health: self.health.clone(),
        }
    }
}

impl<H, C, T, R> WsClient<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    /// Validate the config and spawn the supervisor in `Disconnected`. Must be called inside
    /// a tokio runtime.
    pub fn spawn(args: WsClientArgs<H, C, T, R>) -> WebSocketResult<Self> {
        let WsClientArgs {
            config,
            handler,
            codec,
            transport,
            reconnect,
        } = args;
        config.validate()?;

        let (queue, queue_rx) = SendQueue::new(config.send_queue_capacity, config.enqueue_timeout);
        let queue = Arc::new(queue);
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let health = Arc::new(WsHealthMonitor::new());

        let actor = WsSupervisor::spawn(WsSupervisorArgs {
            config,
            handler,
            codec: Arc::new(codec),
            transport,
            reconnect,
            health: health.clone(),
            queue: queue.clone(),
            queue_rx,
            state_tx,
        });

        Ok(Self {
            actor,
            queue,
            state_rx,
            health,
        })
    }

    /// `Disconnected -> Connecting`; a no-op when already running. Returns once the first
    /// connect attempt is under way, not once connected.
    pub async fn start(&self) -> WebSocketResult<()> {
        self.actor.ask(Start).await.map_err(map_send_error)
    }

    /// Close the connection, cancel retries and fail pending messages with `ClientClosed`.
    /// Idempotent.
    pub async fn stop(&self) -> WebSocketResult<()> {
        match self.actor.ask(Stop).await.map_err(map_send_error) {
            Err(WebSocketError::ClientClosed) => Ok(()),
            other => other,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    pub async fn wait_for_state(&self, state: ClientState, timeout: Duration) -> WebSocketResult<()> {
        let mut rx = self.state_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(WebSocketError::ClientClosed),
            Err(_) => Err(WebSocketError::Timeout {
                context: format!("waiting for {state} (currently {})", self.state()),
            }),
        }
    }

    /// Enqueue without waiting. Fails with `QueueFull` when saturated.
    pub fn try_enqueue(
        &self,
        message: impl Into<OutboundMessage<C::Outbound>>,
    ) -> WebSocketResult<()> {
        self.queue.try_push(QueuedMessage {
            message: message.into(),
            ack: None,
        })
    }

    /// Enqueue, waiting up to the configured `enqueue_timeout` for space.
    pub async fn enqueue(
        &self,
        message: impl Into<OutboundMessage<C::Outbound>>,
    ) -> WebSocketResult<()> {
        self.queue
            .push(QueuedMessage {
                message: message.into(),
                ack: None,
            })
            .await
    }

    pub fn try_enqueue_with_receipt(
        &self,
        message: impl Into<OutboundMessage<C::Outbound>>,
    ) -> WebSocketResult<DeliveryReceipt> {
        let (ack, receipt) = receipt_pair();
        self.queue.try_push(QueuedMessage {
            message: message.into(),
            ack: Some(ack),
        })?;
        Ok(receipt)
    }

    pub async fn enqueue_with_receipt(
        &self,
        message: impl Into<OutboundMessage<C::Outbound>>,
    ) -> WebSocketResult<DeliveryReceipt> {
        let (ack, receipt) = receipt_pair();
        self.queue
            .push(QueuedMessage {
                message: message.into(),
                ack: Some(ack),
            })
            .await?;
        Ok(receipt)
    }

    /// `false` after `stop()` or exhausted reconnects, until the next `start()`.
    pub fn is_accepting(&self) -> bool {
        self.queue.is_open()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub async fn stats(&self) -> WebSocketResult<WsConnectionStats> {
        self.actor
            .ask(GetConnectionStats)
            .await
            .map_err(map_send_error)
    }

    pub fn health(&self) -> &WsHealthMonitor {
        &self.health
    }
}
