//! Connection supervisor.
//!
//! The supervisor actor is the single writer of [`ClientState`] and of the current
//! connection. The dispatcher, send loop and heartbeat monitor of a generation run as plain
//! tokio tasks outside the actor and report back with messages; connect attempts and backoff
//! sleeps are detached tasks that report back the same way. Each connect attempt and each
//! generation carries an id, and messages for a superseded id are ignored.

use std::sync::Arc;

use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::monitor::run_heartbeat;
use super::queue::{QueueReceiver, SendQueue};
use super::reader::run_dispatcher;
use super::writer::run_send_loop;
use super::{CONTROL_CAPACITY, FaultSignal, GenerationContext};
use crate::config::WsClientConfig;
use crate::core::{
    ClientState, DisconnectReason, Generation, HeartbeatState, WebSocketError, WebSocketResult,
    WsClientHandler, WsCodec, WsConnectionStats, WsHealthMonitor, WsReconnectStrategy,
};
use crate::transport::{WsConnectOptions, WsTransport};

/// Construction arguments. The queue and state channel are created by the client handle so it
/// can enqueue and observe state without a round trip through the mailbox.
pub struct WsSupervisorArgs<H, C, T, R>
where
    C: WsCodec,
{
    pub config: WsClientConfig,
    pub handler: Arc<H>,
    pub codec: Arc<C>,
    pub transport: T,
    pub reconnect: R,
    pub health: Arc<WsHealthMonitor>,
    pub(crate) queue: Arc<SendQueue<C::Outbound>>,
    pub(crate) queue_rx: QueueReceiver<C::Outbound>,
    pub state_tx: watch::Sender<ClientState>,
}

struct ActiveConnection<T> {
    generation: Generation,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    send_loop: JoinHandle<QueueReceiver<T>>,
}

pub struct WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    config: WsClientConfig,
    connect_options: WsConnectOptions,
    handler: Arc<H>,
    codec: Arc<C>,
    transport: T,
    reconnect: R,
    health: Arc<WsHealthMonitor>,
    queue: Arc<SendQueue<C::Outbound>>,
    queue_rx: Option<QueueReceiver<C::Outbound>>,
    state_tx: watch::Sender<ClientState>,
    actor_ref: WeakActorRef<Self>,
    active: Option<ActiveConnection<C::Outbound>>,
    last_generation: Generation,
    attempt_seq: u64,
    connect_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl<H, C, T, R> Actor for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Args = WsSupervisorArgs<H, C, T, R>;
    type Error = WebSocketError;

    fn name() -> &'static str {
        "WsSupervisor"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> WebSocketResult<Self> {
        let WsSupervisorArgs {
            config,
            handler,
            codec,
            transport,
            reconnect,
            health,
            queue,
            queue_rx,
            state_tx,
        } = args;

        let connect_options = config.connect_options();
        Ok(Self {
            config,
            connect_options,
            handler,
            codec,
            transport,
            reconnect,
            health,
            queue,
            queue_rx: Some(queue_rx),
            state_tx,
            actor_ref: ctx.downgrade(),
            active: None,
            last_generation: Generation::new(0),
            attempt_seq: 0,
            connect_task: None,
            retry_task: None,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> WebSocketResult<()> {
        debug!(url = %self.config.url, reason = ?reason, "supervisor stopping");
        self.shutdown(DisconnectReason::Stopped).await;
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            error!(error = ?err, "WsSupervisor panicked");
            Ok(std::ops::ControlFlow::Break(ActorStopReason::Panicked(err)))
        }
    }
}

impl<H, C, T, R> WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(url = %self.config.url, from = %previous, to = %state, "client state");
        }
    }

    fn report(&self, error: WebSocketError, generation: Option<Generation>) {
        let report = self.health.report(error, generation);
        self.handler.on_error(&report);
    }

    fn begin_connect(&mut self) {
        self.attempt_seq += 1;
        let attempt = self.attempt_seq;
        let actor_ref = self.actor_ref.clone();

        let url = self.config.url.clone();
        let options = self.connect_options.clone();
        let timeout = options.connect_timeout;
        let transport = self.transport.clone();
        info!(url = %url, attempt, proxy = ?options.proxy_url, "connecting");

        self.connect_task = Some(tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, transport.connect(url, options)).await;
            let Some(actor_ref) = actor_ref.upgrade() else {
                return;
            };
            let delivered = match outcome {
                Ok(Ok((reader, writer))) => actor_ref
                    .tell(ConnectionEstablished::<T> {
                        attempt,
                        reader,
                        writer,
                    })
                    .send()
                    .await
                    .is_ok(),
                Ok(Err(error)) => actor_ref
                    .tell(ConnectionFailed { attempt, error })
                    .send()
                    .await
                    .is_ok(),
                Err(_) => actor_ref
                    .tell(ConnectionFailed {
                        attempt,
                        error: WebSocketError::ConnectTimeout(timeout),
                    })
                    .send()
                    .await
                    .is_ok(),
            };
            if !delivered {
                debug!(attempt, "supervisor gone before connect outcome was delivered");
            }
        }));
    }

    /// Wait out the next backoff delay, or give up when the strategy is exhausted.
    fn schedule_retry(&mut self) {
        if !self.reconnect.should_retry() {
            let attempts = self.reconnect.attempts();
            error!(url = %self.config.url, attempts, "reconnect attempts exhausted");
            self.report(WebSocketError::ReconnectExhausted { attempts }, None);
            self.queue.close();
            if let Some(rx) = self.queue_rx.take() {
                rx.fail_pending(WebSocketError::ClientClosed);
            }
            self.set_state(ClientState::Disconnected);
            return;
        }

        let delay = self.reconnect.next_delay();
        let attempt = self.attempt_seq;
        warn!(
            url = %self.config.url,
            attempt = self.reconnect.attempts(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let actor_ref = self.actor_ref.clone();
        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(actor_ref) = actor_ref.upgrade() {
                let _ = actor_ref.tell(RetryConnect { attempt }).send().await;
            }
        }));
    }

    fn fault_signal(&self, generation: Generation) -> FaultSignal {
        let actor_ref = self.actor_ref.clone();
        FaultSignal::new(
            generation,
            Arc::new(move |generation, reason| {
                let Some(actor_ref) = actor_ref.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let _ = actor_ref
                        .tell(ConnectionFault { generation, reason })
                        .send()
                        .await;
                });
            }),
        )
    }

    fn activate(&mut self, reader: T::Reader, writer: T::Writer) {
        let Some(queue_rx) = self.queue_rx.take() else {
            warn!(url = %self.config.url, "connection established without a send queue");
            return;
        };

        let generation = self.last_generation.next();
        self.last_generation = generation;
        self.reconnect.reset();
        self.health.record_connected();
        self.set_state(ClientState::Connected);
        info!(url = %self.config.url, generation = %generation, "connected");
        self.handler.on_connected(generation);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let initial_frames = self.handler.initial_frames();
        let (control_tx, control_rx) =
            mpsc::channel(CONTROL_CAPACITY.max(initial_frames.len()));
        for frame in initial_frames {
            let _ = control_tx.try_send(frame);
        }

        let ctx = GenerationContext {
            generation,
            handler: self.handler.clone(),
            codec: self.codec.clone(),
            health: self.health.clone(),
            heartbeat: Arc::new(HeartbeatState::new(
                self.config.ping_interval,
                self.config.ping_timeout_multiple,
            )),
            control_tx,
            answer_pings: !self.transport.answers_pings(),
            shutdown_rx,
            fault: self.fault_signal(generation),
        };

        self.active = Some(ActiveConnection {
            generation,
            shutdown_tx,
            dispatcher: tokio::spawn(run_dispatcher(ctx.clone(), reader)),
            heartbeat: tokio::spawn(run_heartbeat(ctx.clone())),
            send_loop: tokio::spawn(run_send_loop(ctx, writer, control_rx, queue_rx)),
        });
    }

    /// Cancel the current generation's tasks and wait for all of them, reclaiming the queue.
    async fn teardown_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let _ = active.shutdown_tx.send(true);

        if let Err(err) = active.dispatcher.await {
            warn!(generation = %active.generation, "dispatcher terminated with error: {err}");
        }
        if let Err(err) = active.heartbeat.await {
            warn!(generation = %active.generation, "heartbeat terminated with error: {err}");
        }
        match active.send_loop.await {
            Ok(rx) => self.queue_rx = Some(rx),
            Err(err) => {
                warn!(generation = %active.generation, "send loop terminated with error: {err}");
                // The receiver went down with the task; buffered messages are lost.
                self.queue_rx = self.queue.reopen();
            }
        }
        debug!(
            generation = %active.generation,
            pending = self.queue_rx.as_ref().map_or(0, |rx| rx.len()),
            "generation torn down"
        );
    }

    fn cancel_timers(&mut self) {
        // Bumping the attempt id also invalidates outcomes already in the mailbox.
        self.attempt_seq += 1;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }

    /// Only a live generation gets an `on_disconnected`. A fault already reported its own,
    /// and a client that never connected has nothing to pair it with.
    async fn shutdown(&mut self, reason: DisconnectReason) {
        let was_connected = self.active.is_some();
        if self.state().is_running() {
            self.set_state(ClientState::Closing);
        }

        self.cancel_timers();
        self.queue.close();
        self.teardown_active().await;
        if let Some(rx) = self.queue_rx.take() {
            let failed = rx.fail_pending(WebSocketError::ClientClosed);
            if failed > 0 {
                debug!(failed, "failed pending messages on stop");
            }
        }
        self.set_state(ClientState::Disconnected);

        if was_connected {
            self.handler.on_disconnected(&reason);
        }
    }

    async fn handle_fault(&mut self, generation: Generation, reason: DisconnectReason) {
        match self.active.as_ref() {
            Some(active) if active.generation == generation => {}
            _ => {
                debug!(generation = %generation, reason = %reason, "ignoring fault from stale generation");
                return;
            }
        }

        warn!(url = %self.config.url, generation = %generation, reason = %reason, "connection lost");
        self.teardown_active().await;
        self.set_state(ClientState::Connecting);
        self.handler.on_disconnected(&reason);
        if let Some(error) = reason.as_error() {
            self.report(error, Some(generation));
        }
        self.schedule_retry();
    }
}

/// Begin connecting. No-op while already `Connecting` or `Connected`.
pub struct Start;

/// Stop and release everything. Idempotent.
pub struct Stop;

pub struct GetConnectionStats;

#[doc(hidden)]
pub struct ConnectionEstablished<T: WsTransport> {
    attempt: u64,
    reader: T::Reader,
    writer: T::Writer,
}

#[doc(hidden)]
pub struct ConnectionFailed {
    attempt: u64,
    error: WebSocketError,
}

#[doc(hidden)]
pub struct RetryConnect {
    attempt: u64,
}

#[doc(hidden)]
pub struct ConnectionFault {
    generation: Generation,
    reason: DisconnectReason,
}

impl<H, C, T, R> KameoMessage<Start> for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Reply = WebSocketResult<()>;

    async fn handle(&mut self, _msg: Start, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.state() != ClientState::Disconnected {
            debug!(state = %self.state(), "start ignored");
            return Ok(());
        }

        if self.queue_rx.is_none() {
            self.queue_rx = self.queue.reopen();
        }
        self.reconnect.reset();
        self.set_state(ClientState::Connecting);
        self.begin_connect();
        Ok(())
    }
}

impl<H, C, T, R> KameoMessage<Stop> for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Reply = WebSocketResult<()>;

    async fn handle(&mut self, _msg: Stop, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.shutdown(DisconnectReason::Stopped).await;
        Ok(())
    }
}

impl<H, C, T, R> KameoMessage<ConnectionEstablished<T>> for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Reply = WebSocketResult<()>;

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.attempt != self.attempt_seq || self.state() != ClientState::Connecting {
            // Dropping both halves closes the superseded socket.
            debug!(attempt = msg.attempt, "discarding superseded connection");
            return Ok(());
        }
        self.connect_task = None;
        self.activate(msg.reader, msg.writer);
        Ok(())
    }
}

impl<H, C, T, R> KameoMessage<ConnectionFailed> for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Reply = WebSocketResult<()>;

    async fn handle(
        &mut self,
        msg: ConnectionFailed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.attempt != self.attempt_seq || self.state() != ClientState::Connecting {
            return Ok(());
        }
        self.connect_task = None;
        warn!(url = %self.config.url, attempt = msg.attempt, error = %msg.error, "connect failed");
        self.report(msg.error, None);
        self.schedule_retry();
        Ok(())
    }
}

impl<H, C, T, R> KameoMessage<RetryConnect> for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Reply = WebSocketResult<()>;

    async fn handle(
        &mut self,
        msg: RetryConnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.retry_task = None;
        if msg.attempt == self.attempt_seq && self.state() == ClientState::Connecting {
            self.begin_connect();
        }
        Ok(())
    }
}

impl<H, C, T, R> KameoMessage<ConnectionFault> for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Reply = WebSocketResult<()>;

    async fn handle(
        &mut self,
        msg: ConnectionFault,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.handle_fault(msg.generation, msg.reason).await;
        Ok(())
    }
}

impl<H, C, T, R> KameoMessage<GetConnectionStats> for WsSupervisor<H, C, T, R>
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    T: WsTransport,
    R: WsReconnectStrategy,
{
    type Reply = WebSocketResult<WsConnectionStats>;

    async fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.get_stats(
            self.state(),
            self.active.as_ref().map(|active| active.generation),
            self.reconnect.attempts(),
        ))
    }
}
