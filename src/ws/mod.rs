pub mod actor;
pub mod client;
mod monitor;
mod queue;
mod reader;
mod writer;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

pub use crate::core::*;

pub use actor::*;
pub use client::*;
pub use queue::DeliveryReceipt;

/// Control frames buffered per generation before pings are skipped and pong replies dropped.
pub(crate) const CONTROL_CAPACITY: usize = 64;

/// Fault callback handed to one generation's tasks.
///
/// Raising never blocks: the supervisor may be awaiting the very task that raises.
#[derive(Clone)]
pub(crate) struct FaultSignal {
    generation: Generation,
    notify: Arc<dyn Fn(Generation, DisconnectReason) + Send + Sync>,
}

impl FaultSignal {
    pub fn new(
        generation: Generation,
        notify: Arc<dyn Fn(Generation, DisconnectReason) + Send + Sync>,
    ) -> Self {
        Self {
            generation,
            notify,
        }
    }

    pub fn raise(&self, reason: DisconnectReason) {
        (self.notify)(self.generation, reason);
    }
}

/// State shared by the dispatcher, send loop and heartbeat monitor of one generation.
pub(crate) struct GenerationContext<H, C> {
    pub generation: Generation,
    pub handler: Arc<H>,
    pub codec: Arc<C>,
    pub health: Arc<WsHealthMonitor>,
    pub heartbeat: Arc<HeartbeatState>,
    /// Initial frames, heartbeat pings and pong replies, ahead of the send queue.
    pub control_tx: mpsc::Sender<WsFrame>,
    /// Whether the dispatcher replies to server pings itself.
    pub answer_pings: bool,
    pub shutdown_rx: watch::Receiver<bool>,
    pub fault: FaultSignal,
}

impl<H, C> Clone for GenerationContext<H, C> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            handler: self.handler.clone(),
            codec: self.codec.clone(),
            health: self.health.clone(),
            heartbeat: self.heartbeat.clone(),
            control_tx: self.control_tx.clone(),
            answer_pings: self.answer_pings,
            shutdown_rx: self.shutdown_rx.clone(),
            fault: self.fault.clone(),
        }
    }
}

impl<H: WsClientHandler, C> GenerationContext<H, C> {
    /// Record `error` and hand it to `on_error`. Never tears the connection down.
    pub fn report(&self, error: WebSocketError) {
        let report = self.health.report(error, Some(self.generation));
        self.handler.on_error(&report);
    }
}
