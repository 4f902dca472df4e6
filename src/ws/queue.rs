use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio::sync::oneshot;

use crate::core::{Generation, OutboundMessage, WebSocketError, WebSocketResult};

pub(crate) type DeliveryAck = oneshot::Sender<WebSocketResult<Generation>>;

/// One enqueued message plus the sender side of its optional receipt.
pub(crate) struct QueuedMessage<T> {
    pub message: OutboundMessage<T>,
    pub ack: Option<DeliveryAck>,
}

impl<T> QueuedMessage<T> {
    pub fn resolve(self, result: WebSocketResult<Generation>) {
        if let Some(ack) = self.ack {
            let _ = ack.send(result);
        }
    }
}

/// Resolves once the message reached the wire or was abandoned.
///
/// `Ok` carries the generation the message was written on. Errors are `TransportError` when
/// the write failed, `EncodeFailed` when the codec rejected it, `Stale` when its generation was
/// torn down mid-write and `ClientClosed` when the client stopped before sending it.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<WebSocketResult<Generation>>,
}

impl DeliveryReceipt {
    pub async fn wait(self) -> WebSocketResult<Generation> {
        self.rx.await.unwrap_or(Err(WebSocketError::ClientClosed))
    }
}

/// Bounded MPSC send queue shared by every client handle.
///
/// The producer side lives here; the consumer side is a [`QueueReceiver`] that moves between
/// the supervisor (while `Connecting`) and the current generation's send loop, so messages
/// enqueued during a reconnect window wait in the channel rather than being dropped.
pub(crate) struct SendQueue<T> {
    sender: RwLock<Option<mpsc::Sender<QueuedMessage<T>>>>,
    capacity: usize,
    enqueue_timeout: Duration,
}

impl<T: Send + 'static> SendQueue<T> {
    pub fn new(capacity: usize, enqueue_timeout: Duration) -> (Self, QueueReceiver<T>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                sender: RwLock::new(Some(tx)),
                capacity,
                enqueue_timeout,
            },
            QueueReceiver { rx },
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self) -> WebSocketResult<mpsc::Sender<QueuedMessage<T>>> {
        self.sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(WebSocketError::ClientClosed)
    }

    pub fn is_open(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Non-blocking enqueue.
    pub fn try_push(&self, item: QueuedMessage<T>) -> WebSocketResult<()> {
        match self.sender()?.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(WebSocketError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(WebSocketError::ClientClosed),
        }
    }

    /// Enqueue, waiting at most the configured timeout for space.
    pub async fn push(&self, item: QueuedMessage<T>) -> WebSocketResult<()> {
        let sender = self.sender()?;
        match sender.send_timeout(item, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(WebSocketError::QueueFull),
            Err(SendTimeoutError::Closed(_)) => Err(WebSocketError::ClientClosed),
        }
    }

    /// Reject every further enqueue with `ClientClosed`.
    pub fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    /// Fresh channel for a restart after `stop()`. Returns `None` while the queue is open.
    pub fn reopen(&self) -> Option<QueueReceiver<T>> {
        let mut guard = self
            .sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        *guard = Some(tx);
        Some(QueueReceiver { rx })
    }
}

pub(crate) struct QueueReceiver<T> {
    rx: mpsc::Receiver<QueuedMessage<T>>,
}

impl<T> QueueReceiver<T> {
    pub async fn recv(&mut self) -> Option<QueuedMessage<T>> {
        self.rx.recv().await
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Close the channel and fail everything still buffered with `error`. Producers blocked
    /// in `push` observe `ClientClosed`.
    pub fn fail_pending(mut self, error: WebSocketError) -> usize {
        self.rx.close();
        let mut failed = 0;
        while let Ok(item) = self.rx.try_recv() {
            item.resolve(Err(error.clone()));
            failed += 1;
        }
        failed
    }
}

pub(crate) fn receipt_pair() -> (DeliveryAck, DeliveryReceipt) {
    let (tx, rx) = oneshot::channel();
    (tx, DeliveryReceipt { rx })
}
