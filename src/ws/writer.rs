use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::GenerationContext;
use super::queue::{QueueReceiver, QueuedMessage};
use crate::core::{DisconnectReason, WebSocketError, WsClientHandler, WsCodec, WsFrame};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

enum WriteOutcome {
    Written,
    Failed(WebSocketError),
    Shutdown,
}

enum Next<T> {
    Control(WsFrame),
    Queued(QueuedMessage<T>),
    Stop,
}

/// Send loop for one generation.
///
/// Drains control frames (initial frames, heartbeat pings, pong replies) ahead of the
/// application queue and writes one frame at a time, so queued messages reach the wire in
/// enqueue order. Returns the queue receiver so the next generation resumes where this one
/// stopped.
pub(crate) async fn run_send_loop<H, C, W>(
    ctx: GenerationContext<H, C>,
    mut writer: W,
    mut control_rx: mpsc::Receiver<WsFrame>,
    mut queue: QueueReceiver<C::Outbound>,
) -> QueueReceiver<C::Outbound>
where
    H: WsClientHandler,
    C: WsCodec,
    W: Sink<WsFrame, Error = WebSocketError> + Send + Unpin + 'static,
{
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let generation = ctx.generation;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => Next::Stop,
            Some(frame) = control_rx.recv() => Next::Control(frame),
            item = queue.recv() => match item {
                Some(item) => Next::Queued(item),
                None => Next::Stop,
            },
        };

        match next {
            Next::Stop => break,
            Next::Control(frame) => {
                trace!(generation = %generation, kind = ?frame.kind(), "writing control frame");
                match write_frame(&ctx, &mut writer, &mut shutdown_rx, frame).await {
                    WriteOutcome::Written => {}
                    WriteOutcome::Shutdown => break,
                    WriteOutcome::Failed(err) => {
                        ctx.fault.raise(DisconnectReason::WriteFailure {
                            error: err.to_string(),
                        });
                        return queue;
                    }
                }
            }
            Next::Queued(item) => {
                let frame = match ctx.codec.encode(&item.message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(generation = %generation, error = %err, "dropping unencodable message");
                        ctx.report(err.clone());
                        item.resolve(Err(err));
                        continue;
                    }
                };

                match write_frame(&ctx, &mut writer, &mut shutdown_rx, frame).await {
                    WriteOutcome::Written => item.resolve(Ok(generation)),
                    WriteOutcome::Shutdown => {
                        item.resolve(Err(WebSocketError::Stale { generation }));
                        break;
                    }
                    WriteOutcome::Failed(err) => {
                        item.resolve(Err(err.clone()));
                        ctx.fault.raise(DisconnectReason::WriteFailure {
                            error: err.to_string(),
                        });
                        return queue;
                    }
                }
            }
        }
    }

    match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => debug!(generation = %generation, "writer closed"),
        Ok(Err(err)) => debug!(generation = %generation, error = %err, "writer close failed"),
        Err(_) => debug!(generation = %generation, "writer close timed out"),
    }
    queue
}

async fn write_frame<H, C, W>(
    ctx: &GenerationContext<H, C>,
    writer: &mut W,
    shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
    frame: WsFrame,
) -> WriteOutcome
where
    H: WsClientHandler,
    C: WsCodec,
    W: Sink<WsFrame, Error = WebSocketError> + Unpin,
{
    ctx.health.record_outbound(&frame);
    let result = tokio::select! {
        biased;
        _ = shutdown_rx.changed() => return WriteOutcome::Shutdown,
        result = writer.send(frame) => result,
    };

    match result {
        Ok(()) => WriteOutcome::Written,
        Err(err) => WriteOutcome::Failed(err),
    }
}
