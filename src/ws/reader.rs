use std::panic::{AssertUnwindSafe, catch_unwind};

use futures_util::{Stream, StreamExt};
use tracing::{debug, trace};

use super::GenerationContext;
use crate::core::{DisconnectReason, WebSocketError, WsClientHandler, WsCodec, WsFrame};

/// Receive dispatcher for one generation.
///
/// Every frame counts as liveness. Control frames stay inside the client, and server pings
/// are answered here unless the transport already does it. Data frames are
/// decoded and handed to `on_message` inline, so the next frame is not read until the callback
/// returns. Decode and callback failures are reported and skipped.
pub(crate) async fn run_dispatcher<H, C, R>(ctx: GenerationContext<H, C>, mut reader: R)
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
    R: Stream<Item = Result<WsFrame, WebSocketError>> + Send + Unpin + 'static,
{
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let generation = ctx.generation;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            next = reader.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(generation = %generation, error = %err, "read failed");
                ctx.fault.raise(DisconnectReason::ReadFailure {
                    error: err.to_string(),
                });
                break;
            }
            None => {
                debug!(generation = %generation, "inbound stream ended");
                ctx.fault.raise(DisconnectReason::StreamEnded);
                break;
            }
        };

        ctx.heartbeat.record_received();
        ctx.health.record_inbound(&frame);

        match frame {
            WsFrame::Ping(payload) if ctx.answer_pings => {
                if ctx.control_tx.try_send(WsFrame::Pong(payload)).is_ok() {
                    trace!(generation = %generation, "answering server ping");
                } else {
                    debug!(generation = %generation, "control channel full, dropping pong");
                }
            }
            WsFrame::Ping(_) => {}
            WsFrame::Pong(_) => {
                if let Some(rtt) = ctx.heartbeat.take_ping_rtt() {
                    trace!(generation = %generation, rtt_ms = rtt.as_millis() as u64, "pong");
                    ctx.health.record_rtt(rtt);
                }
            }
            WsFrame::Close(close) => {
                let (code, reason) = match close {
                    Some(close) => (
                        Some(close.code),
                        String::from_utf8_lossy(&close.reason).into_owned(),
                    ),
                    None => (None, String::new()),
                };
                ctx.fault
                    .raise(DisconnectReason::RemoteClosed { code, reason });
                break;
            }
            data => dispatch(&ctx, &data),
        }
    }
}

fn dispatch<H, C>(ctx: &GenerationContext<H, C>, frame: &WsFrame)
where
    H: WsClientHandler<Message = C::Inbound>,
    C: WsCodec,
{
    let message = match ctx.codec.decode(frame) {
        Ok(message) => message,
        Err(err) => {
            ctx.health.record_decode_error();
            debug!(generation = %ctx.generation, error = %err, "skipping undecodable frame");
            ctx.report(err);
            return;
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| ctx.handler.on_message(message)));
    let error = match outcome {
        Ok(Ok(())) => {
            ctx.health.record_delivered();
            return;
        }
        Ok(Err(err)) => WebSocketError::CallbackFailed(err.to_string()),
        Err(panic) => WebSocketError::CallbackFailed(panic_message(&*panic)),
    };
    ctx.health.record_callback_error();
    ctx.report(error);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("on_message panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("on_message panicked: {msg}")
    } else {
        "on_message panicked".to_string()
    }
}
