use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace, warn};

use super::GenerationContext;
use crate::core::{DisconnectReason, WsClientHandler, WsFrame};

/// Longest tick period the monitor schedules. Anything above never fires in practice and
/// would overflow `Instant` arithmetic.
const MAX_TICK_PERIOD: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn tick_period(interval: Duration) -> Duration {
    interval.min(MAX_TICK_PERIOD)
}

/// Heartbeat monitor for one generation: a ping every interval through the send loop, and a
/// fault once inbound silence exceeds `interval * timeout_multiple`.
pub(crate) async fn run_heartbeat<H, C>(ctx: GenerationContext<H, C>)
where
    H: WsClientHandler,
{
    let state = ctx.heartbeat.clone();
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let period = tick_period(state.interval());

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        if state.is_timed_out() {
            let silent_for = state.silent_for();
            warn!(
                generation = %ctx.generation,
                silent_ms = silent_for.as_millis() as u64,
                timeout_ms = state.timeout().as_millis() as u64,
                "heartbeat timeout"
            );
            ctx.fault
                .raise(DisconnectReason::HeartbeatTimeout { silent_for });
            break;
        }

        match ctx.control_tx.try_send(WsFrame::Ping(Bytes::new())) {
            Ok(()) => {
                trace!(generation = %ctx.generation, "heartbeat ping");
                state.record_ping();
            }
            Err(TrySendError::Full(_)) => {
                debug!(generation = %ctx.generation, "control channel full, skipping ping");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_period_is_clamped() {
        assert_eq!(tick_period(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(tick_period(Duration::MAX), MAX_TICK_PERIOD);
    }

    #[test]
    fn core_heartbeat_module_is_reachable_through_ws() {
        let state = crate::ws::heartbeat::HeartbeatState::new(Duration::from_secs(1), 2);
        assert_eq!(state.timeout(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_interval_schedules_without_overflow() {
        let period = tick_period(Duration::MAX);
        let mut ticker = interval_at(Instant::now() + period, period);
        tokio::select! {
            _ = ticker.tick() => panic!("tick fired"),
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
        }
    }
}
