use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

const NO_PING: u64 = u64::MAX;

/// Liveness bookkeeping for one connection generation.
///
/// The dispatcher stamps every inbound frame and the heartbeat task stamps its pings and
/// checks the silence. Timestamps are millisecond offsets from the generation's start
/// on tokio's clock, so a paused test runtime drives them deterministically.
#[derive(Debug)]
pub struct HeartbeatState {
    epoch: Instant,
    interval: Duration,
    timeout_multiple: u32,
    last_received_ms: AtomicU64,
    ping_sent_ms: AtomicU64,
}

impl HeartbeatState {
    pub fn new(interval: Duration, timeout_multiple: u32) -> Self {
        Self {
            epoch: Instant::now(),
            interval,
            timeout_multiple: timeout_multiple.max(1),
            last_received_ms: AtomicU64::new(0),
            ping_sent_ms: AtomicU64::new(NO_PING),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout_multiple(&self) -> u32 {
        self.timeout_multiple
    }

    /// Silence tolerated before the connection is declared dead.
    pub fn timeout(&self) -> Duration {
        self.interval.saturating_mul(self.timeout_multiple)
    }

    #[inline]
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis().min(u64::MAX as u128 - 1) as u64
    }

    #[inline]
    pub fn record_received(&self) {
        self.last_received_ms
            .store(self.elapsed_ms(), Ordering::Release);
    }

    pub fn record_ping(&self) {
        self.ping_sent_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    /// Round trip for the outstanding heartbeat ping, consumed by the first pong.
    pub fn take_ping_rtt(&self) -> Option<Duration> {
        let sent = self.ping_sent_ms.swap(NO_PING, Ordering::AcqRel);
        if sent == NO_PING {
            return None;
        }
        Some(Duration::from_millis(self.elapsed_ms().saturating_sub(sent)))
    }

    pub fn silent_for(&self) -> Duration {
        let last = self.last_received_ms.load(Ordering::Acquire);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    pub fn is_timed_out(&self) -> bool {
        self.silent_for() > self.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_only_after_interval_multiple() {
        let state = HeartbeatState::new(Duration::from_secs(1), 3);
        assert_eq!(state.timeout(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!state.is_timed_out());

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(state.is_timed_out());

        state.record_received();
        assert!(!state.is_timed_out());
        assert_eq!(state.silent_for(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_consumes_outstanding_ping() {
        let state = HeartbeatState::new(Duration::from_secs(5), 2);
        assert!(state.take_ping_rtt().is_none());

        state.record_ping();
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(state.take_ping_rtt(), Some(Duration::from_millis(40)));
        assert!(state.take_ping_rtt().is_none());
    }

    #[test]
    fn zero_multiple_is_clamped() {
        let state = HeartbeatState::new(Duration::from_secs(2), 0);
        assert_eq!(state.timeout_multiple(), 1);
    }
}
