use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hdrhistogram::Histogram;

use super::circular_buffer::CircularBuffer;
use super::frame::{WsFrame, frame_bytes};
use super::types::{
    ClientState, Generation, WebSocketError, WsConnectionStats, WsErrorReport, now_epoch_us,
};

const MAX_RECENT_ERRORS: usize = 100;
pub const MAX_DIAGNOSTIC_TEXT_BYTES: usize = 1000;

#[derive(Debug, Clone)]
struct ErrorRec {
    _timestamp: Instant,
    _generation: Option<Generation>,
    _error: WebSocketError,
}

/// Cut `s` to at most `MAX_DIAGNOSTIC_TEXT_BYTES` on a char boundary.
pub fn truncate_text(s: &str) -> String {
    if s.len() <= MAX_DIAGNOSTIC_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_DIAGNOSTIC_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client-wide counters and diagnostics shared by the supervisor and every generation's tasks.
#[derive(Debug)]
pub struct WsHealthMonitor {
    connects: AtomicU64,
    frames_in: AtomicU64,
    messages_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    decode_errors: AtomicU64,
    callback_errors: AtomicU64,
    recent_errors: Mutex<CircularBuffer<ErrorRec>>,
    rtt_histogram: Mutex<Option<Histogram<u64>>>,
    last_sent: Mutex<Option<Bytes>>,
    last_received: Mutex<Option<Bytes>>,
}

impl Default for WsHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl WsHealthMonitor {
    pub fn new() -> Self {
        Self {
            connects: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
            recent_errors: Mutex::new(CircularBuffer::new(MAX_RECENT_ERRORS)),
            rtt_histogram: Mutex::new(Histogram::new_with_bounds(1, 60_000_000, 3).ok()),
            last_sent: Mutex::new(None),
            last_received: Mutex::new(None),
        }
    }

    pub fn record_connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound(&self, frame: &WsFrame) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        if let Some(bytes) = frame_bytes(frame) {
            self.bytes_in
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        if let WsFrame::Text(bytes) = frame {
            *lock(&self.last_received) = Some(bytes.clone());
        }
    }

    pub fn record_outbound(&self, frame: &WsFrame) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        if let Some(bytes) = frame_bytes(frame) {
            self.bytes_out
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        if let WsFrame::Text(bytes) = frame {
            *lock(&self.last_sent) = Some(bytes.clone());
        }
    }

    pub fn record_delivered(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_error(&self) {
        self.callback_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtt(&self, rtt: Duration) {
        let micros = rtt.as_micros().clamp(1, u64::MAX as u128) as u64;
        if let Some(histogram) = lock(&self.rtt_histogram).as_mut() {
            let _ = histogram.record(micros);
        }
    }

    pub fn last_sent_text(&self) -> Option<String> {
        lock(&self.last_sent)
            .as_ref()
            .map(|bytes| truncate_text(&String::from_utf8_lossy(bytes)))
    }

    pub fn last_received_text(&self) -> Option<String> {
        lock(&self.last_received)
            .as_ref()
            .map(|bytes| truncate_text(&String::from_utf8_lossy(bytes)))
    }

    /// Record `error` and build the report handed to `on_error`.
    pub fn report(&self, error: WebSocketError, generation: Option<Generation>) -> WsErrorReport {
        lock(&self.recent_errors).push(ErrorRec {
            _timestamp: Instant::now(),
            _generation: generation,
            _error: error.clone(),
        });
        WsErrorReport {
            error,
            generation,
            at_epoch_us: now_epoch_us(),
            last_sent: self.last_sent_text(),
            last_received: self.last_received_text(),
        }
    }

    pub fn get_stats(
        &self,
        state: ClientState,
        generation: Option<Generation>,
        reconnect_attempt: u32,
    ) -> WsConnectionStats {
        let (p50, p99, samples) = match lock(&self.rtt_histogram).as_ref() {
            Some(histogram) if !histogram.is_empty() => (
                histogram.value_at_percentile(50.0),
                histogram.value_at_percentile(99.0),
                histogram.len(),
            ),
            _ => (0, 0, 0),
        };
        let connects = self.connects.load(Ordering::Relaxed);

        WsConnectionStats {
            state,
            generation,
            reconnect_attempt,
            connects,
            reconnects: connects.saturating_sub(1),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            recent_errors: lock(&self.recent_errors).len(),
            p50_rtt_us: p50,
            p99_rtt_us: p99,
            rtt_samples: samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_rtt_percentiles() {
        let monitor = WsHealthMonitor::new();
        monitor.record_rtt(Duration::from_micros(100));
        monitor.record_rtt(Duration::from_micros(200));
        monitor.record_rtt(Duration::from_micros(300));

        let stats = monitor.get_stats(ClientState::Connected, Some(Generation::new(1)), 0);
        assert_eq!(stats.rtt_samples, 3);
        assert_eq!(stats.p50_rtt_us, 200);
        assert_eq!(stats.p99_rtt_us, 300);
    }

    #[test]
    fn report_carries_last_texts() {
        let monitor = WsHealthMonitor::new();
        monitor.record_outbound(&WsFrame::text_static(r#"{"op":"subscribe"}"#));
        monitor.record_inbound(&WsFrame::text_static("garbage"));
        monitor.record_inbound(&WsFrame::Ping(Bytes::from_static(b"hb")));

        let report = monitor.report(
            WebSocketError::DecodeFailed("expected value".to_string()),
            Some(Generation::new(2)),
        );
        assert_eq!(report.last_sent.as_deref(), Some(r#"{"op":"subscribe"}"#));
        assert_eq!(report.last_received.as_deref(), Some("garbage"));
        assert_eq!(report.generation, Some(Generation::new(2)));

        let stats = monitor.get_stats(ClientState::Connected, None, 0);
        assert_eq!(stats.frames_in, 2);
        assert_eq!(stats.bytes_in, 9);
        assert_eq!(stats.frames_out, 1);
        assert_eq!(stats.recent_errors, 1);
    }

    #[test]
    fn recent_errors_are_bounded() {
        let monitor = WsHealthMonitor::new();
        for _ in 0..105 {
            monitor.report(WebSocketError::QueueFull, None);
        }
        let stats = monitor.get_stats(ClientState::Disconnected, None, 0);
        assert_eq!(stats.recent_errors, MAX_RECENT_ERRORS);
    }

    #[test]
    fn diagnostic_text_is_capped_on_char_boundary() {
        let huge = "é".repeat(MAX_DIAGNOSTIC_TEXT_BYTES);
        let truncated = truncate_text(&huge);
        assert!(truncated.len() <= MAX_DIAGNOSTIC_TEXT_BYTES);
        assert!(truncated.len() >= MAX_DIAGNOSTIC_TEXT_BYTES - 1);
    }

    #[test]
    fn reconnects_count_connections_after_the_first() {
        let monitor = WsHealthMonitor::new();
        monitor.record_connected();
        monitor.record_connected();
        monitor.record_connected();
        let stats = monitor.get_stats(ClientState::Connected, Some(Generation::new(3)), 0);
        assert_eq!(stats.connects, 3);
        assert_eq!(stats.reconnects, 2);
    }
}
