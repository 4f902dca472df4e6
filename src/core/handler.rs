use super::frame::WsFrame;
use super::types::{DisconnectReason, Generation, WsErrorReport};

/// Application capability interface driven by the client.
///
/// `on_message` runs on the dispatcher task and the next frame is not read until it returns,
/// so a slow implementation stalls delivery for that connection generation. The lifecycle
/// callbacks run on the supervisor actor. None of them may block indefinitely.
pub trait WsClientHandler: Send + Sync + 'static {
    type Message: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn on_connected(&self, _generation: Generation) {}

    fn on_disconnected(&self, _reason: &DisconnectReason) {}

    fn on_message(&self, message: Self::Message) -> Result<(), Self::Error>;

    fn on_error(&self, report: &WsErrorReport) {
        tracing::error!(
            generation = ?report.generation,
            error = %report.error,
            last_sent = report.last_sent.as_deref().unwrap_or(""),
            last_received = report.last_received.as_deref().unwrap_or(""),
            "unhandled websocket error"
        );
    }

    /// Frames written first on every new generation (auth, subscriptions), ahead of any
    /// queued application message.
    fn initial_frames(&self) -> Vec<WsFrame> {
        Vec::new()
    }
}
