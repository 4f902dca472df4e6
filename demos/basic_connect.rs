use std::time::Duration;

use market_ws::{
    DisconnectReason, Generation, WsClient, WsClientArgs, WsClientConfig, WsClientHandler,
    WsErrorReport, WsFrame,
};
use tracing::{error, info, warn};

struct PrintHandler {
    subscribe: Option<String>,
}

impl WsClientHandler for PrintHandler {
    type Message = sonic_rs::Value;
    type Error = std::io::Error;

    fn on_connected(&self, generation: Generation) {
        info!(%generation, "connected");
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        warn!(%reason, "disconnected");
    }

    fn on_message(&self, message: sonic_rs::Value) -> Result<(), std::io::Error> {
        println!("{message}");
        Ok(())
    }

    fn on_error(&self, report: &WsErrorReport) {
        error!(%report, "client error");
    }

    fn initial_frames(&self) -> Vec<WsFrame> {
        self.subscribe.iter().cloned().map(WsFrame::text).collect()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // WS_CONFIG points at a TOML file; otherwise WS_URL with defaults.
    let config = match std::env::var("WS_CONFIG") {
        Ok(path) => WsClientConfig::from_toml_file(path)?,
        Err(_) => WsClientConfig::new(
            std::env::var("WS_URL").unwrap_or_else(|_| "wss://ws.kraken.com/v2".to_string()),
        ),
    };
    let handler = PrintHandler {
        subscribe: std::env::var("WS_SUBSCRIBE").ok(),
    };

    let client = WsClient::spawn(WsClientArgs::json(config, handler))?;
    client.start().await?;

    let run_for = std::env::var("WS_RUN_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(10));
    tokio::time::sleep(run_for).await;

    let stats = client.stats().await?;
    info!(
        connects = stats.connects,
        messages_in = stats.messages_in,
        p50_rtt_us = ?stats.p50_rtt_us,
        "final stats"
    );
    client.stop().await?;
    Ok(())
}
