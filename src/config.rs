//! Client configuration.
//!
//! Every recognised option has a default, so a TOML document only needs the keys it changes:
//!
//! ```toml
//! url = "wss://stream.example.com/ws"
//! proxy_host = "10.0.0.2"
//! proxy_port = 3128
//! ping_interval = "20s"
//! ping_timeout_multiple = 3
//! initial_backoff = "500ms"
//! max_backoff = "30s"
//! backoff_jitter = 0.2
//! send_queue_capacity = 4096
//!
//! [extra_headers]
//! X-Api-Key = "..."
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    ExponentialBackoffReconnect, WebSocketBufferConfig, WebSocketError, WebSocketResult,
    WsTlsConfig,
};
use crate::transport::WsConnectOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsClientConfig {
    pub url: String,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    pub ping_timeout_multiple: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub backoff_jitter: f64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub send_queue_capacity: usize,
    /// Upper bound on how long a blocking `enqueue` waits for queue space.
    #[serde(with = "humantime_serde")]
    pub enqueue_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub tls_verify: bool,
    pub extra_headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub buffers: WebSocketBufferConfig,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            proxy_host: None,
            proxy_port: None,
            ping_interval: Duration::from_secs(60),
            ping_timeout_multiple: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            backoff_jitter: 0.2,
            max_reconnect_attempts: None,
            send_queue_capacity: 1024,
            enqueue_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            tls_verify: true,
            extra_headers: BTreeMap::new(),
            buffers: WebSocketBufferConfig::default(),
        }
    }
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> WebSocketResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|err| WebSocketError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> WebSocketResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            WebSocketError::InvalidConfig(format!("{}: {err}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    #[must_use]
    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_host = Some(host.into());
        self.proxy_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_ping(mut self, interval: Duration, timeout_multiple: u32) -> Self {
        self.ping_interval = interval;
        self.ping_timeout_multiple = timeout_multiple;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration, jitter: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.backoff_jitter = jitter;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// `http://host:port`, only when both halves are configured.
    pub fn proxy_url(&self) -> Option<String> {
        match (self.proxy_host.as_deref(), self.proxy_port) {
            (Some(host), Some(port)) if !host.is_empty() => Some(format!("http://{host}:{port}")),
            _ => None,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.ping_interval.saturating_mul(self.ping_timeout_multiple)
    }

    pub fn connect_options(&self) -> WsConnectOptions {
        WsConnectOptions {
            proxy_url: self.proxy_url(),
            tls: WsTlsConfig {
                validate_certs: self.tls_verify,
            },
            extra_headers: self
                .extra_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            connect_timeout: self.connect_timeout,
            buffers: self.buffers,
        }
    }

    pub fn reconnect_strategy(&self) -> ExponentialBackoffReconnect {
        ExponentialBackoffReconnect::new(self.initial_backoff, self.max_backoff, self.backoff_factor)
            .with_jitter(self.backoff_jitter)
            .with_max_attempts(self.max_reconnect_attempts)
    }

    pub fn validate(&self) -> WebSocketResult<()> {
        let invalid = |msg: String| Err(WebSocketError::InvalidConfig(msg));

        if self.url.is_empty() {
            return invalid("url must not be empty".to_string());
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return invalid(format!("url must use ws:// or wss://, got {}", self.url));
        }
        if self.ping_interval.is_zero() {
            return invalid("ping_interval must be positive".to_string());
        }
        if self.ping_timeout_multiple < 1 {
            return invalid("ping_timeout_multiple must be at least 1".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return invalid(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                self.initial_backoff, self.max_backoff
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid(format!(
                "backoff_factor must be >= 1, got {}",
                self.backoff_factor
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return invalid(format!(
                "backoff_jitter must be within [0, 1], got {}",
                self.backoff_jitter
            ));
        }
        if self.send_queue_capacity == 0 {
            return invalid("send_queue_capacity must be positive".to_string());
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout must be positive".to_string());
        }
        if self.proxy_port == Some(0) {
            return invalid("proxy_port must be non-zero".to_string());
        }
        Ok(())
    }
}
