//! Client configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::http::{HttpSinkConfig, RetryConfig};
use crate::{Error, Result};

/// Constructor-time configuration for [`crate::Tattle`].
///
/// All options are fixed at construction; there is no live reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TattleConfig {
    /// Global enable/disable toggle. Disabled clients drop every record at
    /// the facade, before the pipeline.
    pub enabled: bool,

    /// Application name, seeded into the global context as `app`.
    pub app: Option<String>,

    /// Application version, seeded into the global context as `version`.
    pub version: Option<String>,

    /// Dispatch queue between the facade and the pipeline worker.
    pub queue: QueueConfig,

    /// Batched HTTP delivery settings.
    pub http: HttpConfig,
}

impl Default for TattleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app: None,
            version: None,
            queue: QueueConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Dispatch queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Channel capacity. Overflow drops envelopes; emitting never blocks.
    pub size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { size: 1024 }
    }
}

/// HTTP delivery configuration. When an endpoint is set, the client builds
/// and registers an [`crate::http::HttpSink`] for it at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Collector URL. `None` disables the built-in HTTP sink.
    pub endpoint: Option<String>,

    /// Periodic flush interval; 0 disables the timer (size and manual
    /// flushes still work).
    pub flush_interval_ms: u64,

    /// Envelopes per POST.
    pub max_batch: usize,

    /// Queue bound; overflow drops.
    pub max_queue: usize,

    /// On overflow, discard from the front (keep the newest) rather than
    /// dropping the incoming envelope.
    pub drop_oldest: bool,

    /// Extra request headers.
    pub headers: HashMap<String, String>,

    /// Drain the queue once when the shutdown signal fires.
    pub flush_on_shutdown: bool,

    pub retry: RetryConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            flush_interval_ms: 2000,
            max_batch: 50,
            max_queue: 1000,
            drop_oldest: true,
            headers: HashMap::new(),
            flush_on_shutdown: true,
            retry: RetryConfig::default(),
        }
    }
}

impl HttpConfig {
    /// Sink configuration for the configured endpoint, if any.
    pub fn sink_config(&self) -> Option<HttpSinkConfig> {
        let url = self.endpoint.clone()?;
        let mut config = HttpSinkConfig::new(url);
        config.flush_interval_ms = self.flush_interval_ms;
        config.max_batch = self.max_batch;
        config.max_queue = self.max_queue;
        config.drop_oldest = self.drop_oldest;
        config.headers = self.headers.clone();
        config.flush_on_shutdown = self.flush_on_shutdown;
        config.retry = self.retry.clone();
        Some(config)
    }
}

impl TattleConfig {
    /// Parse a configuration document, then apply environment overrides.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: TattleConfig = serde_json::from_str(content)?;
        config.load_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn load_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TATTLE_ENABLED") {
            self.enabled = enabled.parse().unwrap_or(self.enabled);
        }

        if let Ok(app) = std::env::var("TATTLE_APP") {
            if !app.is_empty() {
                self.app = Some(app);
            }
        }

        if let Ok(queue_size) = std::env::var("TATTLE_QUEUE_SIZE") {
            self.queue.size = queue_size.parse().unwrap_or(self.queue.size);
        }

        if let Ok(endpoint) = std::env::var("TATTLE_ENDPOINT") {
            if !endpoint.is_empty() {
                self.http.endpoint = Some(endpoint);
            }
        }

        if let Ok(interval) = std::env::var("TATTLE_FLUSH_INTERVAL_MS") {
            self.http.flush_interval_ms = interval.parse().unwrap_or(self.http.flush_interval_ms);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.size == 0 {
            return Err(Error::Config {
                message: "queue.size must be greater than 0".to_string(),
            });
        }

        if self.http.max_batch == 0 {
            return Err(Error::Config {
                message: "http.max_batch must be greater than 0".to_string(),
            });
        }

        if self.http.max_queue == 0 {
            return Err(Error::Config {
                message: "http.max_queue must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.http.retry.jitter) {
            return Err(Error::Config {
                message: "http.retry.jitter must be within [0, 1]".to_string(),
            });
        }

        Ok(())
    }
}
