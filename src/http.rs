//! Batched HTTP delivery sink.
//!
//! Envelopes queue in memory and leave in batches, either when the queue
//! reaches the batch size, on a periodic timer, on an explicit flush, or in
//! a final best-effort drain when the host signals shutdown. The queue is
//! bounded; overflow drops envelopes instead of blocking the emitter. At
//! most one flush runs at a time, so batches reach the wire in queue order.
//!
//! Failed posts retry with capped exponential backoff and jitter. A batch
//! lives only in its flush attempt: exhausted retries and non-retryable
//! statuses discard it rather than re-enqueueing.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::header;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::encoding::to_single_line;
use crate::envelope::Envelope;
use crate::pipeline::Sink;
use crate::rng::{RandomSource, ThreadRngSource};
use crate::{Error, Result};

/// Why a flush started. Shutdown drains request keepalive delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Timer,
    Size,
    Manual,
    Shutdown,
}

/// Retry policy for one batch post.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the initial one.
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Jitter fraction in `[0, 1]`; each delay is scaled by a factor drawn
    /// uniformly from `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,

    /// Statuses worth retrying. `None` means 408, 429, and 500 through 599.
    pub retry_on_status: Option<Vec<u16>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 5000,
            jitter: 0.2,
            retry_on_status: None,
        }
    }
}

impl RetryConfig {
    fn is_retryable(&self, status: u16) -> bool {
        match &self.retry_on_status {
            Some(list) => list.contains(&status),
            None => status == 408 || status == 429 || (500..=599).contains(&status),
        }
    }

    /// Backoff after failed attempt `attempt` (zero-based).
    fn delay_ms(&self, attempt: u32, random: &dyn RandomSource) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let exp = self.base_delay_ms.saturating_mul(factor);
        let capped = exp.min(self.max_delay_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let scale = (1.0 - jitter) + 2.0 * jitter * random.next_f64();
        ((capped as f64 * scale).floor()).max(0.0) as u64
    }
}

/// Configuration for [`HttpSink`].
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub url: String,

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

    /// Drain the queue once when the shutdown token fires.
    pub flush_on_shutdown: bool,

    pub retry: RetryConfig,
}

impl HttpSinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
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

/// Transforms an envelope into its wire entry. The default sends the whole
/// envelope.
pub type MapEntryFn = Arc<dyn Fn(&Envelope) -> Value + Send + Sync>;

/// The wire: one POST, one status code. Network failures surface as errors
/// and are treated like retryable statuses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: String,
        keepalive: bool,
    ) -> Result<u16>;
}

/// Production transport backed by a shared [`reqwest::Client`].
///
/// The keepalive flag is advisory here: connection reuse is reqwest's
/// default, and the shutdown drain detaches its request instead of relying
/// on a beacon API.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| Error::Transport {
                message: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: String,
        _keepalive: bool,
    ) -> Result<u16> {
        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| Error::Http {
            operation: "batch_post".to_string(),
            source: e,
        })?;

        Ok(response.status().as_u16())
    }
}

/// Builder for [`HttpSink`], mainly for injecting the transport, RNG, and
/// shutdown signal.
pub struct HttpSinkBuilder {
    config: HttpSinkConfig,
    map_entry: Option<MapEntryFn>,
    transport: Option<Arc<dyn HttpTransport>>,
    random: Option<Arc<dyn RandomSource>>,
    shutdown: Option<CancellationToken>,
}

impl HttpSinkBuilder {
    pub fn map_entry(mut self, map_entry: MapEntryFn) -> Self {
        self.map_entry = Some(map_entry);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// Token the host cancels when it is about to exit or go hidden.
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Must be called inside a Tokio runtime; the timer and shutdown
    /// listener are spawned here.
    pub fn build(self) -> Result<HttpSink> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let inner = Arc::new(SinkInner {
            config: self.config,
            map_entry: self
                .map_entry
                .unwrap_or_else(|| Arc::new(default_map_entry)),
            transport,
            random: self
                .random
                .unwrap_or_else(|| Arc::new(ThreadRngSource::new())),
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let sink = HttpSink { inner };
        sink.spawn_timer();
        if let Some(token) = self.shutdown {
            sink.spawn_shutdown_listener(token);
        }
        Ok(sink)
    }
}

fn default_map_entry(envelope: &Envelope) -> Value {
    serde_json::to_value(envelope).unwrap_or(Value::Null)
}

struct SinkInner {
    config: HttpSinkConfig,
    map_entry: MapEntryFn,
    transport: Arc<dyn HttpTransport>,
    random: Arc<dyn RandomSource>,
    queue: Mutex<VecDeque<Envelope>>,
    flushing: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded-queue, batching HTTP sink.
pub struct HttpSink {
    inner: Arc<SinkInner>,
}

impl HttpSink {
    /// Sink with the production transport and RNG. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: HttpSinkConfig) -> HttpSinkBuilder {
        HttpSinkBuilder {
            config,
            map_entry: None,
            transport: None,
            random: None,
            shutdown: None,
        }
    }

    fn spawn_timer(&self) {
        let interval_ms = self.inner.config.flush_interval_ms;
        if interval_ms == 0 {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                inner.flush(FlushReason::Timer).await;
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(handle);
        }
    }

    fn spawn_shutdown_listener(&self, token: CancellationToken) {
        if !self.inner.config.flush_on_shutdown {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                inner.drain_for_shutdown();
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(handle);
        }
    }
}

impl SinkInner {
    /// Append to the queue; the return value asks for a size-triggered
    /// flush. Never blocks.
    fn enqueue(&self, envelope: Envelope) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let Ok(mut queue) = self.queue.lock() else {
            return false;
        };

        if queue.len() >= self.config.max_queue {
            if self.config.drop_oldest {
                while queue.len() >= self.config.max_queue {
                    queue.pop_front();
                    counter!("tattle.http.dropped", "reason" => "queue_overflow").increment(1);
                }
            } else {
                counter!("tattle.http.dropped", "reason" => "queue_overflow").increment(1);
                return false;
            }
        }

        queue.push_back(envelope);
        queue.len() >= self.config.max_batch
    }

    fn splice_batch(&self) -> Vec<Envelope> {
        let Ok(mut queue) = self.queue.lock() else {
            return Vec::new();
        };
        let take = queue.len().min(self.config.max_batch);
        queue.drain(..take).collect()
    }

    fn build_body(&self, batch: &[Envelope]) -> String {
        let entries: Vec<Value> = batch
            .iter()
            .map(|envelope| {
                // map_entry is user code; a panic must not kill the flush.
                std::panic::catch_unwind(AssertUnwindSafe(|| (self.map_entry)(envelope)))
                    .unwrap_or(Value::Null)
            })
            .collect();
        to_single_line(&json!({ "entries": entries }))
    }

    async fn flush(self: &Arc<Self>, reason: FlushReason) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        loop {
            let batch = self.splice_batch();
            if batch.is_empty() {
                break;
            }
            tracing::debug!(
                telemetry.event = "http_flush",
                reason = ?reason,
                batch_size = batch.len(),
                "Flushing telemetry batch"
            );
            self.post_with_retry(&batch).await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
        }

        self.flushing.store(false, Ordering::SeqCst);
    }

    async fn post_with_retry(self: &Arc<Self>, batch: &[Envelope]) {
        let body = self.build_body(batch);
        let mut attempt: u32 = 0;

        loop {
            let outcome = self
                .transport
                .post(&self.config.url, &self.config.headers, body.clone(), false)
                .await;

            match outcome {
                Ok(status) if (200..300).contains(&status) => {
                    counter!("tattle.http.delivered").increment(batch.len() as u64);
                    return;
                }
                Ok(status) if !self.config.retry.is_retryable(status) => {
                    counter!("tattle.http.dropped", "reason" => "rejected")
                        .increment(batch.len() as u64);
                    tracing::warn!(
                        telemetry.event = "http_batch_rejected",
                        status,
                        batch_size = batch.len(),
                        "Endpoint rejected a telemetry batch"
                    );
                    return;
                }
                Ok(status) => {
                    tracing::debug!(
                        telemetry.event = "http_retryable_status",
                        status,
                        attempt,
                        "Telemetry post failed with a retryable status"
                    );
                }
                Err(err) => {
                    tracing::debug!(
                        telemetry.event = "http_transport_error",
                        error = %err,
                        attempt,
                        "Telemetry post failed in the transport"
                    );
                }
            }

            if attempt >= self.config.retry.retries {
                counter!("tattle.http.dropped", "reason" => "retries_exhausted")
                    .increment(batch.len() as u64);
                tracing::warn!(
                    telemetry.event = "http_retries_exhausted",
                    attempts = attempt + 1,
                    batch_size = batch.len(),
                    "Giving up on a telemetry batch"
                );
                return;
            }

            let delay = self.config.retry.delay_ms(attempt, self.random.as_ref());
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;

            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Best-effort final drain: one detached keepalive POST, no retries,
    /// never panics.
    fn drain_for_shutdown(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let batch = self.splice_batch();
        if batch.is_empty() {
            return;
        }
        let body = self.build_body(&batch);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _ = inner
                .transport
                .post(&inner.config.url, &inner.config.headers, body, true)
                .await;
        });
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        if self.inner.enqueue(envelope.clone()) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.flush(FlushReason::Size).await;
            });
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush(FlushReason::Manual).await;
        Ok(())
    }

    async fn stop(&self) {
        self.inner.stop();
    }
}

impl Drop for HttpSink {
    fn drop(&mut self) {
        self.inner.stop();
    }
}
