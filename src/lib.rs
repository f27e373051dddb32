//! # Tattle
//!
//! Client-side telemetry pipeline for Tokio hosts.
//!
//! Tattle accepts structured log and event records from application code,
//! enriches them with contextual metadata, applies volume-control policies
//! (sampling, rate limiting, deduplication, secret masking), and delivers
//! them best-effort to one or more sinks (console, batched HTTP endpoint).
//!
//! The cardinal rule: telemetry never throws into application code. Every
//! entry point absorbs errors, emits are fire-and-forget, and back-pressure
//! is handled by dropping rather than stalling the caller.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tattle::{Tattle, TattleConfig};
//! use tattle::console::ConsoleSink;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = TattleConfig::default();
//!     config.app = Some("checkout".into());
//!     config.version = Some("1.4.2".into());
//!
//!     let client = Tattle::builder(config)
//!         .sink(ConsoleSink::new())
//!         .build();
//!
//!     client.info("service started", None);
//!     client
//!         .with_scope(tattle::ctx! { "request_id" => json!("r-42") }, async {
//!             client.track("page_view", None);
//!         })
//!         .await;
//!
//!     client.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Context propagation**: per-scope metadata follows async work across
//!   await points via task-local storage, with a thread-stack fallback.
//! - **Middleware pipeline**: ordered transformers with a single-pass,
//!   single-drop contract and isolated sink fan-out.
//! - **Volume control**: deterministic sampling, per-key token buckets,
//!   TTL-bounded deduplication, key-based secret masking.
//! - **Batched HTTP delivery**: bounded queue, size and timer flushing,
//!   exponential-backoff retry with jitter, shutdown drain.

pub mod client;
pub mod clock;
pub mod config;
pub mod console;
pub mod context;
pub mod dedupe;
pub mod encoding;
pub mod envelope;
pub mod http;
pub mod meta;
pub mod pipeline;
pub mod rate_limit;
pub mod rng;
pub mod sample;
pub mod secret;

mod recency;


pub use client::{Tattle, TattleBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TattleConfig;
pub use context::{ContextManager, Ctx, ScopeBackend};
pub use envelope::{Envelope, EventRecord, Level, LogRecord, Record};
pub use pipeline::{Decision, Middleware, ScopeKeyFn, Sink};
pub use rng::{RandomSource, ThreadRngSource};

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error during {operation}: {source}")]
    Http {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Middleware '{name}' failed: {message}")]
    Middleware { name: String, message: String },

    #[error("Sink '{name}' failed: {message}")]
    Sink { name: String, message: String },

    #[error("Dispatch queue is full")]
    QueueFull,
}

/// Build a [`Ctx`] from `"key" => value` pairs.
///
/// Values are anything `serde_json::Value` can be built from; combine with
/// [`serde_json::json!`] for nested structures.
#[macro_export]
macro_rules! ctx {
    () => { $crate::context::Ctx::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::context::Ctx::new();
        $(map.insert($key.to_string(), ::serde_json::Value::from($value));)+
        map
    }};
}
