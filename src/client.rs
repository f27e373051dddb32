//! The client facade.
//!
//! [`Tattle`] wires the context manager, the middleware pipeline, and the
//! sinks together behind the emit API. Emits are fire-and-forget: the
//! calling task hands the envelope to a bounded channel and returns, and a
//! single worker task runs the pipeline so envelopes from one scope reach
//! the sinks in production order.

use std::sync::{Arc, Mutex, RwLock};

use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::TattleConfig;
use crate::context::{merge_ctx, ContextManager, Ctx, ScopeBackend};
use crate::encoding::error_value;
use crate::envelope::{Envelope, Level, Record};
use crate::http::HttpSink;
use crate::pipeline::{
    run_worker, ErrorHook, Middleware, PipelineState, SharedPipeline, Sink,
};

/// Builder for [`Tattle`].
pub struct TattleBuilder {
    config: TattleConfig,
    backend: ScopeBackend,
    clock: Arc<dyn Clock>,
    middlewares: Vec<Arc<dyn Middleware>>,
    sinks: Vec<Arc<dyn Sink>>,
    error_hook: Option<ErrorHook>,
    shutdown: Option<CancellationToken>,
}

impl TattleBuilder {
    /// Select the scope propagation backend. Task-local is the default and
    /// the right choice whenever a Tokio runtime is present.
    pub fn backend(mut self, backend: ScopeBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn sink<S: Sink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Single diagnostic hook receiving every absorbed pipeline error.
    pub fn error_hook(mut self, hook: impl Fn(&crate::Error) + Send + Sync + 'static) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    /// Token the host cancels when it is about to exit; the config-built
    /// HTTP sink drains once when it fires.
    pub fn shutdown_signal(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Assemble the client and spawn its dispatch worker. Must be called
    /// inside a Tokio runtime.
    pub fn build(self) -> Tattle {
        let mut global = Ctx::new();
        if let Some(app) = &self.config.app {
            global.insert("app".to_string(), Value::from(app.clone()));
        }
        if let Some(version) = &self.config.version {
            global.insert("version".to_string(), Value::from(version.clone()));
        }

        let mut sinks = self.sinks;
        if let Some(http_config) = self.config.http.sink_config() {
            let mut http_builder = HttpSink::builder(http_config);
            if let Some(token) = &self.shutdown {
                http_builder = http_builder.shutdown(token.clone());
            }
            match http_builder.build() {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(err) => {
                    // A client without its HTTP sink still logs locally.
                    tracing::warn!(
                        telemetry.event = "http_sink_init_failed",
                        error = %err,
                        "Continuing without the configured HTTP sink"
                    );
                }
            }
        }

        let pipeline: SharedPipeline = Arc::new(RwLock::new(PipelineState {
            middlewares: self.middlewares,
            sinks,
            error_hook: self.error_hook,
        }));

        let (tx, rx) = mpsc::channel(self.config.queue.size.max(1));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(rx, Arc::clone(&pipeline), cancel.clone()));

        Tattle {
            inner: Arc::new(ClientInner {
                enabled: self.config.enabled,
                global: RwLock::new(global),
                ctx_manager: ContextManager::new(self.backend),
                clock: self.clock,
                pipeline,
                tx,
                cancel,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }
}

struct ClientInner {
    enabled: bool,
    global: RwLock<Ctx>,
    ctx_manager: ContextManager,
    clock: Arc<dyn Clock>,
    pipeline: SharedPipeline,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A telemetry client instance.
///
/// Cheap to clone; clones share the pipeline, the global context, and the
/// dispatch worker. The global base context belongs to the instance, never
/// to the process, so independent clients can coexist.
#[derive(Clone)]
pub struct Tattle {
    inner: Arc<ClientInner>,
}

impl Tattle {
    pub fn builder(config: TattleConfig) -> TattleBuilder {
        TattleBuilder {
            config,
            backend: ScopeBackend::default(),
            clock: Arc::new(SystemClock::new()),
            middlewares: Vec::new(),
            sinks: Vec::new(),
            error_hook: None,
            shutdown: None,
        }
    }

    pub fn debug(&self, msg: impl Into<String>, data: Option<Ctx>) {
        self.emit_log(Level::Debug, msg, data, None, None);
    }

    pub fn info(&self, msg: impl Into<String>, data: Option<Ctx>) {
        self.emit_log(Level::Info, msg, data, None, None);
    }

    pub fn warn(&self, msg: impl Into<String>, data: Option<Ctx>) {
        self.emit_log(Level::Warn, msg, data, None, None);
    }

    pub fn error(&self, msg: impl Into<String>, data: Option<Ctx>) {
        self.emit_log(Level::Error, msg, data, None, None);
    }

    /// Error log carrying a captured error chain.
    pub fn error_with<E>(&self, msg: impl Into<String>, data: Option<Ctx>, err: &E)
    where
        E: std::error::Error,
    {
        self.emit_log(Level::Error, msg, data, Some(error_value(err)), None);
    }

    pub fn track(&self, name: impl Into<String>, props: Option<Ctx>) {
        self.emit_event(name, props, None);
    }

    /// Full-control log emit, with an optional pre-captured error value and
    /// per-call context merged over the global and scope layers.
    pub fn emit_log(
        &self,
        level: Level,
        msg: impl Into<String>,
        data: Option<Ctx>,
        err: Option<Value>,
        per_call: Option<Ctx>,
    ) {
        let record = crate::envelope::LogRecord {
            level,
            msg: msg.into(),
            data,
            err,
        };
        self.emit(Record::Log(record), per_call);
    }

    /// Full-control event emit.
    pub fn emit_event(
        &self,
        name: impl Into<String>,
        props: Option<Ctx>,
        per_call: Option<Ctx>,
    ) {
        self.emit(Record::event(name, props), per_call);
    }

    /// Run `fut` with `ctx` overlaid on the current scope.
    pub async fn with_scope<F>(&self, ctx: Ctx, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        self.inner.ctx_manager.scope(ctx, fut).await
    }

    /// Run `f` with `ctx` overlaid on the current scope.
    pub fn with_scope_sync<R>(&self, ctx: Ctx, f: impl FnOnce() -> R) -> R {
        self.inner.ctx_manager.sync_scope(ctx, f)
    }

    /// Merge `ctx` into the instance's global base context. Existing keys
    /// are overwritten, absent keys are kept: the merge is monotonic.
    pub fn set_global_context(&self, ctx: Ctx) {
        if let Ok(mut global) = self.inner.global.write() {
            merge_ctx(&mut global, &ctx);
        }
    }

    pub fn global_context(&self) -> Ctx {
        self.inner
            .global
            .read()
            .map(|global| global.clone())
            .unwrap_or_default()
    }

    /// Append a middleware. Takes effect on subsequent dispatches only.
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        if let Ok(mut pipeline) = self.inner.pipeline.write() {
            pipeline.middlewares.push(Arc::new(middleware));
        }
    }

    /// Register a sink. Registrations are not deduplicated; registering the
    /// same sink twice delivers every envelope twice.
    pub fn add_sink<S: Sink + 'static>(&self, sink: S) {
        if let Ok(mut pipeline) = self.inner.pipeline.write() {
            pipeline.sinks.push(Arc::new(sink));
        }
    }

    /// Ask every sink to push buffered envelopes out now. Best effort:
    /// envelopes still in the dispatch channel are not waited for.
    pub async fn flush(&self) {
        for sink in self.sinks() {
            let _ = sink.flush().await;
        }
    }

    /// Flush and stop the sinks, then stop the dispatch worker. Emits after
    /// shutdown are dropped.
    pub async fn shutdown(&self) {
        // Give the worker a chance to drain what is already queued.
        tokio::task::yield_now().await;

        let sinks = self.sinks();
        for sink in &sinks {
            let _ = sink.flush().await;
        }
        for sink in &sinks {
            sink.stop().await;
        }

        self.inner.cancel.cancel();
        let handle = self
            .inner
            .worker
            .lock()
            .ok()
            .and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn sinks(&self) -> Vec<Arc<dyn Sink>> {
        self.inner
            .pipeline
            .read()
            .map(|pipeline| pipeline.sinks.clone())
            .unwrap_or_default()
    }

    fn emit(&self, record: Record, per_call: Option<Ctx>) {
        if !self.inner.enabled {
            return;
        }

        let ts = self.inner.clock.now_ms();

        // Effective context: global, then scope, then per-call values.
        let mut ctx = self.global_context();
        merge_ctx(&mut ctx, &self.inner.ctx_manager.current());
        if let Some(per_call) = per_call {
            merge_ctx(&mut ctx, &per_call);
        }

        let envelope = Envelope::new(ts, ctx, record);
        match self.inner.tx.try_send(envelope) {
            Ok(()) => {
                counter!("tattle.envelopes.emitted").increment(1);
            }
            Err(_) => {
                counter!("tattle.envelopes.dropped", "stage" => "dispatch_queue").increment(1);
                tracing::debug!(
                    telemetry.event = "dispatch_queue_full",
                    "Dropped an envelope on dispatch queue overflow"
                );
                let hook = self
                    .inner
                    .pipeline
                    .read()
                    .ok()
                    .and_then(|pipeline| pipeline.error_hook.clone());
                crate::pipeline::report(hook.as_ref(), &crate::Error::QueueFull);
            }
        }
    }
}
