//! Middleware chain and sink fan-out.
//!
//! The pipeline folds each envelope through its middlewares in registration
//! order. A middleware mutates the envelope in place and returns a
//! [`Decision`]: `Pass` hands it to the next stage, `Drop` consumes it. The
//! fold makes the single-pass, single-drop contract hold by construction;
//! there is no continuation to call twice.
//!
//! The terminal step delivers the envelope to every registered sink
//! concurrently. Sink failures are absorbed and isolated: one sink erroring
//! or panicking never affects its siblings, the chain, or the caller.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::{Error, Result};

/// What a middleware did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Hand the envelope to the next stage.
    Pass,
    /// Consume the envelope; downstream never sees it.
    Drop,
}

/// An envelope transformer.
///
/// Implementations may suspend; shared state must be guarded internally and
/// never held across an await.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &mut Envelope) -> Result<Decision>;
}

/// A terminal consumer of envelopes.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    async fn deliver(&self, envelope: &Envelope) -> Result<()>;

    /// Push any buffered envelopes out now. Best effort.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Stop accepting envelopes and release resources. Idempotent.
    async fn stop(&self) {}
}

/// Derives an isolation key (user, request, tenant) from an envelope, used
/// to scope rate-limit buckets, dedupe entries, and sampling decisions.
pub type ScopeKeyFn = Arc<dyn Fn(&Envelope) -> Option<String> + Send + Sync>;

/// Diagnostic channel for absorbed pipeline failures.
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Registration state shared between the client facade and the dispatch
/// worker. Mutations take effect on subsequent dispatches only.
#[derive(Default)]
pub(crate) struct PipelineState {
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub sinks: Vec<Arc<dyn Sink>>,
    pub error_hook: Option<ErrorHook>,
}

pub(crate) type SharedPipeline = Arc<RwLock<PipelineState>>;

/// Dispatch worker: drains the emit channel in order, one envelope at a
/// time, so envelopes produced from one scope reach the sink layer in
/// production order.
pub(crate) async fn run_worker(
    mut rx: mpsc::Receiver<Envelope>,
    pipeline: SharedPipeline,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            received = rx.recv() => match received {
                Some(envelope) => envelope,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let (middlewares, sinks, hook) = {
            let state = match pipeline.read() {
                Ok(state) => state,
                Err(_) => break,
            };
            (
                state.middlewares.clone(),
                state.sinks.clone(),
                state.error_hook.clone(),
            )
        };

        dispatch(envelope, &middlewares, &sinks, hook.as_ref()).await;
    }
}

/// Run one envelope through the chain and, if it survives, fan it out.
pub(crate) async fn dispatch(
    mut envelope: Envelope,
    middlewares: &[Arc<dyn Middleware>],
    sinks: &[Arc<dyn Sink>],
    hook: Option<&ErrorHook>,
) {
    for middleware in middlewares {
        let outcome = AssertUnwindSafe(middleware.handle(&mut envelope))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(Decision::Pass)) => {}
            Ok(Ok(Decision::Drop)) => {
                counter!("tattle.envelopes.dropped", "stage" => middleware.name()).increment(1);
                return;
            }
            Ok(Err(err)) => {
                counter!("tattle.middleware.errors", "middleware" => middleware.name())
                    .increment(1);
                report(hook, &err);
                return;
            }
            Err(_panic) => {
                counter!("tattle.middleware.panics", "middleware" => middleware.name())
                    .increment(1);
                report(
                    hook,
                    &Error::Middleware {
                        name: middleware.name().to_string(),
                        message: "panicked while handling an envelope".to_string(),
                    },
                );
                return;
            }
        }
    }

    fan_out(&envelope, sinks, hook).await;
}

/// Deliver to every sink concurrently, absorbing individual failures.
async fn fan_out(envelope: &Envelope, sinks: &[Arc<dyn Sink>], hook: Option<&ErrorHook>) {
    let deliveries = sinks.iter().map(|sink| {
        let sink = Arc::clone(sink);
        async move {
            let outcome = AssertUnwindSafe(sink.deliver(envelope)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some((sink.name(), err)),
                Err(_panic) => Some((
                    sink.name(),
                    Error::Sink {
                        name: sink.name().to_string(),
                        message: "panicked while delivering an envelope".to_string(),
                    },
                )),
            }
        }
    });

    for failure in futures::future::join_all(deliveries).await.into_iter().flatten() {
        let (name, err) = failure;
        counter!("tattle.sink.errors", "sink" => name).increment(1);
        tracing::warn!(
            telemetry.event = "sink_delivery_failed",
            sink = name,
            error = %err,
            "Sink failed to deliver an envelope"
        );
        report(hook, &err);
    }
}

pub(crate) fn report(hook: Option<&ErrorHook>, err: &Error) {
    tracing::debug!(
        telemetry.event = "pipeline_error",
        error = %err,
        "Pipeline absorbed an error"
    );
    if let Some(hook) = hook {
        // The hook is user code; a panicking hook must not take the worker
        // down with it.
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| hook(err)));
    }
}
