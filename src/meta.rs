//! Context enrichment middleware.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{merge_ctx, Ctx};
use crate::envelope::{Envelope, Record};
use crate::pipeline::{Decision, Middleware};
use crate::Result;

/// Callback producing dynamic metadata per envelope. Returning `None`
/// contributes nothing.
pub type MetaProvider = Arc<dyn Fn() -> Option<Ctx> + Send + Sync>;

/// Options for [`MetaMiddleware`].
#[derive(Clone)]
pub struct MetaOptions {
    /// Static fields merged into every envelope.
    pub meta: Ctx,

    /// Dynamic providers, evaluated in order; later providers override
    /// earlier ones.
    pub providers: Vec<MetaProvider>,

    /// Add `timestamp` with the envelope's creation time.
    pub include_timestamp: bool,

    /// Add `kind`, plus `level` for logs or `name` for events.
    pub include_record_info: bool,

    /// Merge the computed mapping into `ctx` directly (default). When false,
    /// the mapping is stored under [`MetaOptions::namespace_key`] instead.
    pub merge_into_ctx: bool,

    /// Sub-key used when `merge_into_ctx` is false.
    pub namespace_key: String,
}

impl Default for MetaOptions {
    fn default() -> Self {
        Self {
            meta: Ctx::new(),
            providers: Vec::new(),
            include_timestamp: false,
            include_record_info: false,
            merge_into_ctx: true,
            namespace_key: "meta".to_string(),
        }
    }
}

/// Enriches envelope context with static, dynamic, and record-derived
/// fields. Provider failures are swallowed; metadata generation never breaks
/// the pipeline.
pub struct MetaMiddleware {
    options: MetaOptions,
}

impl MetaMiddleware {
    pub fn new(options: MetaOptions) -> Self {
        Self { options }
    }

    fn computed(&self, envelope: &Envelope) -> Ctx {
        let mut computed = self.options.meta.clone();

        for provider in &self.options.providers {
            let produced = std::panic::catch_unwind(AssertUnwindSafe(|| provider()));
            if let Ok(Some(extra)) = produced {
                merge_ctx(&mut computed, &extra);
            }
        }

        if self.options.include_timestamp {
            computed.insert("timestamp".to_string(), Value::from(envelope.ts()));
        }

        if self.options.include_record_info {
            match &envelope.record {
                Record::Log(log) => {
                    computed.insert("kind".to_string(), Value::from("log"));
                    computed.insert("level".to_string(), Value::from(log.level.as_str()));
                }
                Record::Event(event) => {
                    computed.insert("kind".to_string(), Value::from("event"));
                    computed.insert("name".to_string(), Value::from(event.name.clone()));
                }
            }
        }

        computed
    }
}

#[async_trait]
impl Middleware for MetaMiddleware {
    fn name(&self) -> &'static str {
        "meta"
    }

    async fn handle(&self, envelope: &mut Envelope) -> Result<Decision> {
        let computed = self.computed(envelope);

        if self.options.merge_into_ctx {
            merge_ctx(&mut envelope.ctx, &computed);
        } else {
            // Merge into an existing sub-mapping rather than clobbering it.
            let slot = envelope
                .ctx
                .entry(self.options.namespace_key.clone())
                .or_insert_with(|| Value::Object(Ctx::new()));
            match slot {
                Value::Object(existing) => merge_ctx(existing, &computed),
                other => *other = Value::Object(computed),
            }
        }

        Ok(Decision::Pass)
    }
}
