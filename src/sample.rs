//! Probabilistic sampling middleware.
//!
//! Drops a configurable fraction of envelopes by log level or event name.
//! With a key function configured, the keep/drop decision is derived from a
//! hash of the key instead of the RNG, so all envelopes sharing a key (one
//! request, one user) are kept or dropped together.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Envelope, Level, Record};
use crate::pipeline::{Decision, Middleware, ScopeKeyFn};
use crate::rng::{RandomSource, ThreadRngSource};
use crate::Result;

/// Wildcard event name matching any event without a specific rate.
pub const EVENT_WILDCARD: &str = "*";

/// Options for [`SampleMiddleware`]. Rates are keep-probabilities in
/// `[0, 1]`; unlisted levels and events are kept.
#[derive(Clone, Default)]
pub struct SampleOptions {
    pub log: HashMap<Level, f64>,
    pub event: HashMap<String, f64>,

    /// Deterministic sampling key; envelopes mapping to the same key share
    /// one decision per rate.
    pub key: Option<ScopeKeyFn>,
}

/// Per-envelope probabilistic drop.
pub struct SampleMiddleware {
    options: SampleOptions,
    random: Arc<dyn RandomSource>,
}

impl SampleMiddleware {
    pub fn new(options: SampleOptions) -> Self {
        Self::with_random(options, Arc::new(ThreadRngSource::new()))
    }

    pub fn with_random(options: SampleOptions, random: Arc<dyn RandomSource>) -> Self {
        Self { options, random }
    }

    fn rate_for(&self, envelope: &Envelope) -> f64 {
        let raw = match &envelope.record {
            Record::Log(log) => self.options.log.get(&log.level).copied().unwrap_or(1.0),
            Record::Event(event) => self
                .options
                .event
                .get(&event.name)
                .or_else(|| self.options.event.get(EVENT_WILDCARD))
                .copied()
                .unwrap_or(1.0),
        };
        if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, 1.0)
        }
    }
}

/// FNV-1a 32-bit hash; the sampling contract depends on this exact function.
fn fnv1a32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Uniform value in `[0, 1)` derived from a sampling key.
fn key_unit(key: &str) -> f64 {
    f64::from(fnv1a32(key)) / 4_294_967_296.0
}

#[async_trait]
impl Middleware for SampleMiddleware {
    fn name(&self) -> &'static str {
        "sample"
    }

    async fn handle(&self, envelope: &mut Envelope) -> Result<Decision> {
        let rate = self.rate_for(envelope);

        if rate >= 1.0 {
            return Ok(Decision::Pass);
        }
        if rate <= 0.0 {
            return Ok(Decision::Drop);
        }

        if let Some(key_fn) = &self.options.key {
            if let Some(key) = key_fn(envelope) {
                return Ok(if key_unit(&key) < rate {
                    Decision::Pass
                } else {
                    Decision::Drop
                });
            }
        }

        Ok(if self.random.next_f64() < rate {
            Decision::Pass
        } else {
            Decision::Drop
        })
    }
}
