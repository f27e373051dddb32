//! Deduplication middleware.
//!
//! Suppresses repeats of a record within a TTL window, keyed by a stable
//! fingerprint of its content. The first occurrence passes and opens a
//! window; repeats inside the window drop; the first occurrence after the
//! window expires passes again and opens a new one. The cache is bounded
//! both by entry count (LRU eviction) and by periodic expiry sweeps.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::encoding::{stable_field, stable_map_field};
use crate::envelope::{Envelope, Record};
use crate::pipeline::{Decision, Middleware, ScopeKeyFn};
use crate::rate_limit::GLOBAL_SCOPE;
use crate::recency::RecencyMap;
use crate::Result;

/// Custom fingerprint override.
pub type FingerprintFn = Arc<dyn Fn(&Envelope) -> String + Send + Sync>;

/// Options for [`DedupeMiddleware`].
#[derive(Clone)]
pub struct DedupeOptions {
    /// Suppression window per fingerprint.
    pub ttl_ms: i64,

    /// Hard cap on cached fingerprints; oldest evicted beyond it.
    pub max_size: usize,

    /// Run expiry bookkeeping every this many envelopes.
    pub cleanup_every: u64,

    /// Depth cap handed to the stable serializer.
    pub max_depth: usize,

    /// Fingerprints longer than this are truncated.
    pub max_fingerprint_len: usize,

    /// Isolates caches per logical actor, as in rate limiting.
    pub key: Option<ScopeKeyFn>,

    /// Replaces the default content fingerprint entirely.
    pub fingerprint: Option<FingerprintFn>,
}

impl Default for DedupeOptions {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            max_size: 10_000,
            cleanup_every: 200,
            max_depth: 10,
            max_fingerprint_len: 2048,
            key: None,
            fingerprint: None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    expires_at: i64,
    last_seen: i64,
}

struct CacheState {
    entries: RecencyMap<Entry>,
    ops: u64,
}

/// TTL-bounded, capacity-bounded LRU suppression of duplicate records.
pub struct DedupeMiddleware {
    options: DedupeOptions,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl DedupeMiddleware {
    pub fn new(options: DedupeOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(options: DedupeOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            clock,
            state: Mutex::new(CacheState {
                entries: RecencyMap::new(),
                ops: 0,
            }),
        }
    }

    fn fingerprint(&self, envelope: &Envelope) -> String {
        let mut fingerprint = match &self.options.fingerprint {
            Some(custom) => custom(envelope),
            None => default_fingerprint(envelope, self.options.max_depth),
        };
        if fingerprint.len() > self.options.max_fingerprint_len {
            // Truncate on a char boundary; fingerprints are opaque.
            let mut cut = self.options.max_fingerprint_len;
            while cut > 0 && !fingerprint.is_char_boundary(cut) {
                cut -= 1;
            }
            fingerprint.truncate(cut);
        }
        fingerprint
    }

    fn scope_of(&self, envelope: &Envelope) -> String {
        self.options
            .key
            .as_ref()
            .and_then(|key_fn| key_fn(envelope))
            .unwrap_or_else(|| GLOBAL_SCOPE.to_string())
    }

    fn cleanup(&self, state: &mut CacheState, now: i64) {
        state.entries.retain(|_, entry| now < entry.expires_at);
        while state.entries.len() > self.options.max_size {
            if state.entries.pop_oldest().is_none() {
                break;
            }
        }
    }
}

/// The canonical content fingerprint. This string is the deduplication
/// contract: identical records always produce identical fingerprints, and
/// any change to its shape changes suppression behavior across versions.
fn default_fingerprint(envelope: &Envelope, max_depth: usize) -> String {
    match &envelope.record {
        Record::Log(log) => format!(
            "log:{}:{}|data={}|err={}",
            log.level,
            log.msg,
            stable_map_field(log.data.as_ref(), max_depth),
            stable_field(log.err.as_ref(), max_depth),
        ),
        Record::Event(event) => format!(
            "event:{}|props={}",
            event.name,
            stable_map_field(event.props.as_ref(), max_depth),
        ),
    }
}

#[async_trait]
impl Middleware for DedupeMiddleware {
    fn name(&self) -> &'static str {
        "dedupe"
    }

    async fn handle(&self, envelope: &mut Envelope) -> Result<Decision> {
        let now = self.clock.now_ms();
        let id = format!("{}::{}", self.scope_of(envelope), self.fingerprint(envelope));

        // Fail open on a poisoned lock rather than silencing telemetry.
        let Ok(mut state) = self.state.lock() else {
            return Ok(Decision::Pass);
        };

        state.ops += 1;
        if self.options.cleanup_every > 0 && state.ops % self.options.cleanup_every == 0 {
            self.cleanup(&mut state, now);
        }

        if let Some(entry) = state.entries.touch(&id) {
            entry.last_seen = now;
            if now < entry.expires_at {
                return Ok(Decision::Drop);
            }
            // Window expired: this occurrence opens a new one and passes.
            entry.expires_at = now + self.options.ttl_ms;
            return Ok(Decision::Pass);
        }

        state.entries.insert(
            id,
            Entry {
                expires_at: now + self.options.ttl_ms,
                last_seen: now,
            },
        );

        // Bound the cache immediately after insertion, not only on the
        // periodic sweep.
        while state.entries.len() > self.options.max_size {
            if state.entries.pop_oldest().is_none() {
                break;
            }
        }

        Ok(Decision::Pass)
    }
}
