//! Token-bucket rate limiting middleware.
//!
//! One bucket exists per (scope, rule) pair. A rule grants `limit` envelopes
//! per `interval_ms` with an optional burst capacity; buckets start full, so
//! a fresh scope can spend its whole burst immediately. Envelopes that find
//! an empty bucket are dropped silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::envelope::{Envelope, Level, Record};
use crate::pipeline::{Decision, Middleware, ScopeKeyFn};
use crate::recency::RecencyMap;
use crate::sample::EVENT_WILDCARD;
use crate::Result;

/// Scope key used when no key function is configured or it yields nothing.
pub const GLOBAL_SCOPE: &str = "global";

/// One rate-limit rule: `limit` envelopes per `interval_ms`, with burst
/// capacity `burst` (defaults to `limit`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRule {
    pub limit: f64,
    pub interval_ms: u64,
    pub burst: Option<f64>,
}

impl RateRule {
    pub fn new(limit: f64, interval_ms: u64) -> Self {
        Self {
            limit,
            interval_ms,
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = Some(burst);
        self
    }

    fn capacity(&self) -> f64 {
        self.burst.unwrap_or(self.limit)
    }

    /// Tokens regained per millisecond.
    fn refill_rate(&self) -> f64 {
        if self.interval_ms == 0 {
            f64::INFINITY
        } else {
            self.limit / self.interval_ms as f64
        }
    }
}

/// Options for [`RateLimitMiddleware`]. Unmatched records are unlimited.
#[derive(Clone, Default)]
pub struct RateLimitOptions {
    pub log: HashMap<Level, RateRule>,
    pub default_log: Option<RateRule>,

    /// Per-event rules; the `"*"` entry matches events without their own.
    pub event: HashMap<String, RateRule>,
    pub default_event: Option<RateRule>,

    /// Isolates buckets per logical actor; absent keys share [`GLOBAL_SCOPE`].
    pub key: Option<ScopeKeyFn>,

    /// Buckets idle longer than this are evicted.
    pub bucket_ttl_ms: i64,

    /// Hard cap on tracked buckets; oldest evicted beyond it.
    pub max_buckets: usize,

    /// Run eviction bookkeeping every this many envelopes.
    pub cleanup_every: u64,
}

impl RateLimitOptions {
    pub fn defaults() -> Self {
        Self {
            bucket_ttl_ms: 10 * 60 * 1000,
            max_buckets: 10_000,
            cleanup_every: 200,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: i64,
    last_seen: i64,
}

struct LimiterState {
    buckets: RecencyMap<Bucket>,
    ops: u64,
}

/// Per-key token-bucket rate limiting.
pub struct RateLimitMiddleware {
    options: RateLimitOptions,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl RateLimitMiddleware {
    pub fn new(options: RateLimitOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(options: RateLimitOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            clock,
            state: Mutex::new(LimiterState {
                buckets: RecencyMap::new(),
                ops: 0,
            }),
        }
    }

    /// The rule governing this envelope, with its bucket id component.
    fn resolve(&self, envelope: &Envelope) -> Option<(RateRule, String)> {
        match &envelope.record {
            Record::Log(log) => self
                .options
                .log
                .get(&log.level)
                .or(self.options.default_log.as_ref())
                .map(|rule| (*rule, format!("log:{}", log.level))),
            Record::Event(event) => self
                .options
                .event
                .get(&event.name)
                .or_else(|| self.options.event.get(EVENT_WILDCARD))
                .or(self.options.default_event.as_ref())
                .map(|rule| (*rule, format!("event:{}", event.name))),
        }
    }

    fn scope_of(&self, envelope: &Envelope) -> String {
        self.options
            .key
            .as_ref()
            .and_then(|key_fn| key_fn(envelope))
            .unwrap_or_else(|| GLOBAL_SCOPE.to_string())
    }

    fn cleanup(&self, state: &mut LimiterState, now: i64) {
        let ttl = self.options.bucket_ttl_ms;
        if ttl > 0 {
            state.buckets.retain(|_, bucket| now - bucket.last_seen <= ttl);
        }
        while state.buckets.len() > self.options.max_buckets {
            if state.buckets.pop_oldest().is_none() {
                break;
            }
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, envelope: &mut Envelope) -> Result<Decision> {
        let Some((rule, rule_id)) = self.resolve(envelope) else {
            return Ok(Decision::Pass);
        };

        let now = self.clock.now_ms();
        let id = format!("{}::{}", self.scope_of(envelope), rule_id);

        // Fail open on a poisoned lock; starving the host of telemetry is
        // worse than letting a burst through.
        let Ok(mut state) = self.state.lock() else {
            return Ok(Decision::Pass);
        };

        state.ops += 1;
        if self.options.cleanup_every > 0 && state.ops % self.options.cleanup_every == 0 {
            self.cleanup(&mut state, now);
        }

        // A bucket idle past its TTL restarts with a full burst.
        let ttl = self.options.bucket_ttl_ms;
        let stale = ttl > 0
            && state
                .buckets
                .peek(&id)
                .is_some_and(|bucket| now - bucket.last_seen > ttl);
        if stale {
            state.buckets.remove(&id);
        }

        if !state.buckets.contains(&id) {
            state.buckets.insert(
                id.clone(),
                Bucket {
                    tokens: rule.capacity(),
                    last_refill: now,
                    last_seen: now,
                },
            );
        }

        let Some(bucket) = state.buckets.touch(&id) else {
            return Ok(Decision::Pass);
        };

        let elapsed = (now - bucket.last_refill).max(0) as f64;
        bucket.tokens = (bucket.tokens + elapsed * rule.refill_rate()).min(rule.capacity());
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(Decision::Pass)
        } else {
            Ok(Decision::Drop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::Ctx;
    use serde_json::json;

    fn debug_log() -> Envelope {
        Envelope::new(0, Ctx::new(), Record::log(Level::Debug, "m", None))
    }

    fn event(name: &str) -> Envelope {
        Envelope::new(0, Ctx::new(), Record::event(name, None))
    }

    async fn decide(mw: &RateLimitMiddleware, mut envelope: Envelope) -> Decision {
        mw.handle(&mut envelope).await.unwrap()
    }

    fn limiter_with(
        options: RateLimitOptions,
        clock: Arc<ManualClock>,
    ) -> RateLimitMiddleware {
        RateLimitMiddleware::with_clock(options, clock)
    }

    #[tokio::test]
    async fn test_unmatched_records_are_unlimited() {
        let mw = RateLimitMiddleware::new(RateLimitOptions::defaults());
        for _ in 0..100 {
            assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
        }
    }

    #[tokio::test]
    async fn test_burst_then_refill() {
        let clock = Arc::new(ManualClock::new(0));
        let mut options = RateLimitOptions::defaults();
        options.log.insert(Level::Debug, RateRule::new(2.0, 1000));
        let mw = limiter_with(options, clock.clone());

        // Fresh bucket: the full burst of 2 passes, the third drops.
        assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
        assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
        assert_eq!(decide(&mw, debug_log()).await, Decision::Drop);

        // Half the interval refills one token.
        clock.set(500);
        assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
        assert_eq!(decide(&mw, debug_log()).await, Decision::Drop);

        clock.set(1000);
        assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
    }

    #[tokio::test]
    async fn test_burst_capacity_overrides_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let mut options = RateLimitOptions::defaults();
        options
            .log
            .insert(Level::Debug, RateRule::new(1.0, 1000).with_burst(3.0));
        let mw = limiter_with(options, clock);

        for _ in 0..3 {
            assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
        }
        assert_eq!(decide(&mw, debug_log()).await, Decision::Drop);
    }

    #[tokio::test]
    async fn test_event_wildcard_and_specific_rules() {
        let clock = Arc::new(ManualClock::new(0));
        let mut options = RateLimitOptions::defaults();
        options
            .event
            .insert(EVENT_WILDCARD.to_string(), RateRule::new(1.0, 1000));
        options
            .event
            .insert("page_view".to_string(), RateRule::new(2.0, 1000));
        let mw = limiter_with(options, clock.clone());

        let mut passed = 0;
        for _ in 0..3 {
            if decide(&mw, event("page_view")).await == Decision::Pass {
                passed += 1;
            }
        }
        assert_eq!(passed, 2);

        for _ in 0..2 {
            if decide(&mw, event("click")).await == Decision::Pass {
                passed += 1;
            }
        }
        assert_eq!(passed, 3);

        clock.advance(1000);
        if decide(&mw, event("click")).await == Decision::Pass {
            passed += 1;
        }
        assert_eq!(passed, 4);
    }

    #[tokio::test]
    async fn test_scope_key_isolates_buckets() {
        let clock = Arc::new(ManualClock::new(0));
        let mut options = RateLimitOptions::defaults();
        options.log.insert(Level::Debug, RateRule::new(1.0, 1000));
        options.key = Some(Arc::new(|envelope: &Envelope| {
            envelope
                .ctx
                .get("user")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        }));
        let mw = limiter_with(options, clock);

        let for_user = |user: &str| {
            let mut envelope = debug_log();
            envelope.ctx.insert("user".into(), json!(user));
            envelope
        };

        assert_eq!(decide(&mw, for_user("a")).await, Decision::Pass);
        assert_eq!(decide(&mw, for_user("a")).await, Decision::Drop);
        // A different user has a fresh bucket.
        assert_eq!(decide(&mw, for_user("b")).await, Decision::Pass);
    }

    #[tokio::test]
    async fn test_stale_bucket_restarts_with_full_burst() {
        let clock = Arc::new(ManualClock::new(0));
        let mut options = RateLimitOptions::defaults();
        options.log.insert(Level::Debug, RateRule::new(1.0, 60_000));
        options.bucket_ttl_ms = 1_000;
        let mw = limiter_with(options, clock.clone());

        assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
        assert_eq!(decide(&mw, debug_log()).await, Decision::Drop);

        // Idle past the TTL: found stale on access, removed, recreated full.
        clock.advance(1_500);
        assert_eq!(decide(&mw, debug_log()).await, Decision::Pass);
    }

    #[tokio::test]
    async fn test_periodic_cleanup_bounds_bucket_count() {
        let clock = Arc::new(ManualClock::new(0));
        let mut options = RateLimitOptions::defaults();
        options
            .event
            .insert(EVENT_WILDCARD.to_string(), RateRule::new(100.0, 1000));
        options.max_buckets = 3;
        options.cleanup_every = 1;
        let mw = limiter_with(options, clock);

        for i in 0..10 {
            decide(&mw, event(&format!("event_{i}"))).await;
        }

        let state = mw.state.lock().unwrap();
        assert!(state.buckets.len() <= 4, "one insert may land after cleanup");
    }
}
