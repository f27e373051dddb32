//! Scope-local context propagation.
//!
//! A context is an ordered key/value mapping of ambient metadata. Three
//! layers combine at emit time: the client's global base context, the scope
//! overlay managed here, and any per-call values. Merging is last-writer-wins
//! per key, with later layers overriding earlier ones.
//!
//! Two backends implement the scope overlay:
//!
//! - [`ScopeBackend::TaskLocal`] stores the effective scope in Tokio
//!   task-local storage, so work that suspends and resumes inside the scope
//!   still observes the same context. This is the correctness floor for
//!   concurrent servers and the default.
//! - [`ScopeBackend::ThreadStack`] keeps a thread-confined stack of frames.
//!   It is correct for synchronous code only: futures that cross suspension
//!   points can observe frames pushed by unrelated work interleaved on the
//!   same thread. The limitation is inherent to the backend and deliberately
//!   not papered over; use it only when no task-local storage is available.

use std::cell::RefCell;
use std::future::Future;

use serde_json::Value;

/// Key/value mapping of ambient metadata attached to envelopes at creation.
pub type Ctx = serde_json::Map<String, Value>;

/// Merge `from` into `into`, later writers winning per key.
pub fn merge_ctx(into: &mut Ctx, from: &Ctx) {
    for (key, value) in from {
        into.insert(key.clone(), value.clone());
    }
}

tokio::task_local! {
    static TASK_SCOPE: Ctx;
}

thread_local! {
    static STACK_SCOPE: RefCell<Vec<Ctx>> = const { RefCell::new(Vec::new()) };
}

/// Which storage backs the scope overlay. Selected once at client
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeBackend {
    /// Tokio task-local storage; follows work across await points.
    #[default]
    TaskLocal,
    /// Thread-confined frame stack; synchronous code only.
    ThreadStack,
}

/// Owns the scope overlay for one client instance.
#[derive(Debug, Clone, Copy)]
pub struct ContextManager {
    backend: ScopeBackend,
}

impl ContextManager {
    pub fn new(backend: ScopeBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> ScopeBackend {
        self.backend
    }

    /// The effective scope at the call site, empty outside any scope.
    pub fn current(&self) -> Ctx {
        match self.backend {
            ScopeBackend::TaskLocal => TASK_SCOPE
                .try_with(|scope| scope.clone())
                .unwrap_or_default(),
            ScopeBackend::ThreadStack => STACK_SCOPE.with(|stack| {
                stack.borrow().last().cloned().unwrap_or_default()
            }),
        }
    }

    /// Run `fut` with `ctx` merged onto the current effective scope.
    ///
    /// The frame exists exactly for the lifetime of the future: every exit
    /// path, including panics and cancellation, unwinds it.
    pub async fn scope<F>(&self, ctx: Ctx, fut: F) -> F::Output
    where
        F: Future,
    {
        let merged = self.merged_frame(ctx);
        match self.backend {
            ScopeBackend::TaskLocal => TASK_SCOPE.scope(merged, fut).await,
            ScopeBackend::ThreadStack => {
                let _guard = StackGuard::push(merged);
                fut.await
            }
        }
    }

    /// Run `f` with `ctx` merged onto the current effective scope.
    pub fn sync_scope<R>(&self, ctx: Ctx, f: impl FnOnce() -> R) -> R {
        let merged = self.merged_frame(ctx);
        match self.backend {
            ScopeBackend::TaskLocal => TASK_SCOPE.sync_scope(merged, f),
            ScopeBackend::ThreadStack => {
                let _guard = StackGuard::push(merged);
                f()
            }
        }
    }

    fn merged_frame(&self, ctx: Ctx) -> Ctx {
        let mut merged = self.current();
        merge_ctx(&mut merged, &ctx);
        merged
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ScopeBackend::default())
    }
}

/// Pops exactly the frame it pushed, on drop.
struct StackGuard;

impl StackGuard {
    fn push(frame: Ctx) -> Self {
        STACK_SCOPE.with(|stack| stack.borrow_mut().push(frame));
        Self
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        STACK_SCOPE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(key: &str, value: &str) -> Ctx {
        let mut ctx = Ctx::new();
        ctx.insert(key.to_string(), json!(value));
        ctx
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut base = ctx_with("a", "1");
        base.insert("b".into(), json!("keep"));
        merge_ctx(&mut base, &ctx_with("a", "2"));

        assert_eq!(base["a"], "2");
        assert_eq!(base["b"], "keep");
    }

    #[test]
    fn test_ctx_preserves_insertion_order() {
        let mut ctx = Ctx::new();
        ctx.insert("zebra".into(), json!(1));
        ctx.insert("apple".into(), json!(2));
        ctx.insert("mango".into(), json!(3));

        let line = serde_json::to_string(&ctx).unwrap();
        assert_eq!(line, r#"{"zebra":1,"apple":2,"mango":3}"#);
    }

    #[test]
    fn test_merge_keeps_original_key_positions() {
        let mut base = Ctx::new();
        base.insert("b".into(), json!(1));
        base.insert("a".into(), json!(2));

        let mut overlay = Ctx::new();
        overlay.insert("a".into(), json!(3));
        overlay.insert("c".into(), json!(4));
        merge_ctx(&mut base, &overlay);

        // Overwritten keys keep their slot; new keys append.
        let line = serde_json::to_string(&base).unwrap();
        assert_eq!(line, r#"{"b":1,"a":3,"c":4}"#);
    }

    #[test]
    fn test_current_outside_scope_is_empty() {
        let manager = ContextManager::new(ScopeBackend::TaskLocal);
        assert!(manager.current().is_empty());

        let manager = ContextManager::new(ScopeBackend::ThreadStack);
        assert!(manager.current().is_empty());
    }

    #[tokio::test]
    async fn test_task_local_scope_survives_await() {
        let manager = ContextManager::new(ScopeBackend::TaskLocal);

        let seen = manager
            .scope(ctx_with("request_id", "r1"), async move {
                let before = manager.current();
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                let after = manager.current();
                (before, after)
            })
            .await;

        assert_eq!(seen.0["request_id"], "r1");
        assert_eq!(seen.1["request_id"], "r1");
        assert!(manager.current().is_empty());
    }

    #[tokio::test]
    async fn test_task_local_nested_scopes_merge_and_restore() {
        let manager = ContextManager::new(ScopeBackend::TaskLocal);

        manager
            .scope(ctx_with("outer", "o"), async move {
                let mut inner = ctx_with("inner", "i");
                inner.insert("outer".into(), json!("shadowed"));

                manager
                    .scope(inner, async move {
                        let current = manager.current();
                        assert_eq!(current["outer"], "shadowed");
                        assert_eq!(current["inner"], "i");
                    })
                    .await;

                // Inner frame gone, outer intact.
                let current = manager.current();
                assert_eq!(current["outer"], "o");
                assert!(current.get("inner").is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_task_local_scope_isolated_per_task() {
        let manager = ContextManager::new(ScopeBackend::TaskLocal);

        let handle = tokio::spawn(async move {
            // A fresh task starts with no scope, whatever its spawner holds.
            ContextManager::new(ScopeBackend::TaskLocal).current()
        });
        let spawned = manager
            .scope(ctx_with("here", "yes"), async move { handle.await })
            .await
            .unwrap();

        assert!(spawned.is_empty());
    }

    #[test]
    fn test_stack_backend_sync_scope() {
        let manager = ContextManager::new(ScopeBackend::ThreadStack);

        let result = manager.sync_scope(ctx_with("user", "u1"), || {
            let outer = manager.current();
            let nested = manager.sync_scope(ctx_with("step", "2"), || manager.current());
            (outer, nested)
        });

        assert_eq!(result.0["user"], "u1");
        assert_eq!(result.1["user"], "u1");
        assert_eq!(result.1["step"], "2");
        assert!(manager.current().is_empty());
    }

    #[test]
    fn test_stack_backend_pops_on_panic() {
        let manager = ContextManager::new(ScopeBackend::ThreadStack);

        let outcome = std::panic::catch_unwind(|| {
            manager.sync_scope(ctx_with("doomed", "yes"), || {
                panic!("scope body panicked");
            })
        });

        assert!(outcome.is_err());
        assert!(manager.current().is_empty());
    }
}
