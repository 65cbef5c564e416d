//! Flow-scoped marking context.
//!
//! A [`MarkingContext`] carries the user id, correlation ids and custom tags
//! of one logical flow. It can be passed explicitly (see
//! [`MarkedConnection::with_context`](crate::MarkedConnection::with_context))
//! or installed as the ambient context of the current thread or task.
//!
//! Synchronous code uses a thread-local slot. Async code uses a task-local
//! slot opened with [`scope_async`] or [`propagate_async`]; on a tokio
//! runtime, ambient writes outside such a scope are ignored with a warning,
//! because a worker thread runs many tasks in turn.
//!
//! Ambient contexts follow copy-on-spawn semantics: [`spawn`] and
//! [`propagate`] hand the child a deep copy taken at spawn time. Later writes
//! in the parent are not seen by the child, and writes in the child never
//! reach the parent. Threads spawned with plain `std::thread::spawn` start
//! without a context.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;

use crate::id::unix_millis;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static CURRENT: RefCell<Option<Arc<MarkingContext>>> = const { RefCell::new(None) };
    static SCOPE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

tokio::task_local! {
    static TASK_CURRENT: RefCell<Option<Arc<MarkingContext>>>;
}

/// Process-unique numeric id of the calling thread, assigned on first use.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

#[derive(Debug, Clone, Default)]
struct Identity {
    user_id: Option<String>,
    trace_id: Option<String>,
    tracking_id: Option<String>,
}

/// Mutable tagging data for one logical flow.
///
/// All accessors take `&self`; the context is shared as `Arc<MarkingContext>`
/// between the code of one flow. Concurrent writers are not ordered: the
/// last write wins.
///
/// `Clone` produces an independent deep copy.
#[derive(Debug)]
pub struct MarkingContext {
    thread_id: u64,
    created_at: i64,
    identity: RwLock<Identity>,
    custom_info: RwLock<BTreeMap<String, String>>,
}

impl MarkingContext {
    /// Create an empty context owned by the calling thread.
    pub fn new() -> Self {
        Self {
            thread_id: current_thread_id(),
            created_at: unix_millis(),
            identity: RwLock::new(Identity::default()),
            custom_info: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a context carrying a user id.
    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        let context = Self::new();
        context.set_user_id(user_id);
        context
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Thread that created the context.
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Creation time in unix milliseconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn user_id(&self) -> Option<String> {
        self.identity.read().user_id.clone()
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.identity.write().user_id = Some(user_id.into());
    }

    pub fn trace_id(&self) -> Option<String> {
        self.identity.read().trace_id.clone()
    }

    /// Override the generated trace id for every statement of this flow.
    pub fn set_trace_id(&self, trace_id: impl Into<String>) {
        self.identity.write().trace_id = Some(trace_id.into());
    }

    pub fn tracking_id(&self) -> Option<String> {
        self.identity.read().tracking_id.clone()
    }

    /// Override the generated tracking id for every statement of this flow.
    pub fn set_tracking_id(&self, tracking_id: impl Into<String>) {
        self.identity.write().tracking_id = Some(tracking_id.into());
    }

    /// Insert or overwrite a custom tag.
    pub fn add_custom_info(&self, key: impl Into<String>, value: impl ToString) -> &Self {
        self.custom_info.write().insert(key.into(), value.to_string());
        self
    }

    /// Merge tags; on duplicate keys the later entry wins.
    pub fn extend_custom_info<I, K, V>(&self, info: I) -> &Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let mut custom_info = self.custom_info.write();
        for (key, value) in info {
            custom_info.insert(key.into(), value.to_string());
        }
        drop(custom_info);
        self
    }

    pub fn custom_info(&self, key: &str) -> Option<String> {
        self.custom_info.read().get(key).cloned()
    }

    /// Remove a tag, returning its previous value.
    pub fn remove_custom_info(&self, key: &str) -> Option<String> {
        self.custom_info.write().remove(key)
    }

    pub fn has_custom_info(&self, key: &str) -> bool {
        self.custom_info.read().contains_key(key)
    }

    pub fn custom_info_len(&self) -> usize {
        self.custom_info.read().len()
    }

    /// Copy of all tags, sorted by key.
    pub fn custom_info_snapshot(&self) -> BTreeMap<String, String> {
        self.custom_info.read().clone()
    }

    pub fn clear_custom_info(&self) {
        self.custom_info.write().clear();
    }
}

impl Default for MarkingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MarkingContext {
    fn clone(&self) -> Self {
        Self {
            thread_id: self.thread_id,
            created_at: self.created_at,
            identity: RwLock::new(self.identity.read().clone()),
            custom_info: RwLock::new(self.custom_info_snapshot()),
        }
    }
}

impl std::fmt::Display for MarkingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MarkingContext[thread_id={}, user_id={}, custom_info_len={}, created_at={}]",
            self.thread_id,
            self.user_id().as_deref().unwrap_or("-"),
            self.custom_info_len(),
            self.created_at
        )
    }
}

enum Slot {
    Thread,
    Task,
    Detached,
}

/// Where ambient reads and writes go for the calling code.
///
/// Inside [`scoped`] the thread slot always wins, since the closure cannot
/// yield. Otherwise a task scope opened with [`scope_async`] is used. Code
/// running on a tokio runtime without a task scope is detached: a tokio
/// worker thread interleaves many tasks, so its thread slot belongs to none
/// of them.
fn slot() -> Slot {
    if SCOPE_DEPTH.with(Cell::get) > 0 {
        Slot::Thread
    } else if TASK_CURRENT.try_with(|_| ()).is_ok() {
        Slot::Task
    } else if tokio::runtime::Handle::try_current().is_ok() {
        Slot::Detached
    } else {
        Slot::Thread
    }
}

fn with_slot<R>(f: impl FnOnce(&RefCell<Option<Arc<MarkingContext>>>) -> R) -> Option<R> {
    match slot() {
        Slot::Thread => Some(CURRENT.with(f)),
        Slot::Task => TASK_CURRENT.try_with(f).ok(),
        Slot::Detached => None,
    }
}

fn detached_write() {
    tracing::warn!(
        thread_id = current_thread_id(),
        "Ambient marking context written outside a task scope, ignoring; use context::scope_async"
    );
}

/// The context installed for the calling thread or task, if any.
pub fn current() -> Option<Arc<MarkingContext>> {
    with_slot(|current| current.borrow().clone()).flatten()
}

/// Install `context` for the calling thread or task, replacing any previous one.
pub fn set_current(context: Arc<MarkingContext>) {
    if with_slot(|current| *current.borrow_mut() = Some(context)).is_none() {
        detached_write();
    }
}

/// Remove the calling thread's or task's context.
pub fn clear() {
    let _ = with_slot(|current| *current.borrow_mut() = None);
}

/// The current context, creating and installing an empty one if needed.
///
/// Outside any scope on a tokio runtime the new context is not installed.
pub fn current_or_create() -> Arc<MarkingContext> {
    let installed = with_slot(|current| {
        current
            .borrow_mut()
            .get_or_insert_with(|| Arc::new(MarkingContext::new()))
            .clone()
    });
    installed.unwrap_or_else(|| {
        detached_write();
        Arc::new(MarkingContext::new())
    })
}

pub fn current_user_id() -> Option<String> {
    current().and_then(|context| context.user_id())
}

pub fn set_current_user_id(user_id: impl Into<String>) {
    current_or_create().set_user_id(user_id);
}

pub fn add_current_custom_info(key: impl Into<String>, value: impl ToString) {
    current_or_create().add_custom_info(key, value);
}

/// Deep copy of the current context.
pub fn fork() -> Option<Arc<MarkingContext>> {
    current().map(|context| Arc::new(MarkingContext::clone(&context)))
}

struct ScopeGuard {
    previous: Option<Arc<MarkingContext>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The thread-locals may already be gone during thread teardown.
        let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
        let _ = SCOPE_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Run `f` with `context` installed, restoring the previous context (or
/// none) afterwards, also when `f` panics.
pub fn scoped<T>(context: Arc<MarkingContext>, f: impl FnOnce() -> T) -> T {
    let previous = CURRENT.with(|current| current.replace(Some(context)));
    SCOPE_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let _guard = ScopeGuard { previous };
    f()
}

/// Run `future` with `context` as the ambient context of the task.
///
/// The context follows the future across `.await` points and worker
/// threads, and is invisible to every other task. Ambient writes inside the
/// future ([`set_current`], [`set_current_user_id`], ...) stay in this scope.
pub async fn scope_async<F: Future>(context: Arc<MarkingContext>, future: F) -> F::Output {
    TASK_CURRENT.scope(RefCell::new(Some(context)), future).await
}

/// Wrap `future` so that it runs in its own task scope, starting from a copy
/// of the caller's current context.
///
/// ```rust,ignore
/// tokio::spawn(context::propagate_async(async move { audit(&db).await }));
/// ```
pub fn propagate_async<F: Future>(future: F) -> impl Future<Output = F::Output> {
    let inherited = fork();
    TASK_CURRENT.scope(RefCell::new(inherited), future)
}

/// Wrap `f` so that it runs under a copy of the caller's current context,
/// wherever it is eventually executed.
pub fn propagate<F, T>(f: F) -> impl FnOnce() -> T + Send + 'static
where
    F: FnOnce() -> T + Send + 'static,
    T: 'static,
{
    let inherited = fork();
    move || match inherited {
        Some(context) => scoped(context, f),
        None => f(),
    }
}

/// Spawn a thread that inherits a copy of the caller's current context.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::spawn(propagate(f))
}

/// Fluent construction of a [`MarkingContext`].
///
/// ```rust
/// use sea_orm_marking::{context, MarkingContext};
///
/// let user = MarkingContext::builder()
///     .user_id("u001")
///     .request_id("req-42")
///     .scope(|| context::current_user_id());
/// assert_eq!(user.as_deref(), Some("u001"));
/// assert!(context::current().is_none());
/// ```
#[derive(Debug, Default)]
pub struct ContextBuilder {
    context: MarkingContext,
}

impl ContextBuilder {
    pub fn user_id(self, user_id: impl Into<String>) -> Self {
        self.context.set_user_id(user_id);
        self
    }

    pub fn trace_id(self, trace_id: impl Into<String>) -> Self {
        self.context.set_trace_id(trace_id);
        self
    }

    pub fn tracking_id(self, tracking_id: impl Into<String>) -> Self {
        self.context.set_tracking_id(tracking_id);
        self
    }

    pub fn custom_info(self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.add_custom_info(key, value);
        self
    }

    pub fn request_id(self, request_id: impl Into<String>) -> Self {
        self.custom_info("requestId", request_id.into())
    }

    pub fn business_tag(self, tag: impl Into<String>) -> Self {
        self.custom_info("businessTag", tag.into())
    }

    pub fn module_tag(self, tag: impl Into<String>) -> Self {
        self.custom_info("moduleTag", tag.into())
    }

    pub fn client_thread_id(self, id: impl Into<String>) -> Self {
        self.custom_info("clientThreadId", id.into())
    }

    pub fn build(self) -> Arc<MarkingContext> {
        Arc::new(self.context)
    }

    /// Install the context for the calling thread or task.
    pub fn apply(self) -> Arc<MarkingContext> {
        let context = self.build();
        set_current(Arc::clone(&context));
        context
    }

    /// Run `f` with the context installed; see [`scoped`].
    pub fn scope<T>(self, f: impl FnOnce() -> T) -> T {
        scoped(self.build(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_custom_info_operations() {
        let context = MarkingContext::new();
        context.add_custom_info("tenant", "acme").add_custom_info("shard", 3);
        assert_eq!(context.custom_info_len(), 2);
        assert!(context.has_custom_info("shard"));
        assert_eq!(context.custom_info("shard").as_deref(), Some("3"));

        context.add_custom_info("tenant", "globex");
        assert_eq!(context.custom_info("tenant").as_deref(), Some("globex"));
        assert_eq!(context.custom_info_len(), 2);

        context.extend_custom_info([("a", "1"), ("b", "2"), ("a", "3")]);
        assert_eq!(context.custom_info("a").as_deref(), Some("3"));
        assert_eq!(context.custom_info_len(), 4);

        assert_eq!(context.remove_custom_info("b").as_deref(), Some("2"));
        assert_eq!(context.remove_custom_info("b"), None);
        assert!(!context.has_custom_info("b"));

        context.clear_custom_info();
        assert_eq!(context.custom_info_len(), 0);
    }

    #[test]
    fn test_set_current_and_clear() {
        clear();
        assert!(current().is_none());
        assert_eq!(current_user_id(), None);

        set_current_user_id("u001");
        assert_eq!(current_user_id().as_deref(), Some("u001"));
        add_current_custom_info("requestId", "r-1");
        assert_eq!(current().unwrap().custom_info("requestId").as_deref(), Some("r-1"));

        clear();
        assert!(current().is_none());
    }

    #[test]
    fn test_scoped_restores_previous() {
        clear();
        let outer = Arc::new(MarkingContext::with_user_id("outer"));
        set_current(Arc::clone(&outer));

        let seen = scoped(Arc::new(MarkingContext::with_user_id("inner")), current_user_id);
        assert_eq!(seen.as_deref(), Some("inner"));
        assert_eq!(current_user_id().as_deref(), Some("outer"));

        clear();
        scoped(outer, || assert!(current().is_some()));
        assert!(current().is_none());
    }

    #[test]
    fn test_scoped_restores_on_panic() {
        clear();
        let result = std::panic::catch_unwind(|| {
            scoped(Arc::new(MarkingContext::with_user_id("doomed")), || {
                panic!("business failure");
            })
        });
        assert!(result.is_err());
        assert!(current().is_none());
    }

    #[test]
    fn test_spawn_copies_context() {
        clear();
        set_current_user_id("parent");
        add_current_custom_info("k", "v");

        let child = spawn(|| {
            let context = current().expect("inherited context");
            context.add_custom_info("child", "yes");
            (context.user_id(), context.custom_info("k"))
        });
        let (user, tag) = child.join().unwrap();
        assert_eq!(user.as_deref(), Some("parent"));
        assert_eq!(tag.as_deref(), Some("v"));
        assert!(!current().unwrap().has_custom_info("child"));
        clear();
    }

    #[test]
    fn test_parent_writes_after_spawn_are_invisible() {
        clear();
        set_current_user_id("before");
        let barrier = Arc::new(Barrier::new(2));
        let child_barrier = Arc::clone(&barrier);

        let child = spawn(move || {
            child_barrier.wait();
            current_user_id()
        });
        set_current_user_id("after");
        barrier.wait();

        assert_eq!(child.join().unwrap().as_deref(), Some("before"));
        clear();
    }

    #[test]
    fn test_plain_threads_start_empty() {
        set_current_user_id("someone");
        let seen = std::thread::spawn(current_user_id).join().unwrap();
        assert_eq!(seen, None);
        clear();
    }

    #[test]
    fn test_concurrent_flows_are_isolated() {
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|user| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    set_current_user_id(user);
                    barrier.wait();
                    (0..100).all(|_| current_user_id().as_deref() == Some(user))
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_shared_context_concurrent_writes() {
        let context = Arc::new(MarkingContext::new());
        std::thread::scope(|s| {
            for t in 0..4 {
                let context = Arc::clone(&context);
                s.spawn(move || {
                    for i in 0..50 {
                        context.add_custom_info(format!("t{}-{}", t, i), i);
                    }
                });
            }
        });
        assert_eq!(context.custom_info_len(), 200);
    }

    #[test]
    fn test_thread_ids_differ() {
        let here = current_thread_id();
        assert_eq!(here, current_thread_id());
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_builder() {
        clear();
        let context = MarkingContext::builder()
            .user_id("u7")
            .trace_id("trace-1")
            .tracking_id("track-1")
            .business_tag("checkout")
            .module_tag("orders")
            .client_thread_id("web-3")
            .apply();

        assert_eq!(current().unwrap().tracking_id().as_deref(), Some("track-1"));
        assert_eq!(context.trace_id().as_deref(), Some("trace-1"));
        assert_eq!(context.custom_info("businessTag").as_deref(), Some("checkout"));
        assert_eq!(context.custom_info_len(), 3);
        assert!(context.to_string().contains("user_id=u7"));
        clear();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_scopes_are_isolated() {
        let tasks: Vec<_> = ["alice", "bob", "carol"]
            .into_iter()
            .map(|user| {
                tokio::spawn(scope_async(Arc::new(MarkingContext::new()), async move {
                    set_current_user_id(user);
                    for _ in 0..50 {
                        tokio::task::yield_now().await;
                        if current_user_id().as_deref() != Some(user) {
                            return false;
                        }
                    }
                    true
                }))
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_unscoped_async_writes_are_ignored() {
        set_current_user_id("leaky");
        add_current_custom_info("k", "v");
        assert!(current().is_none());

        let seen = tokio::spawn(async { current_user_id() }).await.unwrap();
        assert_eq!(seen, None);
    }

    #[tokio::test]
    async fn test_scope_async_restores_and_clears() {
        let outer = Arc::new(MarkingContext::with_user_id("outer"));
        scope_async(outer, async {
            let inner = Arc::new(MarkingContext::with_user_id("inner"));
            let seen = scope_async(inner, async { current_user_id() }).await;
            assert_eq!(seen.as_deref(), Some("inner"));
            assert_eq!(current_user_id().as_deref(), Some("outer"));

            // Sync scopes nest inside a task scope
            let sync = scoped(Arc::new(MarkingContext::with_user_id("sync")), current_user_id);
            assert_eq!(sync.as_deref(), Some("sync"));
            assert_eq!(current_user_id().as_deref(), Some("outer"));

            clear();
            assert!(current().is_none());
        })
        .await;
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_propagate_async_copies_context() {
        let parent = Arc::new(MarkingContext::with_user_id("parent"));
        scope_async(Arc::clone(&parent), async {
            let child = tokio::spawn(propagate_async(async {
                let context = current().expect("inherited context");
                context.add_custom_info("child", "yes");
                set_current_user_id("child");
                current_user_id()
            }));
            assert_eq!(child.await.unwrap().as_deref(), Some("child"));
            assert_eq!(current_user_id().as_deref(), Some("parent"));
        })
        .await;
        assert!(!parent.has_custom_info("child"));
    }
}
