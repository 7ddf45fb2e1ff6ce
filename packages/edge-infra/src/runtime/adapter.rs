//! Uniform capability surface over the four hosting runtimes.
//!
//! The HTTP layer only ever uses `is_development`, `read_env_var` and
//! `schedule_background`. What differs per runtime is where environment
//! values come from and who keeps background work alive.

use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::RuntimeKind;
use crate::config::env::{is_development, EnvSource, ProcessEnv};

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;
pub type BackgroundTask = BoxFuture<'static, Result<(), TaskError>>;

pub trait RuntimeAdapter: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn is_development(&self) -> bool;

    fn read_env_var(&self, key: &str) -> Option<String>;

    /// Fire-and-forget. Ordering between tasks is unspecified and a scheduled
    /// task cannot be cancelled.
    fn schedule_background(&self, task: BackgroundTask);

    fn initialize(&self) {
        info!(runtime = %self.kind(), "runtime adapter initialized");
    }
}

/// The host's deferred-execution hook (`ctx.waitUntil` on Workers).
pub trait DeferredExecution: Send + Sync {
    fn wait_until(&self, task: BackgroundTask);
}

/// Collects deferred tasks until the worker entry point hands them to the host.
#[derive(Default)]
pub struct WaitUntilQueue {
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl WaitUntilQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Take every queued task, leaving the queue empty.
    pub fn drain(&self) -> Vec<BackgroundTask> {
        std::mem::take(&mut *self.tasks.lock())
    }

    /// Await every queued task; returns how many failed. Failures are logged.
    pub async fn settle(&self) -> usize {
        let results = join_all(self.drain()).await;
        let mut failed = 0;
        for err in results.into_iter().filter_map(Result::err) {
            failed += 1;
            error!(runtime = %RuntimeKind::Cloudflare, error = %err, "background task failed");
        }
        failed
    }
}

impl DeferredExecution for WaitUntilQueue {
    fn wait_until(&self, task: BackgroundTask) {
        self.tasks.lock().push(task);
    }
}

impl std::fmt::Debug for WaitUntilQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitUntilQueue").field("len", &self.len()).finish()
    }
}

/// Spawn on the ambient tokio runtime and log a failure instead of surfacing it.
fn spawn_logged(runtime: RuntimeKind, tracker: Option<&TaskTracker>, task: BackgroundTask) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        error!(runtime = %runtime, "no async runtime available; background task was not run");
        return;
    };
    let logged = async move {
        if let Err(err) = task.await {
            error!(runtime = %runtime, error = %err, "background task failed");
        }
    };
    match tracker {
        Some(tracker) => {
            tracker.spawn_on(logged, &handle);
        }
        None => {
            handle.spawn(logged);
        }
    }
}

/// Node-style process.
///
/// Completion of background tasks before process exit is NOT guaranteed: a
/// caller that needs it must await [`NodeAdapter::drain_background`] during
/// shutdown. Serverless deployments usually should; long-lived containers may not.
#[derive(Debug)]
pub struct NodeAdapter {
    development: bool,
    tracker: TaskTracker,
}

impl NodeAdapter {
    pub fn new(env: &dyn EnvSource) -> Self {
        Self {
            development: is_development(env),
            tracker: TaskTracker::new(),
        }
    }

    pub fn pending_background(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every background task spawned so far.
    pub async fn drain_background(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl RuntimeAdapter for NodeAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Node
    }

    fn is_development(&self) -> bool {
        self.development
    }

    fn read_env_var(&self, key: &str) -> Option<String> {
        ProcessEnv.var(key)
    }

    fn schedule_background(&self, task: BackgroundTask) {
        spawn_logged(RuntimeKind::Node, Some(&self.tracker), task);
    }
}

/// Cloudflare-style isolate. The isolate may be torn down as soon as the
/// response is sent, so every task must reach the host's deferred queue.
pub struct CloudflareAdapter {
    env: Arc<dyn EnvSource>,
    development: bool,
    deferred: Arc<dyn DeferredExecution>,
    queue: Option<Arc<WaitUntilQueue>>,
}

impl CloudflareAdapter {
    /// Tasks collect in an internal [`WaitUntilQueue`]; see [`Self::wait_until_queue`].
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        let queue = Arc::new(WaitUntilQueue::new());
        Self {
            development: is_development(env.as_ref()),
            env,
            deferred: queue.clone(),
            queue: Some(queue),
        }
    }

    /// Forward tasks straight to the host's execution context.
    pub fn with_deferred(env: Arc<dyn EnvSource>, deferred: Arc<dyn DeferredExecution>) -> Self {
        Self {
            development: is_development(env.as_ref()),
            env,
            deferred,
            queue: None,
        }
    }

    /// The internal queue, when no host hook was injected.
    pub fn wait_until_queue(&self) -> Option<&Arc<WaitUntilQueue>> {
        self.queue.as_ref()
    }
}

impl RuntimeAdapter for CloudflareAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Cloudflare
    }

    fn is_development(&self) -> bool {
        self.development
    }

    fn read_env_var(&self, key: &str) -> Option<String> {
        self.env.var(key)
    }

    fn schedule_background(&self, task: BackgroundTask) {
        self.deferred.wait_until(task);
    }
}

impl std::fmt::Debug for CloudflareAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareAdapter")
            .field("development", &self.development)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Vercel-edge-style isolate; the platform keeps it alive until promises settle.
pub struct VercelEdgeAdapter {
    env: Arc<dyn EnvSource>,
    development: bool,
}

impl VercelEdgeAdapter {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            development: is_development(env.as_ref()),
            env,
        }
    }
}

impl RuntimeAdapter for VercelEdgeAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::VercelEdge
    }

    fn is_development(&self) -> bool {
        self.development
    }

    fn read_env_var(&self, key: &str) -> Option<String> {
        self.env.var(key)
    }

    fn schedule_background(&self, task: BackgroundTask) {
        spawn_logged(RuntimeKind::VercelEdge, None, task);
    }
}

/// Deno process; runs until outstanding work settles.
pub struct DenoAdapter {
    env: Arc<dyn EnvSource>,
    development: bool,
}

impl DenoAdapter {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            development: is_development(env.as_ref()),
            env,
        }
    }
}

impl RuntimeAdapter for DenoAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Deno
    }

    fn is_development(&self) -> bool {
        self.development
    }

    fn read_env_var(&self, key: &str) -> Option<String> {
        self.env.var(key)
    }

    fn schedule_background(&self, task: BackgroundTask) {
        spawn_logged(RuntimeKind::Deno, None, task);
    }
}

#[derive(Debug)]
pub enum RuntimeCapabilities {
    Node(NodeAdapter),
    Cloudflare(CloudflareAdapter),
    VercelEdge(VercelEdgeAdapter),
    Deno(DenoAdapter),
}

impl RuntimeCapabilities {
    fn adapter(&self) -> &dyn RuntimeAdapter {
        match self {
            RuntimeCapabilities::Node(a) => a,
            RuntimeCapabilities::Cloudflare(a) => a,
            RuntimeCapabilities::VercelEdge(a) => a,
            RuntimeCapabilities::Deno(a) => a,
        }
    }

    /// Box and schedule any `'static` future.
    pub fn schedule<F>(&self, task: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.schedule_background(Box::pin(task));
    }

    pub fn as_node(&self) -> Option<&NodeAdapter> {
        match self {
            RuntimeCapabilities::Node(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_cloudflare(&self) -> Option<&CloudflareAdapter> {
        match self {
            RuntimeCapabilities::Cloudflare(a) => Some(a),
            _ => None,
        }
    }
}

impl RuntimeAdapter for RuntimeCapabilities {
    fn kind(&self) -> RuntimeKind {
        self.adapter().kind()
    }

    fn is_development(&self) -> bool {
        self.adapter().is_development()
    }

    fn read_env_var(&self, key: &str) -> Option<String> {
        self.adapter().read_env_var(key)
    }

    fn schedule_background(&self, task: BackgroundTask) {
        self.adapter().schedule_background(task)
    }
}

impl std::fmt::Debug for VercelEdgeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VercelEdgeAdapter")
            .field("development", &self.development)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DenoAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenoAdapter")
            .field("development", &self.development)
            .finish_non_exhaustive()
    }
}

/// Build the capability object for `kind`, once per process or isolate.
pub fn capabilities_for(kind: RuntimeKind, env: Arc<dyn EnvSource>) -> RuntimeCapabilities {
    match kind {
        RuntimeKind::Node => RuntimeCapabilities::Node(NodeAdapter::new(env.as_ref())),
        RuntimeKind::Cloudflare => RuntimeCapabilities::Cloudflare(CloudflareAdapter::new(env)),
        RuntimeKind::VercelEdge => RuntimeCapabilities::VercelEdge(VercelEdgeAdapter::new(env)),
        RuntimeKind::Deno => RuntimeCapabilities::Deno(DenoAdapter::new(env)),
    }
}
