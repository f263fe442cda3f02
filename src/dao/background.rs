//! Background execution bridge.
//!
//! Write operations can be handed to a process-wide multi-threaded runtime
//! and observed later through a [`BackgroundTask`]. The runtime is built on
//! first use and lives until [`shutdown_background`] is called or the process
//! exits; it is not owned by any `Dao`.

use crate::error::{DbError, DbResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Lower bound on background worker threads.
pub const MIN_WORKERS: usize = 4;

const WORKER_THREAD_NAME: &str = "dao-bg";

static RUNTIME: RwLock<Option<Runtime>> = RwLock::new(None);
static RUNTIME_STARTS: AtomicUsize = AtomicUsize::new(0);

/// Worker threads the background runtime starts with.
pub fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(MIN_WORKERS)
}

/// How many times a background runtime has been built in this process.
pub fn runtime_starts() -> usize {
    RUNTIME_STARTS.load(Ordering::Acquire)
}

/// Handle to the background runtime, starting it if needed.
fn runtime_handle() -> DbResult<Handle> {
    {
        let guard = RUNTIME.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(rt) = guard.as_ref() {
            return Ok(rt.handle().clone());
        }
    }

    let mut guard = RUNTIME.write().unwrap_or_else(PoisonError::into_inner);
    // Another thread may have started it while we waited for the write lock
    if let Some(rt) = guard.as_ref() {
        return Ok(rt.handle().clone());
    }

    let workers = worker_count();
    let rt = Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name(WORKER_THREAD_NAME)
        .enable_all()
        .build()
        .map_err(|e| DbError::internal(format!("Failed to start background runtime: {}", e)))?;
    let starts = RUNTIME_STARTS.fetch_add(1, Ordering::AcqRel) + 1;
    info!(workers, starts, "Background runtime started");

    let handle = rt.handle().clone();
    *guard = Some(rt);
    Ok(handle)
}

/// Stop the background runtime without waiting for queued work.
///
/// Tasks that had not finished resolve to `DbError::Internal`. The next
/// submission starts a fresh runtime. Returns false if none was running.
pub fn shutdown_background() -> bool {
    let rt = RUNTIME
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match rt {
        Some(rt) => {
            rt.shutdown_background();
            info!("Background runtime shut down");
            true
        }
        None => false,
    }
}

// =============================================================================
// Task handle
// =============================================================================

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// Where a background task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    Running,
    Done,
    /// Cancelled before it started.
    Cancelled,
}

struct TaskShared<T> {
    operation: &'static str,
    state: AtomicU8,
    result: watch::Sender<Option<DbResult<T>>>,
    // Wakes threads parked in `wait`; async readers subscribe to `result`
    parked: Mutex<()>,
    ready: Condvar,
}

impl<T> TaskShared<T> {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            state: AtomicU8::new(PENDING),
            result: watch::channel(None).0,
            parked: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    fn park(&self) -> MutexGuard<'_, ()> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_result(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Claim the task for execution. Fails if it was cancelled first.
    fn start(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Store the result. Only the first call has any effect.
    fn complete(&self, result: DbResult<T>) -> bool {
        let stored = self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
        if !stored {
            return false;
        }
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != CANCELLED).then_some(DONE)
            });
        let _parked = self.park();
        self.ready.notify_all();
        true
    }
}

/// Write-once handle to the result of a background operation.
///
/// Any number of clones may observe the result, by blocking
/// ([`wait`](Self::wait)), by polling ([`is_done`](Self::is_done)) or by
/// awaiting it.
pub struct BackgroundTask<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> Clone for BackgroundTask<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for BackgroundTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("operation", &self.shared.operation)
            .field("status", &self.status())
            .finish()
    }
}

impl<T> BackgroundTask<T> {
    fn new(operation: &'static str) -> Self {
        Self {
            shared: Arc::new(TaskShared::new(operation)),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.shared.operation
    }

    pub fn status(&self) -> TaskStatus {
        match self.shared.state.load(Ordering::Acquire) {
            PENDING => TaskStatus::Pending,
            RUNNING => TaskStatus::Running,
            CANCELLED => TaskStatus::Cancelled,
            _ => TaskStatus::Done,
        }
    }

    /// True once a result is available.
    pub fn is_done(&self) -> bool {
        self.shared.has_result()
    }

    /// Cancel the task if no worker has started it yet.
    ///
    /// Work already running is never interrupted; it commits or rolls back
    /// on its own and this returns false.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .shared
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.shared
                .complete(Err(DbError::cancelled(self.shared.operation)));
            debug!(operation = self.shared.operation, "Background operation cancelled");
        }
        cancelled
    }
}

impl<T: Clone> BackgroundTask<T> {
    /// The result, if it is already there.
    pub fn try_result(&self) -> Option<DbResult<T>> {
        self.shared.result.borrow().clone()
    }

    /// Block the calling thread until the result is available.
    ///
    /// Must not be called from inside an async task.
    pub fn wait(&self) -> DbResult<T> {
        let mut parked = self.shared.park();
        loop {
            if let Some(result) = self.try_result() {
                return result;
            }
            parked = self
                .shared
                .ready
                .wait(parked)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DbResult<T>> {
        let _parked = self
            .shared
            .ready
            .wait_timeout_while(self.shared.park(), timeout, |_| !self.shared.has_result())
            .unwrap_or_else(PoisonError::into_inner);
        self.try_result()
    }

    /// Suspend the calling task until the result is available.
    pub async fn join(&self) -> DbResult<T> {
        let mut rx = self.shared.result.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot
                .clone()
                .unwrap_or_else(|| Err(DbError::internal("Background result missing"))),
            // The sender lives in `self.shared`, so it cannot be gone
            Err(_) => Err(DbError::internal("Background task abandoned")),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for BackgroundTask<T> {
    type Output = DbResult<T>;
    type IntoFuture = BoxFuture<'static, DbResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.join().await })
    }
}

// =============================================================================
// Submission
// =============================================================================

/// Resolves the task if the worker drops it before finishing, which only
/// happens when the runtime shuts down.
struct CompletionGuard<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if self.shared.complete(Err(DbError::internal(
            "Background runtime shut down before the operation finished",
        ))) {
            debug!(operation = self.shared.operation, "Background operation dropped");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Run `fut` on the background runtime.
///
/// A failure is logged with `dao` and `operation` and stored in the task; it
/// is never dropped silently, but a caller that never looks at the task will
/// not see it.
pub fn submit<T, Fut>(dao: &str, operation: &'static str, fut: Fut) -> BackgroundTask<T>
where
    T: Send + Sync + 'static,
    Fut: Future<Output = DbResult<T>> + Send + 'static,
{
    let task = BackgroundTask::new(operation);

    let handle = match runtime_handle() {
        Ok(handle) => handle,
        Err(e) => {
            error!(dao = %dao, operation, error = %e, "Background operation not started");
            task.shared.complete(Err(e));
            return task;
        }
    };

    let dao = dao.to_string();
    let guard = CompletionGuard {
        shared: Arc::clone(&task.shared),
    };
    handle.spawn(async move {
        let guard = guard;
        if !guard.shared.start() {
            return;
        }

        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(DbError::internal(format!(
                "Background {} panicked: {}",
                operation,
                panic_message(payload.as_ref())
            ))),
        };
        if let Err(e) = &result {
            error!(dao = %dao, operation, error = %e, "Background operation failed");
        }
        guard.shared.complete(result);
    });

    task
}
