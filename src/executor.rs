//! Executor: the run-loop every stream completion is dispatched on
//!
//! A cloneable handle over a tokio multi-thread runtime. All transport I/O,
//! engine continuations, timeouts and user callbacks run here.
//!
//! The runtime is started lazily on first use and can be stopped from any
//! thread, including one of its own workers.

use crate::constants::{DEFAULT_WORKER_THREADS, WORKER_THREAD_NAME};
use crate::error::{Result, StreamError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::debug;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the executor owning the current thread (0 = none)
    static CURRENT_EXECUTOR: Cell<u64> = const { Cell::new(0) };
}

/// Executor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker threads draining the task queue
    pub worker_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

/// Handle to a delayed task scheduled with [`Executor::schedule_after`]
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancel the delayed task
    ///
    /// No-op if it already fired. A task that is already running is not
    /// interrupted.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

struct Inner {
    id: u64,
    config: ExecutorConfig,
    runtime: Mutex<Option<Runtime>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

/// Shared run-loop for one stream
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Executor {
    /// Create an executor; the runtime starts on first use
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
                config,
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Start the runtime if it is not running
    pub fn start(&self) -> Result<()> {
        self.handle().map(|_| ())
    }

    /// Stop the runtime without waiting for pending tasks
    ///
    /// Pending completions are dropped. Safe to call from an executor thread.
    pub fn stop(&self) {
        let runtime = self.inner.runtime.lock().take();
        if let Some(rt) = runtime {
            debug!("Stopping executor {}", self.inner.id);
            rt.shutdown_background();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().is_some()
    }

    /// True when called from one of this executor's threads
    pub fn is_executor_thread(&self) -> bool {
        CURRENT_EXECUTOR.with(|c| c.get()) == self.inner.id
    }

    /// Queue `task` on the run-loop
    ///
    /// If the runtime cannot be started the task is dropped unrun.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { task() });
    }

    /// Run `task` once after `delay`
    ///
    /// Returns `None` if the runtime cannot be started.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> Option<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.handle().ok()?;
        let join = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        Some(TimerHandle {
            abort: join.abort_handle(),
        })
    }

    /// Spawn a future on the run-loop
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(handle) = self.handle() {
            handle.spawn(future);
        }
    }

    /// Run blocking I/O on the runtime's blocking pool
    pub fn spawn_blocking<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(handle) = self.handle() {
            handle.spawn_blocking(task);
        }
    }

    /// Runtime handle, starting the runtime if needed
    ///
    /// Used by transports to register sockets with the reactor.
    pub fn handle(&self) -> Result<Handle> {
        let mut runtime = self.inner.runtime.lock();
        if let Some(rt) = runtime.as_ref() {
            return Ok(rt.handle().clone());
        }

        let id = self.inner.id;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.inner.config.worker_threads.max(1))
            .thread_name(WORKER_THREAD_NAME)
            .on_thread_start(move || CURRENT_EXECUTOR.with(|c| c.set(id)))
            .enable_all()
            .build()
            .map_err(|source| StreamError::Runtime { source })?;
        debug!("Started executor {}", id);

        let handle = rt.handle().clone();
        *runtime = Some(rt);
        Ok(handle)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_executor_lazy_start() {
        let executor = Executor::default();
        assert!(!executor.is_running());

        let (tx, rx) = mpsc::channel();
        executor.submit(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
        assert!(executor.is_running());

        executor.stop();
        assert!(!executor.is_running());
    }

    #[test]
    fn test_executor_thread_detection() {
        let executor = Executor::default();
        assert!(!executor.is_executor_thread());

        let (tx, rx) = mpsc::channel();
        let probe = executor.clone();
        executor.submit(move || tx.send(probe.is_executor_thread()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());

        // Another executor's threads are not ours
        let other = Executor::default();
        let (tx, rx) = mpsc::channel();
        let probe = executor.clone();
        other.submit(move || tx.send(probe.is_executor_thread()).unwrap());
        assert!(!rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_schedule_after_fires_once() {
        let executor = Executor::default();
        let (tx, rx) = mpsc::channel();
        executor
            .schedule_after(Duration::from_millis(20), move || tx.send(()).unwrap())
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let executor = Executor::default();
        let (tx, rx) = mpsc::channel::<()>();
        let timer = executor
            .schedule_after(Duration::from_millis(50), move || tx.send(()).unwrap())
            .unwrap();
        timer.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn test_stop_from_executor_thread() {
        let executor = Executor::default();
        let (tx, rx) = mpsc::channel();
        let inner = executor.clone();
        executor.submit(move || {
            inner.stop();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!executor.is_running());
    }
}
