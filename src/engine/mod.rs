//! Completion engines
//!
//! Turn a transport's "some bytes" primitive into whole operations:
//! - `ReadEngine`: exact-count, read-some and delimiter reads with carry-over
//! - `WriteEngine`: exact-count and write-some writes
//!
//! Both engines share the same machinery:
//! - one operation in flight per engine, tagged with a generation number
//! - continuations (transport completion, timeout) compare their captured
//!   generation against the active one and do nothing on mismatch
//! - the caller's callback is always queued on the executor, never run inline
//! - blocking forms wait on a result cell filled by that callback

pub mod reader;
pub mod writer;

pub use reader::{ReadCallback, ReadEngine};
pub use writer::{WriteCallback, WriteEngine};

use crate::error::{Result, StreamError};
use crate::executor::Executor;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Generation numbers handed to accepted operations
///
/// Never yields 0, which stands for "no operation in progress".
#[derive(Debug, Default)]
pub(crate) struct Generations {
    counter: u64,
}

impl Generations {
    pub(crate) fn next(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(1);
        if self.counter == 0 {
            self.counter = 1;
        }
        self.counter
    }
}

/// Zero means "no timeout"
pub(crate) fn effective_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|d| !d.is_zero())
}

enum Slot<T> {
    Pending,
    Done(T),
    Dropped,
}

/// Result cell a blocked caller waits on
struct SyncCell<T> {
    slot: Mutex<Slot<T>>,
    signal: Condvar,
}

impl<T> SyncCell<T> {
    fn set(&self, slot: Slot<T>) {
        *self.slot.lock() = slot;
        self.signal.notify_all();
    }

    fn wait(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Pending) {
                Slot::Pending => self.signal.wait(&mut slot),
                Slot::Done(value) => return Some(value),
                Slot::Dropped => return None,
            }
        }
    }
}

/// Write side of a `SyncCell`, moved into the operation's callback
///
/// Dropping it without completing (the executor stopped before running the
/// callback) wakes the waiter with `Cancelled`.
pub(crate) struct Completer<T> {
    cell: Arc<SyncCell<T>>,
    done: bool,
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, value: T) {
        self.done = true;
        self.cell.set(Slot::Done(value));
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.done {
            self.cell.set(Slot::Dropped);
        }
    }
}

/// Run an asynchronous operation and block until its callback fires
///
/// `caller` serializes blocking callers of one engine. `start` admits the
/// operation, handing the completer to its callback.
pub(crate) fn block_on_completion<T, F>(
    executor: &Executor,
    caller: &Mutex<()>,
    start: F,
) -> Result<T>
where
    F: FnOnce(Completer<T>) -> Result<()>,
{
    if executor.is_executor_thread() {
        return Err(StreamError::BlockingInExecutor);
    }

    let _caller = caller.lock();
    let cell = Arc::new(SyncCell {
        slot: Mutex::new(Slot::Pending),
        signal: Condvar::new(),
    });
    start(Completer {
        cell: cell.clone(),
        done: false,
    })?;

    cell.wait().ok_or(StreamError::Cancelled)
}
