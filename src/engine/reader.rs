//! Read engine
//!
//! Owns at most one read in flight against one transport. A read completes
//! when:
//! - exact read: `count` bytes arrived
//! - read-some: any bytes arrived
//! - delimiter read: the delimiter arrived, or `max_size` bytes did
//! - an error occurred, or the timeout elapsed
//!
//! Bytes pulled from the transport past a delimiter belong to the next read
//! and are kept in a carry-over buffer, which every read drains before
//! touching the transport again.

use super::{block_on_completion, effective_timeout, Generations};
use crate::constants::CARRY_OVER_CAPACITY;
use crate::error::{Completion, Result, StreamError};
use crate::executor::{Executor, TimerHandle};
use crate::transport::Transport;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Callback of an asynchronous read: outcome and the caller's buffer back
pub type ReadCallback = Box<dyn FnOnce(Completion, Vec<u8>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Some,
    Exact,
    Until(u8),
}

impl ReadMode {
    /// Bytes of `data` that belong to the current read, and whether the
    /// delimiter ends it
    fn scan(self, data: &[u8]) -> (usize, bool) {
        match self {
            Self::Until(delimiter) => match data.iter().position(|&b| b == delimiter) {
                Some(i) => (i + 1, true),
                None => (data.len(), false),
            },
            Self::Some | Self::Exact => (data.len(), false),
        }
    }
}

struct PendingRead {
    generation: u64,
    mode: ReadMode,
    requested: usize,
    processed: usize,
    buf: Vec<u8>,
    callback: ReadCallback,
    timer: Option<TimerHandle>,
}

struct ReadState {
    generations: Generations,
    pending: Option<PendingRead>,
    carry_over: BytesMut,
}

struct ReadInner {
    transport: Arc<dyn Transport>,
    state: Mutex<ReadState>,
}

impl ReadInner {
    fn executor(&self) -> &Executor {
        self.transport.executor()
    }

    /// Admit a read, serve it from the carry-over buffer, then go to the
    /// transport for the rest. Gives the buffer back on refusal.
    fn begin(
        self: &Arc<Self>,
        mode: ReadMode,
        count: usize,
        mut buf: Vec<u8>,
        timeout: Option<Duration>,
        callback: ReadCallback,
    ) -> std::result::Result<(), (StreamError, Vec<u8>)> {
        if buf.len() < count {
            let len = buf.len();
            return Err((StreamError::BufferTooSmall { needed: count, len }, buf));
        }

        let mut state = self.state.lock();
        if state.pending.is_some() {
            return Err((StreamError::OperationInProgress, buf));
        }
        let generation = state.generations.next();

        let available = state.carry_over.len().min(count);
        let (processed, found) = mode.scan(&state.carry_over[..available]);
        buf[..processed].copy_from_slice(&state.carry_over[..processed]);
        state.carry_over.advance(processed);

        let satisfied = count == 0
            || found
            || processed == count
            || (mode == ReadMode::Some && processed > 0);
        if satisfied {
            drop(state);
            self.executor()
                .submit(move || callback(Completion::ok(processed), buf));
            return Ok(());
        }

        let timer = effective_timeout(timeout).and_then(|delay| {
            let weak = Arc::downgrade(self);
            self.executor().schedule_after(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.timeout_reached(generation);
                }
            })
        });

        state.pending = Some(PendingRead {
            generation,
            mode,
            requested: count,
            processed,
            buf,
            callback,
            timer,
        });
        drop(state);

        self.issue(generation, count - processed);
        Ok(())
    }

    fn issue(self: &Arc<Self>, generation: u64, max: usize) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.transport.async_read_some(
            max,
            Box::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_chunk(generation, result);
                }
            }),
        );
    }

    fn on_chunk(self: &Arc<Self>, generation: u64, result: Result<Bytes>) {
        let mut state = self.state.lock();
        let ReadState {
            pending,
            carry_over,
            ..
        } = &mut *state;

        let op = match pending {
            Some(op) if op.generation == generation => op,
            // Stale: the timeout already delivered this read
            _ => return,
        };

        let error = match result {
            Ok(chunk) if chunk.is_empty() => Some(StreamError::EndOfStream),
            Ok(chunk) => {
                let room = op.requested - op.processed;
                let (take, found) = op.mode.scan(&chunk[..chunk.len().min(room)]);
                op.buf[op.processed..op.processed + take].copy_from_slice(&chunk[..take]);
                op.processed += take;
                carry_over.extend_from_slice(&chunk[take..]);

                let done = found || op.processed == op.requested || op.mode == ReadMode::Some;
                if !done {
                    let remaining = op.requested - op.processed;
                    drop(state);
                    self.issue(generation, remaining);
                    return;
                }
                None
            }
            Err(e) => Some(e),
        };

        if let Some(op) = state.pending.take() {
            drop(state);
            self.finish(op, error);
        }
    }

    fn timeout_reached(&self, generation: u64) {
        let mut state = self.state.lock();
        let mut op = match state.pending.take() {
            Some(op) if op.generation == generation => op,
            other => {
                // Completed naturally before the timer got here
                state.pending = other;
                return;
            }
        };
        drop(state);

        debug!(
            "Read timed out after {} of {} bytes",
            op.processed, op.requested
        );
        // The transport read stays in flight; its completion will be stale
        op.timer = None;
        self.finish(op, Some(StreamError::TimedOut));
    }

    fn finish(&self, mut op: PendingRead, error: Option<StreamError>) {
        if let Some(timer) = op.timer.take() {
            timer.cancel();
        }
        let completion = Completion {
            error,
            transferred: op.processed,
        };
        let PendingRead { callback, buf, .. } = op;
        self.executor().submit(move || callback(completion, buf));
    }

    /// Fail the active read, if any, with `error`
    fn abort(&self, error: StreamError) {
        let op = self.state.lock().pending.take();
        if let Some(op) = op {
            debug!("Aborting read after {} bytes: {}", op.processed, error);
            self.finish(op, Some(error));
        }
    }
}

/// Read side of a stream
pub struct ReadEngine {
    inner: Arc<ReadInner>,
    sync_caller: Mutex<()>,
}

impl ReadEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ReadInner {
                transport,
                state: Mutex::new(ReadState {
                    generations: Generations::default(),
                    pending: None,
                    carry_over: BytesMut::with_capacity(CARRY_OVER_CAPACITY),
                }),
            }),
            sync_caller: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Generation of the active read, 0 when idle
    pub fn generation(&self) -> u64 {
        self.inner
            .state
            .lock()
            .pending
            .as_ref()
            .map(|op| op.generation)
            .unwrap_or(0)
    }

    pub fn is_busy(&self) -> bool {
        self.generation() != 0
    }

    /// Bytes held in the carry-over buffer
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().carry_over.len()
    }

    /// Discard unread input: carry-over buffer and transport buffers
    ///
    /// An active read is left running.
    pub fn flush(&self) -> Result<()> {
        self.inner.state.lock().carry_over.clear();
        self.inner.transport.flush()
    }

    /// Fail the active read with a connection-reset error, drop the
    /// carry-over buffer and reset the transport
    pub fn reset(&self) -> Result<()> {
        self.inner.abort(StreamError::io(
            std::io::ErrorKind::ConnectionReset,
            "stream reset",
        ));
        self.inner.state.lock().carry_over.clear();
        self.inner.transport.reset()
    }

    /// Read whatever is available, up to `count` bytes
    ///
    /// Served from the carry-over buffer alone when it is not empty.
    pub fn async_read_some<F>(
        &self,
        count: usize,
        buf: Vec<u8>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Completion, Vec<u8>) + Send + 'static,
    {
        self.inner
            .begin(ReadMode::Some, count, buf, timeout, Box::new(callback))
            .map_err(|(e, _)| e)
    }

    /// Read exactly `count` bytes into `buf[..count]`
    ///
    /// Fails immediately with `OperationInProgress` if a read is active.
    /// The callback runs once, on the executor, with the bytes read so far.
    pub fn async_read<F>(
        &self,
        count: usize,
        buf: Vec<u8>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Completion, Vec<u8>) + Send + 'static,
    {
        self.inner
            .begin(ReadMode::Exact, count, buf, timeout, Box::new(callback))
            .map_err(|(e, _)| e)
    }

    /// Read up to and including `delimiter`, at most `max_size` bytes
    pub fn async_read_until<F>(
        &self,
        max_size: usize,
        buf: Vec<u8>,
        delimiter: u8,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Completion, Vec<u8>) + Send + 'static,
    {
        self.inner
            .begin(
                ReadMode::Until(delimiter),
                max_size,
                buf,
                timeout,
                Box::new(callback),
            )
            .map_err(|(e, _)| e)
    }

    /// Blocking exact read
    ///
    /// Returns `Err` for usage errors only; transport errors and timeouts
    /// come back in the `Completion` with the partial count. `buf` must
    /// hold at least `count` bytes.
    pub fn read(
        &self,
        count: usize,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        self.read_blocking(ReadMode::Exact, count, buf, timeout)
    }

    /// Blocking delimiter read
    pub fn read_until(
        &self,
        max_size: usize,
        buf: &mut Vec<u8>,
        delimiter: u8,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        self.read_blocking(ReadMode::Until(delimiter), max_size, buf, timeout)
    }

    fn read_blocking(
        &self,
        mode: ReadMode,
        count: usize,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        let (completion, returned) = block_on_completion(
            self.inner.executor(),
            &self.sync_caller,
            |done| {
                let owned = std::mem::take(buf);
                let callback: ReadCallback =
                    Box::new(move |completion, b| done.complete((completion, b)));
                self.inner
                    .begin(mode, count, owned, timeout, callback)
                    .map_err(|(e, b)| {
                        *buf = b;
                        e
                    })
            },
        )?;
        *buf = returned;
        Ok(completion)
    }
}
