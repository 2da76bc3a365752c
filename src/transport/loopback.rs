//! In-memory loopback transport
//!
//! Echoes every accepted write back as readable input. Chunk limits on
//! both directions force partial completions, and reads or writes can be
//! stalled to simulate a silent peer. Used to exercise the engines without
//! real I/O.

use super::{ReadHandler, Transport, WriteHandler};
use crate::error::{Result, StreamError};
use crate::executor::Executor;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

struct LoopbackState {
    open: bool,
    echo: bool,
    inbound: BytesMut,
    errors: VecDeque<StreamError>,
    written: Vec<u8>,
    read_chunk: usize,
    write_chunk: usize,
    reads_stalled: bool,
    writes_stalled: bool,
    resets: usize,
}

struct Shared {
    state: Mutex<LoopbackState>,
    changed: Notify,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut LoopbackState) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.changed.notify_waiters();
        result
    }

    async fn read_some(&self, max: usize) -> Result<Bytes> {
        loop {
            let changed = self.changed.notified();
            {
                let mut st = self.state.lock();
                if !st.open {
                    return Err(StreamError::Cancelled);
                }
                if !st.reads_stalled {
                    if let Some(e) = st.errors.pop_front() {
                        return Err(e);
                    }
                    if !st.inbound.is_empty() {
                        let n = max.min(st.read_chunk).min(st.inbound.len());
                        let chunk = st.inbound.split_to(n).freeze();
                        if !st.inbound.is_empty() {
                            // Wake any other pending reader
                            self.changed.notify_waiters();
                        }
                        return Ok(chunk);
                    }
                }
            }
            changed.await;
        }
    }

    async fn write_some(&self, data: &[u8]) -> Result<usize> {
        loop {
            let changed = self.changed.notified();
            {
                let mut st = self.state.lock();
                if !st.open {
                    return Err(StreamError::Cancelled);
                }
                if !st.writes_stalled {
                    let n = data.len().min(st.write_chunk);
                    st.written.extend_from_slice(&data[..n]);
                    if st.echo {
                        st.inbound.extend_from_slice(&data[..n]);
                    }
                    drop(st);
                    self.changed.notify_waiters();
                    return Ok(n);
                }
            }
            changed.await;
        }
    }
}

/// Loopback transport double
///
/// # Example
///
/// ```ignore
/// let transport = LoopbackTransport::new(Executor::default());
/// transport.set_read_chunk(3);
/// let stream = Stream::new(transport.clone());
/// ```
pub struct LoopbackTransport {
    executor: Executor,
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Create an open loopback with unlimited chunk sizes and echo enabled
    pub fn new(executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            executor,
            shared: Arc::new(Shared {
                state: Mutex::new(LoopbackState {
                    open: true,
                    echo: true,
                    inbound: BytesMut::new(),
                    errors: VecDeque::new(),
                    written: Vec::new(),
                    read_chunk: usize::MAX,
                    write_chunk: usize::MAX,
                    reads_stalled: false,
                    writes_stalled: false,
                    resets: 0,
                }),
                changed: Notify::new(),
            }),
        })
    }

    /// Make `data` readable, as if the peer had sent it
    pub fn feed(&self, data: &[u8]) {
        self.shared.update(|st| st.inbound.extend_from_slice(data));
    }

    /// Fail the next read with `error`
    pub fn inject_read_error(&self, error: StreamError) {
        self.shared.update(|st| st.errors.push_back(error));
    }

    /// Largest chunk a single read returns
    pub fn set_read_chunk(&self, max: usize) {
        self.shared.update(|st| st.read_chunk = max.max(1));
    }

    /// Largest chunk a single write accepts
    pub fn set_write_chunk(&self, max: usize) {
        self.shared.update(|st| st.write_chunk = max.max(1));
    }

    /// While stalled, reads stay pending
    pub fn stall_reads(&self, stalled: bool) {
        self.shared.update(|st| st.reads_stalled = stalled);
    }

    /// While stalled, writes stay pending
    pub fn stall_writes(&self, stalled: bool) {
        self.shared.update(|st| st.writes_stalled = stalled);
    }

    /// Echo accepted writes back as input (default on)
    pub fn set_echo(&self, echo: bool) {
        self.shared.update(|st| st.echo = echo);
    }

    /// Every byte accepted by writes so far
    pub fn written(&self) -> Vec<u8> {
        self.shared.state.lock().written.clone()
    }

    /// Bytes readable right now
    pub fn pending_input(&self) -> usize {
        self.shared.state.lock().inbound.len()
    }

    /// Number of `reset()` calls
    pub fn resets(&self) -> usize {
        self.shared.state.lock().resets
    }
}

impl Transport for LoopbackTransport {
    fn executor(&self) -> &Executor {
        &self.executor
    }

    fn async_read_some(&self, max_count: usize, on_done: ReadHandler) {
        let shared = self.shared.clone();
        self.executor.spawn(async move {
            let result = shared.read_some(max_count).await;
            on_done(result);
        });
    }

    fn async_write_some(&self, data: Bytes, on_done: WriteHandler) {
        let shared = self.shared.clone();
        self.executor.spawn(async move {
            let result = shared.write_some(&data).await;
            on_done(result);
        });
    }

    fn flush(&self) -> Result<()> {
        self.shared.update(|st| st.inbound.clear());
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.shared.update(|st| {
            st.inbound.clear();
            st.errors.clear();
            st.open = true;
            st.resets += 1;
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    fn close(&self) {
        self.shared.update(|st| st.open = false);
    }
}
