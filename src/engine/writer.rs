//! Write engine
//!
//! Mirror of the read engine without delimiter or carry-over logic: owns at
//! most one write in flight and keeps submitting partial transport writes
//! until every byte is accepted, an error occurs or the timeout elapses.
//!
//! Optionally mirrors every accepted chunk to a dump file.

use super::{block_on_completion, effective_timeout, Generations};
use crate::constants::DEFAULT_DUMP_FILE;
use crate::error::{Completion, Result, StreamError};
use crate::executor::{Executor, TimerHandle};
use crate::transport::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback of an asynchronous write
pub type WriteCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Some,
    All,
}

struct PendingWrite {
    generation: u64,
    mode: WriteMode,
    data: Bytes,
    processed: usize,
    callback: WriteCallback,
    timer: Option<TimerHandle>,
}

struct WriteState {
    generations: Generations,
    pending: Option<PendingWrite>,
}

/// File receiving a copy of every transmitted byte
struct TxDump {
    path: PathBuf,
    writer: BufWriter<File>,
}

struct WriteInner {
    transport: Arc<dyn Transport>,
    state: Mutex<WriteState>,
    dump: Mutex<Option<TxDump>>,
}

impl WriteInner {
    fn executor(&self) -> &Executor {
        self.transport.executor()
    }

    fn begin(
        self: &Arc<Self>,
        mode: WriteMode,
        data: Bytes,
        timeout: Option<Duration>,
        callback: WriteCallback,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending.is_some() {
            return Err(StreamError::OperationInProgress);
        }
        let generation = state.generations.next();

        if data.is_empty() {
            drop(state);
            self.executor().submit(move || callback(Completion::ok(0)));
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

        let chunk = data.clone();
        state.pending = Some(PendingWrite {
            generation,
            mode,
            data,
            processed: 0,
            callback,
            timer,
        });
        drop(state);

        self.issue(generation, chunk);
        Ok(())
    }

    fn issue(self: &Arc<Self>, generation: u64, chunk: Bytes) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.transport.async_write_some(
            chunk,
            Box::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_chunk(generation, result);
                }
            }),
        );
    }

    fn on_chunk(self: &Arc<Self>, generation: u64, result: Result<usize>) {
        let mut state = self.state.lock();
        let op = match state.pending.as_mut() {
            Some(op) if op.generation == generation => op,
            // Stale: the timeout already delivered this write
            _ => return,
        };

        let (error, accepted) = match result {
            Ok(0) => (
                Some(StreamError::io(
                    std::io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                )),
                Bytes::new(),
            ),
            Ok(n) => {
                let n = n.min(op.data.len() - op.processed);
                let accepted = op.data.slice(op.processed..op.processed + n);
                op.processed += n;
                (None, accepted)
            }
            Err(e) => (Some(e), Bytes::new()),
        };

        let more = error.is_none() && op.mode == WriteMode::All && op.processed < op.data.len();
        let next = more.then(|| op.data.slice(op.processed..));
        let finished = if more { None } else { state.pending.take() };
        drop(state);

        self.record(&accepted);
        match (next, finished) {
            (Some(chunk), _) => self.issue(generation, chunk),
            (None, Some(op)) => self.finish(op, error),
            (None, None) => {}
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
            "Write timed out after {} of {} bytes",
            op.processed,
            op.data.len()
        );
        op.timer = None;
        self.finish(op, Some(StreamError::TimedOut));
    }

    fn finish(&self, mut op: PendingWrite, error: Option<StreamError>) {
        if let Some(timer) = op.timer.take() {
            timer.cancel();
        }
        let completion = Completion {
            error,
            transferred: op.processed,
        };
        let callback = op.callback;
        self.executor().submit(move || callback(completion));
    }

    fn abort(&self, error: StreamError) {
        let op = self.state.lock().pending.take();
        if let Some(op) = op {
            debug!("Aborting write after {} bytes: {}", op.processed, error);
            self.finish(op, Some(error));
        }
    }

    /// Append accepted bytes to the dump file, if enabled
    fn record(&self, accepted: &[u8]) {
        if accepted.is_empty() {
            return;
        }
        let mut dump = self.dump.lock();
        let Some(tx_dump) = dump.as_mut() else {
            return;
        };
        let result = tx_dump
            .writer
            .write_all(accepted)
            .and_then(|_| tx_dump.writer.flush());
        if let Err(e) = result {
            warn!(
                "Disabling write dump {}: {}",
                tx_dump.path.display(),
                e
            );
            *dump = None;
        }
    }
}

/// Write side of a stream
pub struct WriteEngine {
    inner: Arc<WriteInner>,
    sync_caller: Mutex<()>,
}

impl WriteEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(WriteInner {
                transport,
                state: Mutex::new(WriteState {
                    generations: Generations::default(),
                    pending: None,
                }),
                dump: Mutex::new(None),
            }),
            sync_caller: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Generation of the active write, 0 when idle
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

    pub fn flush(&self) -> Result<()> {
        self.inner.transport.flush()
    }

    /// Fail the active write with a connection-reset error and reset the
    /// transport
    pub fn reset(&self) -> Result<()> {
        self.abort();
        self.inner.transport.reset()
    }

    /// Fail the active write, if any, with a connection-reset error
    pub(crate) fn abort(&self) {
        self.inner.abort(StreamError::io(
            std::io::ErrorKind::ConnectionReset,
            "stream reset",
        ));
    }

    /// Mirror transmitted bytes to `path`, appending or truncating
    pub fn enable_dump(&self, path: impl AsRef<Path>, append: bool) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .map_err(|source| StreamError::DumpOpen {
                path: path.clone(),
                source,
            })?;

        info!("Dumping transmitted bytes to {}", path.display());
        *self.inner.dump.lock() = Some(TxDump {
            path,
            writer: BufWriter::new(file),
        });
        Ok(())
    }

    /// Dump to the default file name in the working directory
    pub fn enable_default_dump(&self, append: bool) -> Result<()> {
        self.enable_dump(DEFAULT_DUMP_FILE, append)
    }

    pub fn disable_dump(&self) {
        if let Some(mut dump) = self.inner.dump.lock().take() {
            let _ = dump.writer.flush();
        }
    }

    pub fn dump_enabled(&self) -> bool {
        self.inner.dump.lock().is_some()
    }

    /// Submit a single transport write; the callback reports how much of
    /// `data` was accepted
    pub fn async_write_some<F>(
        &self,
        data: impl Into<Bytes>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.inner
            .begin(WriteMode::Some, data.into(), timeout, Box::new(callback))
    }

    /// Write all of `data`
    ///
    /// Fails immediately with `OperationInProgress` if a write is active.
    /// The callback runs once, on the executor, with the bytes accepted so far.
    pub fn async_write<F>(
        &self,
        data: impl Into<Bytes>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.inner
            .begin(WriteMode::All, data.into(), timeout, Box::new(callback))
    }

    /// Blocking write of all of `data`
    ///
    /// Returns `Err` for usage errors only; transport errors and timeouts
    /// come back in the `Completion` with the partial count.
    pub fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<Completion> {
        let data = Bytes::copy_from_slice(data);
        block_on_completion(self.inner.executor(), &self.sync_caller, |done| {
            self.inner.begin(
                WriteMode::All,
                data,
                timeout,
                Box::new(move |completion| done.complete(completion)),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn setup() -> (Arc<LoopbackTransport>, WriteEngine) {
        let transport = LoopbackTransport::new(Executor::default());
        transport.set_echo(false);
        let engine = WriteEngine::new(transport.clone());
        (transport, engine)
    }

    fn unique_temp_path(name: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "oc-stream-{}-{}-{}",
            name,
            std::process::id(),
            ts
        ))
    }

    #[test]
    fn test_write_assembles_partial_chunks() {
        let (transport, engine) = setup();
        transport.set_write_chunk(3);

        let completion = engine.write(b"0123456789", None).unwrap();
        assert!(completion.is_ok());
        assert_eq!(completion.transferred, 10);
        assert_eq!(transport.written(), b"0123456789");
        assert_eq!(engine.generation(), 0);
    }

    #[test]
    fn test_write_some_reports_single_chunk() {
        let (transport, engine) = setup();
        transport.set_write_chunk(4);

        let (tx, rx) = mpsc::channel();
        engine
            .async_write_some(Bytes::from_static(b"abcdefgh"), None, move |c| {
                tx.send(c).unwrap()
            })
            .unwrap();

        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.is_ok());
        assert_eq!(completion.transferred, 4);
        assert_eq!(transport.written(), b"abcd");
    }

    #[test]
    fn test_write_some_times_out_once_on_stalled_peer() {
        let (transport, engine) = setup();
        transport.stall_writes(true);

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let counter = calls.clone();
        engine
            .async_write_some(
                Bytes::from_static(b"held"),
                Some(Duration::from_millis(20)),
                move |c| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.send(c).unwrap();
                },
            )
            .unwrap();

        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.is_timeout());
        assert_eq!(completion.transferred, 0);
        assert!(!engine.is_busy());

        // The abandoned transport write completes later without a callback
        transport.stall_writes(false);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_write_rejected_while_active() {
        let (transport, engine) = setup();
        transport.stall_writes(true);

        let (tx, rx) = mpsc::channel();
        engine
            .async_write(Bytes::from_static(b"first"), None, move |c| tx.send(c).unwrap())
            .unwrap();
        let generation = engine.generation();

        let second = engine.async_write(Bytes::from_static(b"second"), None, |_| {});
        assert!(matches!(second, Err(StreamError::OperationInProgress)));
        assert_eq!(engine.generation(), generation);

        transport.stall_writes(false);
        let completion = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.transferred, 5);
        assert_eq!(transport.written(), b"first");
    }

    #[test]
    fn test_write_timeout_fires_exactly_once() {
        let (transport, engine) = setup();
        transport.stall_writes(true);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (tx, rx) = mpsc::channel();
        engine
            .async_write(
                Bytes::from_static(b"stuck"),
                Some(Duration::from_millis(50)),
                move |c| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.send(c).unwrap();
                },
            )
            .unwrap();

        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(completion.is_timeout());
        assert_eq!(completion.transferred, 0);

        // The stale transport write completes later and is ignored
        transport.stall_writes(false);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.generation(), 0);
    }

    #[test]
    fn test_empty_write_completes_immediately() {
        let (transport, engine) = setup();
        transport.stall_writes(true);
        let completion = engine.write(b"", None).unwrap();
        assert!(completion.is_ok());
        assert_eq!(completion.transferred, 0);
    }

    #[test]
    fn test_write_on_closed_transport_is_cancelled() {
        let (transport, engine) = setup();
        transport.close();
        let completion = engine.write(b"data", None).unwrap();
        assert!(matches!(completion.error, Some(StreamError::Cancelled)));
        assert_eq!(completion.transferred, 0);
    }

    #[test]
    fn test_reset_fails_active_write() {
        let (transport, engine) = setup();
        transport.stall_writes(true);

        let (tx, rx) = mpsc::channel();
        engine
            .async_write(Bytes::from_static(b"data"), None, move |c| tx.send(c).unwrap())
            .unwrap();
        engine.reset().unwrap();

        let completion = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(completion.error, Some(StreamError::Io { .. })));
        assert_eq!(engine.generation(), 0);
    }

    #[test]
    fn test_dump_records_transmitted_bytes() {
        let (transport, engine) = setup();
        transport.set_write_chunk(2);
        let path = unique_temp_path("dump");

        engine.enable_dump(&path, false).unwrap();
        assert!(engine.dump_enabled());
        engine.write(b"hello", None).unwrap();
        engine.disable_dump();
        assert!(!engine.dump_enabled());

        // Not recorded once disabled
        engine.write(b"ignored", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_dump_append_and_truncate() {
        let (_transport, engine) = setup();
        let path = unique_temp_path("dump-append");
        std::fs::write(&path, b"old:").unwrap();

        engine.enable_dump(&path, true).unwrap();
        engine.write(b"new", None).unwrap();
        engine.disable_dump();
        assert_eq!(std::fs::read(&path).unwrap(), b"old:new");

        engine.enable_dump(&path, false).unwrap();
        engine.write(b"fresh", None).unwrap();
        engine.disable_dump();
        assert_eq!(std::fs::read(&path).unwrap(), b"fresh");

        let _ = std::fs::remove_file(&path);
    }
}
