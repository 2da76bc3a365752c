//! Transport abstraction for byte-level I/O
//!
//! A transport is one physical channel (Serial, UDP, TCP, in-memory
//! loopback) exposing the minimal capability set the stream engines need:
//! - submit one read of *up to* N bytes
//! - submit one write of *up to* N bytes
//! - flush / reset / close / is_open
//!
//! Completion handlers always run on the transport's [`Executor`].
//! A transport does NOT handle:
//! - Exact-count or delimiter reads (that's the engines' job)
//! - Timeouts (that's the engines' job)
//! - Reconnection policy (callers decide when to `reset()`)
//!
//! # Adding a new transport
//!
//! 1. Create `transport/my_transport.rs`
//! 2. Implement the `Transport` trait
//! 3. Add `pub mod my_transport;` here and a variant to `TransportConfig`

pub mod loopback;
pub mod serial;
pub mod tcp;
pub mod udp;

pub use loopback::LoopbackTransport;
pub use serial::{SerialParams, SerialTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use crate::config::TransportConfig;
use crate::error::{Result, StreamError};
use crate::executor::Executor;
use bytes::{Bytes, BytesMut};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::sync::watch;

/// Handler for one partial read: 1..=max bytes, or an error
pub type ReadHandler = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// Handler for one partial write: bytes accepted, or an error
pub type WriteHandler = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

/// Capability set of one physical channel
///
/// Implementations may deliver fewer bytes than requested (a UDP read
/// yields at most one datagram). Several reads may be outstanding at once
/// when an engine gave up on one after a timeout; they are served in
/// submission order.
///
/// Errors map to `EndOfStream`, `Io` or `Cancelled` (transport closed).
pub trait Transport: Send + Sync + 'static {
    /// Executor this transport runs its I/O and handlers on
    fn executor(&self) -> &Executor;

    /// Read at most `max_count` bytes and hand them to `on_done`
    fn async_read_some(&self, max_count: usize, on_done: ReadHandler);

    /// Write a prefix of `data` and report how many bytes were accepted
    fn async_write_some(&self, data: Bytes, on_done: WriteHandler);

    /// Discard unread input buffered by the OS/driver or the transport
    fn flush(&self) -> Result<()>;

    /// Close and reopen (or reconnect) the underlying channel
    fn reset(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the channel; pending operations complete with `Cancelled`
    fn close(&self);
}

/// Open the transport described by `config` on `executor`
pub fn open(config: &TransportConfig, executor: Executor) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config {
        TransportConfig::Serial { device, params } => {
            Arc::new(SerialTransport::open(executor, device, params.clone())?)
        }
        TransportConfig::Udp { host, port } => Arc::new(UdpTransport::connect(executor, host, *port)?),
        TransportConfig::Tcp { host, port } => Arc::new(TcpTransport::connect(executor, host, *port)?),
    };
    Ok(transport)
}

/// Resolve `host:port` to the first matching socket address
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| StreamError::Resolve {
            host: format!("{}:{}", host, port),
        })
}

/// Bytes a transport received beyond what the current read asked for
///
/// Served first by the next read.
#[derive(Debug, Default)]
pub(crate) struct Surplus {
    buf: BytesMut,
}

impl Surplus {
    /// Take up to `max` surplus bytes
    pub(crate) fn take(&mut self, max: usize) -> Option<Bytes> {
        if self.buf.is_empty() || max == 0 {
            return None;
        }
        let n = max.min(self.buf.len());
        Some(self.buf.split_to(n).freeze())
    }

    /// Return the first `max` bytes of `chunk`, keeping the rest
    pub(crate) fn serve(&mut self, chunk: Bytes, max: usize) -> Bytes {
        if chunk.len() <= max {
            return chunk;
        }
        self.buf.extend_from_slice(&chunk[max..]);
        chunk.slice(..max)
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Close flag that pending I/O futures can wait on
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn close(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close()` has been called (immediately if it already was)
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
