//! TCP client transport
//!
//! Connects on construction and reconnects on `reset()`. Reads and writes
//! use the two halves of one tokio `TcpStream`, so a pending read never
//! blocks a write.

use super::{resolve, CloseSignal, ReadHandler, Transport, WriteHandler};
use crate::constants::TCP_READ_CHUNK_MAX;
use crate::error::{Result, StreamError};
use crate::executor::Executor;
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Connection attempt timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct TcpLink {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: CloseSignal,
}

impl TcpLink {
    async fn read_some(&self, max: usize) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; max.min(TCP_READ_CHUNK_MAX)];
        match reader.read(&mut buf).await {
            Ok(0) => Err(StreamError::EndOfStream),
            Ok(n) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Err(e) => Err(StreamError::from_io(e)),
        }
    }

    async fn write_some(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        writer.write(data).await.map_err(StreamError::from_io)
    }
}

/// TCP connection to one remote peer
pub struct TcpTransport {
    executor: Executor,
    remote: SocketAddr,
    link: RwLock<Option<Arc<TcpLink>>>,
}

impl TcpTransport {
    /// Resolve `host` and connect to it
    pub fn connect(executor: Executor, host: &str, port: u16) -> Result<Self> {
        let remote = resolve(host, port)?;
        let transport = Self {
            executor,
            remote,
            link: RwLock::new(None),
        };
        transport.open()?;
        Ok(transport)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn open(&self) -> Result<()> {
        let map_err = |source| StreamError::Connect {
            addr: self.remote.to_string(),
            source,
        };

        let std_stream =
            std::net::TcpStream::connect_timeout(&self.remote, CONNECT_TIMEOUT).map_err(map_err)?;
        std_stream.set_nodelay(true).map_err(map_err)?;
        std_stream.set_nonblocking(true).map_err(map_err)?;

        let handle = self.executor.handle()?;
        let _guard = handle.enter();
        let stream = TcpStream::from_std(std_stream).map_err(map_err)?;
        let (reader, writer) = stream.into_split();

        info!("Connected to {}", self.remote);
        *self.link.write() = Some(Arc::new(TcpLink {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed: CloseSignal::new(),
        }));
        Ok(())
    }

    fn link(&self) -> Option<Arc<TcpLink>> {
        self.link.read().clone()
    }
}

impl Transport for TcpTransport {
    fn executor(&self) -> &Executor {
        &self.executor
    }

    fn async_read_some(&self, max_count: usize, on_done: ReadHandler) {
        let Some(link) = self.link() else {
            self.executor
                .submit(move || on_done(Err(StreamError::Cancelled)));
            return;
        };
        self.executor.spawn(async move {
            let result = tokio::select! {
                r = link.read_some(max_count) => r,
                _ = link.closed.closed() => Err(StreamError::Cancelled),
            };
            on_done(result);
        });
    }

    fn async_write_some(&self, data: Bytes, on_done: WriteHandler) {
        let Some(link) = self.link() else {
            self.executor
                .submit(move || on_done(Err(StreamError::Cancelled)));
            return;
        };
        self.executor.spawn(async move {
            let result = tokio::select! {
                r = link.write_some(&data) => r,
                _ = link.closed.closed() => Err(StreamError::Cancelled),
            };
            on_done(result);
        });
    }

    fn flush(&self) -> Result<()> {
        // Nothing is buffered on the client side
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        info!("Reconnecting to {}", self.remote);
        self.close();
        self.open()
    }

    fn is_open(&self) -> bool {
        self.link()
            .map(|link| !link.closed.is_closed())
            .unwrap_or(false)
    }

    fn close(&self) {
        let Some(link) = self.link.write().take() else {
            return;
        };
        info!("Closing connection to {}", self.remote);
        link.closed.close();

        // Send FIN once any in-flight write has released the half
        let remote = self.remote;
        self.executor.spawn(async move {
            let mut writer = link.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                warn!("Error closing connection to {}: {}", remote, e);
            }
        });
    }
}
