//! Stream: one read engine and one write engine over one transport
//!
//! Every operation delegates to the matching engine. `flush` and `reset`
//! go through the read engine, which forwards them to the transport;
//! `reset` also fails any active write first.

use crate::config::StreamConfig;
use crate::engine::{ReadEngine, WriteEngine};
use crate::error::{Completion, Result};
use crate::executor::{Executor, ExecutorConfig};
use crate::transport::{self, SerialParams, SerialTransport, TcpTransport, Transport, UdpTransport};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Duplex byte stream over any transport
///
/// # Example
///
/// ```ignore
/// let stream = Stream::tcp("127.0.0.1", 5000)?;
/// stream.write(b"ping\n", None)?;
///
/// let mut buf = vec![0; 64];
/// let completion = stream.read_until(64, &mut buf, b'\n', Some(Duration::from_secs(1)))?;
/// println!("{:?}", &buf[..completion.transferred]);
/// ```
pub struct Stream {
    reader: ReadEngine,
    writer: WriteEngine,
}

impl Stream {
    /// Wrap an already opened transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            reader: ReadEngine::new(transport.clone()),
            writer: WriteEngine::new(transport),
        }
    }

    /// Open a serial device on a fresh executor
    pub fn serial(device: &str, params: SerialParams) -> Result<Self> {
        let transport = SerialTransport::open(Executor::default(), device, params)?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Open a UDP "connection" to `host:port` on a fresh executor
    pub fn udp(host: &str, port: u16) -> Result<Self> {
        let transport = UdpTransport::connect(Executor::default(), host, port)?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Connect to `host:port` over TCP on a fresh executor
    pub fn tcp(host: &str, port: u16) -> Result<Self> {
        let transport = TcpTransport::connect(Executor::default(), host, port)?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Open the transport named by `config`, enabling the write dump if set
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        let executor = Executor::new(ExecutorConfig {
            worker_threads: config.executor.worker_threads,
        });
        let stream = Self::new(transport::open(&config.transport, executor)?);
        if let Some(dump) = &config.dump {
            stream.enable_dump(&dump.path, dump.append)?;
        }
        Ok(stream)
    }

    pub fn reader(&self) -> &ReadEngine {
        &self.reader
    }

    pub fn writer(&self) -> &WriteEngine {
        &self.writer
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.reader.transport()
    }

    pub fn executor(&self) -> &Executor {
        self.transport().executor()
    }

    pub fn is_open(&self) -> bool {
        self.transport().is_open()
    }

    /// Close the transport; pending operations complete with `Cancelled`
    pub fn close(&self) {
        self.transport().close();
    }

    pub fn flush(&self) -> Result<()> {
        self.reader.flush()
    }

    /// Fail active operations with a connection-reset error, then reopen
    /// the transport
    pub fn reset(&self) -> Result<()> {
        self.writer.abort();
        self.reader.reset()
    }

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
        self.reader.async_read_some(count, buf, timeout, callback)
    }

    pub fn async_write_some<F>(
        &self,
        data: impl Into<Bytes>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.writer.async_write_some(data, timeout, callback)
    }

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
        self.reader.async_read(count, buf, timeout, callback)
    }

    pub fn async_write<F>(
        &self,
        data: impl Into<Bytes>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.writer.async_write(data, timeout, callback)
    }

    pub fn read(
        &self,
        count: usize,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        self.reader.read(count, buf, timeout)
    }

    pub fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<Completion> {
        self.writer.write(data, timeout)
    }

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
        self.reader
            .async_read_until(max_size, buf, delimiter, timeout, callback)
    }

    pub fn read_until(
        &self,
        max_size: usize,
        buf: &mut Vec<u8>,
        delimiter: u8,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        self.reader.read_until(max_size, buf, delimiter, timeout)
    }

    pub fn enable_dump(&self, path: impl AsRef<Path>, append: bool) -> Result<()> {
        self.writer.enable_dump(path, append)
    }

    pub fn disable_dump(&self) {
        self.writer.disable_dump()
    }

    pub fn dump_enabled(&self) -> bool {
        self.writer.dump_enabled()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.writer.disable_dump();
        self.transport().close();
        self.executor().stop();
    }
}
