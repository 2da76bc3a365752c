//! Serial transport
//!
//! Uses a blocking reader thread for low-latency input:
//! - Reader thread: polls the serial port, sends chunks to a channel
//! - Reads: pull chunks from the channel on the executor
//! - Writes: run on the executor's blocking pool
//!
//! The reader thread stops when:
//! - the transport is closed or reset
//! - the serial port disconnects (detected via consecutive zero-byte reads)
//! - a read error occurs

use super::{CloseSignal, ReadHandler, Surplus, Transport, WriteHandler};
use crate::constants::{
    CHANNEL_CAPACITY, DEFAULT_BAUD_RATE, SERIAL_BUFFER_SIZE, SERIAL_DISCONNECT_THRESHOLD,
    SERIAL_POLL_TIMEOUT_MS,
};
use crate::error::{Result, StreamError};
use crate::executor::Executor;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialParams {
    pub baud_rate: u32,
    /// Character size, 5 to 8 bits
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialParams {
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    fn data_bits(&self) -> Result<serialport::DataBits> {
        match self.data_bits {
            5 => Ok(serialport::DataBits::Five),
            6 => Ok(serialport::DataBits::Six),
            7 => Ok(serialport::DataBits::Seven),
            8 => Ok(serialport::DataBits::Eight),
            n => Err(StreamError::Config {
                field: "data_bits",
                reason: format!("{} is not in 5..=8", n),
            }),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(StreamError::Config {
                field: "baud_rate",
                reason: "must be non-zero".into(),
            });
        }
        self.data_bits().map(|_| ())
    }
}

impl From<Parity> for serialport::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(s: StopBits) -> Self {
        match s {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(f: FlowControl) -> Self {
        match f {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Chunks produced by the reader thread plus the surplus of the last one
struct ChunkQueue {
    rx: mpsc::Receiver<Result<Bytes>>,
    surplus: Surplus,
}

/// One open session on the device; replaced on reset
struct SerialLink {
    port: Mutex<Box<dyn SerialPort>>,
    inbound: tokio::sync::Mutex<ChunkQueue>,
    closed: Arc<CloseSignal>,
}

impl SerialLink {
    async fn read_some(&self, max: usize) -> Result<Bytes> {
        let mut inbound = self.inbound.lock().await;
        let ChunkQueue { rx, surplus } = &mut *inbound;

        if let Some(chunk) = surplus.take(max) {
            return Ok(chunk);
        }

        match rx.recv().await {
            Some(Ok(chunk)) => Ok(surplus.serve(chunk, max)),
            Some(Err(e)) => Err(e),
            None if self.closed.is_closed() => Err(StreamError::Cancelled),
            None => Err(StreamError::EndOfStream),
        }
    }

    fn write_some(&self, data: &[u8]) -> Result<usize> {
        write_retrying(&self.port, &self.closed, data)
    }

    /// Drop unread input: OS buffer, queued chunks and surplus
    fn discard_input(&self) -> Result<()> {
        self.port
            .lock()
            .clear(ClearBuffer::Input)
            .map_err(|e| StreamError::Io {
                source: std::io::Error::other(e.to_string()),
            })?;

        // A pending read holds the queue, which means it is empty
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.surplus.clear();
            while inbound.rx.try_recv().is_ok() {}
        }
        Ok(())
    }
}

/// Serial transport
///
/// # Example
///
/// ```ignore
/// let executor = Executor::default();
/// let transport = SerialTransport::open(executor, "/dev/ttyACM0", SerialParams::default())?;
/// let stream = Stream::new(Arc::new(transport));
/// ```
pub struct SerialTransport {
    executor: Executor,
    device: String,
    params: SerialParams,
    link: RwLock<Option<Arc<SerialLink>>>,
}

impl SerialTransport {
    /// Open `device` with the given line settings
    pub fn open(executor: Executor, device: &str, params: SerialParams) -> Result<Self> {
        params.validate()?;
        let transport = Self {
            executor,
            device: device.to_string(),
            params,
            link: RwLock::new(None),
        };
        transport.connect()?;
        Ok(transport)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn params(&self) -> &SerialParams {
        &self.params
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        let map_err = |e: serialport::Error| StreamError::SerialOpen {
            port: self.device.clone(),
            source: std::io::Error::other(e.to_string()),
        };

        serialport::new(&self.device, self.params.baud_rate)
            .data_bits(self.params.data_bits()?)
            .parity(self.params.parity.into())
            .stop_bits(self.params.stop_bits.into())
            .flow_control(self.params.flow_control.into())
            .timeout(Duration::from_millis(SERIAL_POLL_TIMEOUT_MS))
            .open()
            .map_err(map_err)
    }

    fn connect(&self) -> Result<()> {
        let port = self.open_port()?;
        let port_read = port.try_clone().map_err(|e| StreamError::SerialOpen {
            port: self.device.clone(),
            source: std::io::Error::other(e.to_string()),
        })?;

        let (in_tx, in_rx) = mpsc::channel::<Result<Bytes>>(CHANNEL_CAPACITY);
        let closed = Arc::new(CloseSignal::new());

        let closed_reader = closed.clone();
        let device = self.device.clone();
        std::thread::Builder::new()
            .name("oc-stream-serial-rx".to_string())
            .spawn(move || run_reader(port_read, in_tx, closed_reader, device))
            .map_err(|source| StreamError::SerialOpen {
                port: self.device.clone(),
                source,
            })?;

        info!(
            "Opened serial port {} @ {} baud",
            self.device, self.params.baud_rate
        );
        *self.link.write() = Some(Arc::new(SerialLink {
            port: Mutex::new(port),
            inbound: tokio::sync::Mutex::new(ChunkQueue {
                rx: in_rx,
                surplus: Surplus::default(),
            }),
            closed,
        }));
        Ok(())
    }

    fn link(&self) -> Option<Arc<SerialLink>> {
        self.link.read().clone()
    }
}

/// Write `data` until the port accepts some of it or the link closes
///
/// The port lock is taken per attempt, so a write held back by flow control
/// does not keep `flush` and friends off the port.
fn write_retrying<W: Write + ?Sized>(
    port: &Mutex<Box<W>>,
    closed: &CloseSignal,
    data: &[u8],
) -> Result<usize> {
    loop {
        let result = port.lock().write(data);
        match result {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Nothing accepted within the poll timeout
                if closed.is_closed() {
                    return Err(StreamError::Cancelled);
                }
            }
            Err(e) => return Err(StreamError::from_io(e)),
        }
    }
}

/// Reader thread body: forward port input to the channel until stopped
fn run_reader(
    mut port: Box<dyn SerialPort>,
    in_tx: mpsc::Sender<Result<Bytes>>,
    closed: Arc<CloseSignal>,
    device: String,
) {
    let mut buf = [0u8; SERIAL_BUFFER_SIZE];
    let mut consecutive_errors = 0u32;

    while !closed.is_closed() {
        match port.read(&mut buf) {
            Ok(n) if n > 0 => {
                consecutive_errors = 0;
                if in_tx
                    .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    // Receiver dropped
                    break;
                }
            }
            Ok(_) => {
                // Zero bytes read - could be normal or port gone
                consecutive_errors += 1;
                if consecutive_errors > SERIAL_DISCONNECT_THRESHOLD {
                    warn!("Serial port {} disconnected", device);
                    let _ = in_tx.blocking_send(Err(StreamError::EndOfStream));
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                consecutive_errors = 0;
            }
            Err(e) => {
                if !closed.is_closed() {
                    warn!("Serial port {} read error: {}", device, e);
                    let _ = in_tx.blocking_send(Err(StreamError::from_io(e)));
                }
                break;
            }
        }
    }
    debug!("Serial reader for {} stopped", device);
    // Channel closes when in_tx is dropped
}

impl Transport for SerialTransport {
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
        self.executor.spawn_blocking(move || {
            let result = link.write_some(&data);
            on_done(result);
        });
    }

    fn flush(&self) -> Result<()> {
        match self.link() {
            Some(link) => link.discard_input(),
            None => Ok(()),
        }
    }

    fn reset(&self) -> Result<()> {
        info!("Resetting serial port {}", self.device);
        self.close();
        self.connect()
    }

    fn is_open(&self) -> bool {
        self.link()
            .map(|link| !link.closed.is_closed())
            .unwrap_or(false)
    }

    fn close(&self) {
        if let Some(link) = self.link.write().take() {
            info!("Closing serial port {}", self.device);
            link.closed.close();
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
