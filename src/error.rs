//! Centralized error types for streams
//!
//! All stream errors are represented by the `StreamError` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, StreamError>`.
//!
//! Errors fall in three groups:
//! - outcomes delivered with a `Completion` (end of stream, I/O, timeout, cancel)
//! - usage errors returned at call time (operation in progress, ...)
//! - setup errors returned while opening a transport or loading config

use std::fmt;
use std::io;
use std::path::PathBuf;

/// All stream errors
#[derive(Debug)]
pub enum StreamError {
    // === Outcomes ===
    /// The remote end closed the stream
    EndOfStream,
    /// Transport-level I/O failure
    Io { source: io::Error },
    /// The operation timeout elapsed before completion
    TimedOut,
    /// The transport was closed while the operation was pending
    Cancelled,

    // === Usage ===
    /// Another operation of the same kind is still active on this engine
    OperationInProgress,
    /// The caller buffer cannot hold the requested byte count
    BufferTooSmall { needed: usize, len: usize },
    /// A blocking call was made from an executor thread
    BlockingInExecutor,

    // === Setup ===
    /// Failed to open serial port
    SerialOpen { port: String, source: io::Error },
    /// Failed to connect a TCP socket
    Connect { addr: String, source: io::Error },
    /// Failed to bind or connect a UDP socket
    UdpBind { addr: String, source: io::Error },
    /// Host name did not resolve to any address
    Resolve { host: String },
    /// Tokio runtime creation failed
    Runtime { source: io::Error },
    /// Invalid config value
    Config { field: &'static str, reason: String },
    /// Failed to read a config file
    ConfigRead { path: PathBuf, source: io::Error },
    /// Failed to open the write dump file
    DumpOpen { path: PathBuf, source: io::Error },
}

impl StreamError {
    /// Wrap a transport I/O error, mapping EOF-like kinds to `EndOfStream`
    pub fn from_io(source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            _ => Self::Io { source },
        }
    }

    /// Build an `Io` error from a kind and message
    pub fn io(kind: io::ErrorKind, message: &str) -> Self {
        Self::Io {
            source: io::Error::new(kind, message.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// True for errors returned synchronously because of caller misuse
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::OperationInProgress | Self::BufferTooSmall { .. } | Self::BlockingInExecutor
        )
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source }
            | Self::SerialOpen { source, .. }
            | Self::Connect { source, .. }
            | Self::UdpBind { source, .. }
            | Self::Runtime { source }
            | Self::ConfigRead { source, .. }
            | Self::DumpOpen { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "End of stream"),
            Self::Io { source } => write!(f, "I/O error: {}", source),
            Self::TimedOut => write!(f, "Operation timed out"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::OperationInProgress => {
                write!(f, "Another operation is in progress on this stream")
            }
            Self::BufferTooSmall { needed, len } => {
                write!(f, "Buffer too small: {} bytes requested, {} available", needed, len)
            }
            Self::BlockingInExecutor => {
                write!(f, "Blocking stream call made from an executor thread")
            }
            Self::SerialOpen { port, .. } => write!(f, "Cannot open serial port: {}", port),
            Self::Connect { addr, .. } => write!(f, "Cannot connect to {}", addr),
            Self::UdpBind { addr, .. } => write!(f, "Cannot open UDP socket to {}", addr),
            Self::Resolve { host } => write!(f, "Cannot resolve host: {}", host),
            Self::Runtime { .. } => write!(f, "Failed to create runtime"),
            Self::Config { field, reason } => write!(f, "Invalid {}: {}", field, reason),
            Self::ConfigRead { path, .. } => write!(f, "Cannot read config: {}", path.display()),
            Self::DumpOpen { path, .. } => {
                write!(f, "Cannot open dump file: {}", path.display())
            }
        }
    }
}

/// Alias for Result with StreamError
pub type Result<T> = std::result::Result<T, StreamError>;

/// Outcome of a stream operation, delivered exactly once per accepted operation
///
/// `transferred` always holds the bytes completed so far, including when
/// `error` is set (partial transfer before a timeout or I/O failure).
#[derive(Debug)]
pub struct Completion {
    pub error: Option<StreamError>,
    pub transferred: usize,
}

impl Completion {
    pub fn ok(transferred: usize) -> Self {
        Self {
            error: None,
            transferred,
        }
    }

    pub fn failed(error: StreamError, transferred: usize) -> Self {
        Self {
            error: Some(error),
            transferred,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_ref().map(StreamError::is_timeout).unwrap_or(false)
    }

    /// Convert into a plain result, dropping the partial count on error
    pub fn into_result(self) -> Result<usize> {
        match self.error {
            None => Ok(self.transferred),
            Some(e) => Err(e),
        }
    }
}
