//! Open Control Stream - transport-agnostic duplex byte streams
//!
//! A [`Stream`] pairs a read engine and a write engine over one
//! [`Transport`] (serial port, UDP, TCP or in-memory loopback) and offers
//! the same contract on all of them:
//! - exact-count reads and writes, assembled from partial transfers
//! - delimiter-terminated reads with carry-over of surplus bytes
//! - optional timeouts, with exactly one completion per operation
//! - asynchronous forms (callback on the executor) and blocking forms

pub mod cli;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod stream;
pub mod transport;

pub use config::{StreamConfig, TransportConfig};
pub use engine::{ReadEngine, WriteEngine};
pub use error::{Completion, Result, StreamError};
pub use executor::{Executor, ExecutorConfig, TimerHandle};
pub use stream::Stream;
pub use transport::{
    LoopbackTransport, SerialParams, SerialTransport, TcpTransport, Transport, UdpTransport,
};
