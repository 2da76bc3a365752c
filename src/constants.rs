//! Crate-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Executor
// =============================================================================

/// Default number of executor worker threads (single logical run-loop)
pub const DEFAULT_WORKER_THREADS: usize = 1;

/// Name given to executor worker threads
pub const WORKER_THREAD_NAME: &str = "oc-stream-worker";

// =============================================================================
// Serial
// =============================================================================

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Poll timeout of the serial reader thread (milliseconds)
pub const SERIAL_POLL_TIMEOUT_MS: u64 = 10;

/// Consecutive zero-byte reads before assuming port disconnected
pub const SERIAL_DISCONNECT_THRESHOLD: u32 = 10;

/// Serial reader thread buffer size
pub const SERIAL_BUFFER_SIZE: usize = 4096;

// =============================================================================
// Network
// =============================================================================

/// Largest UDP payload a single read can return
pub const UDP_DATAGRAM_MAX: usize = 65_536;

/// Largest chunk a single TCP read allocates for
pub const TCP_READ_CHUNK_MAX: usize = 65_536;

// =============================================================================
// Buffers
// =============================================================================

/// Channel capacity for inbound chunks
pub const CHANNEL_CAPACITY: usize = 256;

/// Initial capacity of the read carry-over buffer
pub const CARRY_OVER_CAPACITY: usize = 1024;

// =============================================================================
// Diagnostics
// =============================================================================

/// Default file name for the write-side dump
pub const DEFAULT_DUMP_FILE: &str = "oc_stream_tx.dump";
