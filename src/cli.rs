//! Command-line interface definition using clap
//!
//! Either a transport subcommand or `--config FILE` selects what to open.
//! Flags given on the command line override the matching config values.

use crate::config::{self, DumpConfig, StreamConfig, TransportConfig};
use crate::constants::DEFAULT_BAUD_RATE;
use crate::error::{Result, StreamError};
use crate::transport::SerialParams;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

// =============================================================================
// CLI Definition
// =============================================================================

/// Line-oriented terminal over serial, UDP or TCP
///
/// Lines typed on stdin are written to the stream; every delimiter-terminated
/// message read back is printed on stdout.
#[derive(Parser, Debug, Default)]
#[command(name = "oc-stream")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose debug output
    #[arg(short, long)]
    pub verbose: bool,

    /// Load stream settings from a TOML file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Read timeout in milliseconds (0 = wait forever)
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Message delimiter (single ASCII character)
    #[arg(long, value_name = "CHAR")]
    pub delimiter: Option<char>,

    /// Record every written byte to FILE
    #[arg(long, value_name = "FILE")]
    pub dump: Option<PathBuf>,

    /// Append to the dump file instead of truncating it
    #[arg(long, requires = "dump")]
    pub append: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Transport to open
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a serial device
    Serial {
        /// Device path (e.g. /dev/ttyACM0, COM3)
        device: String,

        /// Baud rate
        #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
    },

    /// Exchange datagrams with one UDP peer
    Udp { host: String, port: u16 },

    /// Connect to a TCP server
    Tcp { host: String, port: u16 },
}

impl Command {
    pub fn transport_config(&self) -> TransportConfig {
        match self {
            Self::Serial { device, baud } => TransportConfig::Serial {
                device: device.clone(),
                params: SerialParams::with_baud_rate(*baud),
            },
            Self::Udp { host, port } => TransportConfig::Udp {
                host: host.clone(),
                port: *port,
            },
            Self::Tcp { host, port } => TransportConfig::Tcp {
                host: host.clone(),
                port: *port,
            },
        }
    }
}

impl Cli {
    /// Build the effective stream config
    ///
    /// The subcommand wins over the config file's transport.
    pub fn stream_config(&self) -> Result<StreamConfig> {
        let mut config = match (&self.config, &self.command) {
            (Some(path), command) => {
                let mut config = config::load(path)?;
                if let Some(command) = command {
                    config.transport = command.transport_config();
                }
                config
            }
            (None, Some(command)) => StreamConfig::new(command.transport_config()),
            (None, None) => {
                return Err(StreamError::Config {
                    field: "transport",
                    reason: "give a subcommand (serial, udp, tcp) or --config FILE".into(),
                })
            }
        };

        if let Some(ms) = self.timeout_ms {
            config.io.read_timeout_ms = ms;
        }
        if let Some(delimiter) = self.delimiter {
            config.io.delimiter = delimiter;
        }
        if let Some(path) = &self.dump {
            config.dump = Some(DumpConfig {
                path: path.clone(),
                append: self.append,
            });
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Tests
// =============================================================================
