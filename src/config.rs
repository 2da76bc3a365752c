//! Configuration management
//!
//! A stream config is a TOML file naming one transport plus optional
//! executor, I/O and dump settings:
//!
//! ```toml
//! [transport]
//! kind = "serial"
//! device = "/dev/ttyACM0"
//!
//! [transport.params]
//! baud_rate = 921600
//!
//! [io]
//! read_timeout_ms = 500
//! delimiter = "\n"
//! ```

use crate::error::{Result, StreamError};
use crate::executor::ExecutorConfig;
use crate::transport::SerialParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Transport Configuration
// =============================================================================

/// Which transport a stream runs over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Serial device
    Serial {
        device: String,
        #[serde(default)]
        params: SerialParams,
    },
    /// UDP "connection" to one remote peer
    Udp { host: String, port: u16 },
    /// TCP connection to one remote peer
    Tcp { host: String, port: u16 },
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Serial { device, params } => {
                if device.is_empty() {
                    return Err(StreamError::Config {
                        field: "device",
                        reason: "must not be empty".into(),
                    });
                }
                params.validate()
            }
            Self::Udp { host, port } | Self::Tcp { host, port } => {
                if host.is_empty() {
                    return Err(StreamError::Config {
                        field: "host",
                        reason: "must not be empty".into(),
                    });
                }
                if *port == 0 {
                    return Err(StreamError::Config {
                        field: "port",
                        reason: "must be non-zero".into(),
                    });
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// I/O and Dump Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Read timeout in milliseconds (0 = none)
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds (0 = none)
    pub write_timeout_ms: u64,
    /// Delimiter for line reads, a single ASCII character
    pub delimiter: char,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            delimiter: '\n',
        }
    }
}

impl IoConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.write_timeout_ms)
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        delimiter_byte(self.delimiter)
    }
}

/// Write-side dump settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub append: bool,
}

// =============================================================================
// Stream Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub dump: Option<DumpConfig>,
}

impl StreamConfig {
    /// Config with default settings for `transport`
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            executor: ExecutorConfig::default(),
            io: IoConfig::default(),
            dump: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.executor.worker_threads == 0 {
            return Err(StreamError::Config {
                field: "worker_threads",
                reason: "must be at least 1".into(),
            });
        }
        self.io.delimiter_byte().map(|_| ())
    }
}

/// Zero means "no timeout"
pub fn timeout_from_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Delimiters are single bytes; only ASCII characters fit
pub fn delimiter_byte(c: char) -> Result<u8> {
    if c.is_ascii() {
        Ok(c as u8)
    } else {
        Err(StreamError::Config {
            field: "delimiter",
            reason: format!("{:?} is not a single-byte character", c),
        })
    }
}

/// Parse and validate a config from TOML text
pub fn parse(content: &str) -> Result<StreamConfig> {
    let config: StreamConfig = toml::from_str(content).map_err(|e| StreamError::Config {
        field: "config",
        reason: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Load a config file
pub fn load(path: &Path) -> Result<StreamConfig> {
    let content = fs::read_to_string(path).map_err(|source| StreamError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::serial::Parity;

    #[test]
    fn test_parse_serial_config() {
        let config = parse(
            r#"
[transport]
kind = "serial"
device = "/dev/ttyACM0"

[transport.params]
baud_rate = 921600
parity = "odd"
"#,
        )
        .unwrap();

        match config.transport {
            TransportConfig::Serial { device, params } => {
                assert_eq!(device, "/dev/ttyACM0");
                assert_eq!(params.baud_rate, 921600);
                assert_eq!(params.parity, Parity::Odd);
                assert_eq!(params.data_bits, 8);
            }
            other => panic!("Expected serial transport, got {:?}", other),
        }
        // Rest should be defaults
        assert_eq!(config.executor.worker_threads, 1);
        assert_eq!(config.io, IoConfig::default());
        assert!(config.dump.is_none());
    }

    #[test]
    fn test_parse_serial_without_params() {
        let config = parse("[transport]\nkind = \"serial\"\ndevice = \"COM3\"").unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::Serial {
                device: "COM3".to_string(),
                params: SerialParams::default(),
            }
        );
    }

    #[test]
    fn test_parse_tcp_config_with_io_and_dump() {
        let config = parse(
            r#"
[transport]
kind = "tcp"
host = "localhost"
port = 5000

[executor]
worker_threads = 2

[io]
read_timeout_ms = 250
delimiter = "\r"

[dump]
path = "tx.dump"
append = true
"#,
        )
        .unwrap();

        assert_eq!(
            config.transport,
            TransportConfig::Tcp {
                host: "localhost".to_string(),
                port: 5000
            }
        );
        assert_eq!(config.executor.worker_threads, 2);
        assert_eq!(config.io.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.io.write_timeout(), None);
        assert_eq!(config.io.delimiter_byte().unwrap(), b'\r');
        let dump = config.dump.unwrap();
        assert_eq!(dump.path, PathBuf::from("tx.dump"));
        assert!(dump.append);
    }

    #[test]
    fn test_parse_udp_config() {
        let config = parse("[transport]\nkind = \"udp\"\nhost = \"10.0.0.2\"\nport = 9000").unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::Udp {
                host: "10.0.0.2".to_string(),
                port: 9000
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let result = parse("[transport]\nkind = \"carrier-pigeon\"");
        assert!(matches!(result, Err(StreamError::Config { field: "config", .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_port = StreamConfig::new(TransportConfig::Tcp {
            host: "localhost".into(),
            port: 0,
        });
        assert!(matches!(
            zero_port.validate(),
            Err(StreamError::Config { field: "port", .. })
        ));

        let mut no_workers = StreamConfig::new(TransportConfig::Udp {
            host: "localhost".into(),
            port: 9000,
        });
        no_workers.executor.worker_threads = 0;
        assert!(no_workers.validate().is_err());

        let mut wide_delimiter = StreamConfig::new(TransportConfig::Udp {
            host: "localhost".into(),
            port: 9000,
        });
        wide_delimiter.io.delimiter = 'é';
        assert!(matches!(
            wide_delimiter.validate(),
            Err(StreamError::Config { field: "delimiter", .. })
        ));
    }

    #[test]
    fn test_config_serialize_deserialize_roundtrip() {
        let mut config = StreamConfig::new(TransportConfig::Serial {
            device: "/dev/ttyUSB0".into(),
            params: SerialParams::with_baud_rate(57600),
        });
        config.io.read_timeout_ms = 100;
        config.dump = Some(DumpConfig {
            path: PathBuf::from("out.dump"),
            append: false,
        });

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored = parse(&toml_str).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load(Path::new("/nonexistent/oc-stream.toml"));
        assert!(matches!(result, Err(StreamError::ConfigRead { .. })));
    }

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(15), Some(Duration::from_millis(15)));
    }
}
