//! Open Control Stream - line terminal over serial, UDP or TCP
//!
//! Usage:
//!   oc-stream serial /dev/ttyACM0 --baud 921600
//!   oc-stream udp 127.0.0.1 9000
//!   oc-stream tcp localhost 5000 --timeout-ms 500
//!   oc-stream --config stream.toml

use clap::Parser;
use oc_stream::cli::Cli;
use oc_stream::logging::init_tracing;
use oc_stream::{Stream, StreamConfig, StreamError};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

/// Largest message printed in one piece
const MAX_MESSAGE_SIZE: usize = 4096;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match cli.stream_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &StreamConfig) -> oc_stream::Result<()> {
    let delimiter = config.io.delimiter_byte()?;
    let read_timeout = config.io.read_timeout();
    let write_timeout = config.io.write_timeout();

    let stream = Arc::new(Stream::from_config(config)?);
    tracing::info!("Stream open: {:?}", config.transport);

    // stdin -> stream
    let writer = stream.clone();
    thread::Builder::new()
        .name("oc-stream-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(mut line) = line else { break };
                line.push(delimiter as char);
                match writer.write(line.as_bytes(), write_timeout) {
                    Ok(completion) => {
                        if let Err(e) = completion.into_result() {
                            tracing::warn!("Write failed: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Write rejected: {}", e);
                        break;
                    }
                }
            }
            // EOF on stdin ends the session
            writer.close();
        })
        .map_err(|source| StreamError::Io { source })?;

    // stream -> stdout
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let stdout = io::stdout();
    loop {
        let completion = stream.read_until(MAX_MESSAGE_SIZE, &mut buf, delimiter, read_timeout)?;
        match completion.error {
            None => {
                let mut out = stdout.lock();
                let _ = out.write_all(&buf[..completion.transferred]);
                if buf[..completion.transferred].last() != Some(&b'\n') {
                    let _ = out.write_all(b"\n");
                }
                let _ = out.flush();
            }
            Some(StreamError::TimedOut) => {
                if completion.transferred > 0 {
                    tracing::debug!("Partial message dropped ({} bytes)", completion.transferred);
                }
            }
            Some(StreamError::EndOfStream) | Some(StreamError::Cancelled) => {
                tracing::info!("Stream closed");
                return Ok(());
            }
            Some(e) => return Err(e),
        }
    }
}
