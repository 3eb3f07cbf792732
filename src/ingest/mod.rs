//! Byte ingestion.
//!
//! This module provides the transport side of the pipeline:
//! - UDP datagram streams (fixed-size payload units, typically 1316 bytes)
//! - TCP caller-mode streams
//! - Any `Read` (local MJPEG captures, stdin)
//! - In-memory bytes (testing)
//!
//! Every transport is a thin `ByteSource` adapter. Framing is transport-agnostic
//! and lives in `mjpeg`: the same `FrameExtractor` runs behind every source.
//!
//! A source is responsible for:
//! - Delivering received bytes with their arrival instant
//! - Reporting "no data yet" without blocking past its read timeout
//! - Surfacing a dropped connection as an error from `next_chunk`

use anyhow::{anyhow, Context, Result};
use std::time::Instant;
use url::Url;

pub mod mjpeg;
pub mod reader;
pub mod tcp;
pub mod udp;

pub use mjpeg::{ExtractedFrame, FrameExtractor, FramerConfig};
pub use reader::{MemorySource, ReaderSource};
pub use tcp::TcpSource;
pub use udp::UdpSource;

/// Bytes received from a transport, stamped on arrival.
#[derive(Clone, Debug)]
pub struct RawChunk {
    pub data: Vec<u8>,
    pub received_at: Instant,
}

impl RawChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            received_at: Instant::now(),
        }
    }
}

/// A transport delivering an MJPEG byte stream.
pub trait ByteSource: Send {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Open the underlying transport.
    fn connect(&mut self) -> Result<()>;

    /// Receive the next chunk.
    ///
    /// Returns `Ok(None)` when the read timed out without data; callers use that
    /// window to observe their stop signal. An `Err` means the connection is gone.
    fn next_chunk(&mut self) -> Result<Option<RawChunk>>;

    /// Whether the transport is still usable.
    fn is_connected(&self) -> bool;

    /// Close the transport. Further `next_chunk` calls fail.
    fn close(&mut self) {}
}

/// Open a byte source from a location string.
///
/// Supported forms: `udp://host:port` (bind), `tcp://host:port` (connect),
/// `file:///path` or a bare path, and `-` for stdin.
pub fn open_source(location: &str) -> Result<Box<dyn ByteSource>> {
    if location == "-" {
        return Ok(Box::new(ReaderSource::stdin()));
    }
    if !location.contains("://") {
        return Ok(Box::new(ReaderSource::open_file(location)?));
    }

    let url = Url::parse(location).with_context(|| format!("parse source url {}", location))?;
    match url.scheme() {
        "udp" => Ok(Box::new(UdpSource::new(host_port(&url)?))),
        "tcp" => Ok(Box::new(TcpSource::new(host_port(&url)?))),
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("invalid file url {}", location))?;
            Ok(Box::new(ReaderSource::open_file(path)?))
        }
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected udp, tcp or file",
            other
        )),
    }
}

fn host_port(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("{} url missing host", url.scheme()))?;
    let port = url
        .port()
        .ok_or_else(|| anyhow!("{} url missing port", url.scheme()))?;
    Ok(format!("{}:{}", host, port))
}
