//! Reader-backed sources: local captures, stdin and in-memory bytes.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use super::{ByteSource, RawChunk};

pub const DEFAULT_CHUNK_SIZE: usize = 1316;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const READ_AHEAD_CHUNKS: usize = 64;

/// Source over any blocking `Read`. End of input is treated as a disconnect.
///
/// Reads run on a helper thread so `next_chunk` can time out while the
/// reader is blocked (stdin, an idle pipe). Closing the source abandons the
/// helper; it exits on its next completed read.
pub struct ReaderSource {
    label: String,
    reader: Option<Box<dyn Read + Send>>,
    chunk_size: usize,
    chunks: Option<Receiver<std::result::Result<RawChunk, String>>>,
}

impl ReaderSource {
    pub fn new(label: impl Into<String>, reader: Box<dyn Read + Send>, chunk_size: usize) -> Self {
        Self {
            label: label.into(),
            reader: Some(reader),
            chunk_size: chunk_size.max(1),
            chunks: None,
        }
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        Ok(Self::new(
            format!("file://{}", path.display()),
            Box::new(file),
            DEFAULT_CHUNK_SIZE,
        ))
    }

    pub fn stdin() -> Self {
        Self::new("stdin", Box::new(std::io::stdin()), DEFAULT_CHUNK_SIZE)
    }
}

impl ByteSource for ReaderSource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn connect(&mut self) -> Result<()> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| anyhow!("{} already consumed", self.label))?;
        let (tx, rx) = bounded(READ_AHEAD_CHUNKS);
        let label = self.label.clone();
        let chunk_size = self.chunk_size;
        std::thread::Builder::new()
            .name("reader-source".into())
            .spawn(move || loop {
                let mut buf = vec![0u8; chunk_size];
                let sent = match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(Err(format!("{} reached end of stream", label)));
                        break;
                    }
                    Ok(read) => {
                        buf.truncate(read);
                        tx.send(Ok(RawChunk::new(buf)))
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let _ = tx.send(Err(format!("read {}: {}", label, err)));
                        break;
                    }
                };
                if sent.is_err() {
                    break;
                }
            })
            .with_context(|| format!("spawn reader thread for {}", self.label))?;
        self.chunks = Some(rx);
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<RawChunk>> {
        let chunks = self
            .chunks
            .as_ref()
            .ok_or_else(|| anyhow!("{} closed", self.label))?;
        match chunks.recv_timeout(READ_TIMEOUT) {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(reason)) => {
                self.chunks = None;
                Err(anyhow!(reason))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.chunks = None;
                Err(anyhow!("{} reader thread exited", self.label))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.chunks.is_some()
    }

    fn close(&mut self) {
        self.chunks = None;
    }
}

/// Replays a byte buffer in fixed-size chunks.
pub struct MemorySource {
    data: Vec<u8>,
    position: usize,
    chunk_size: usize,
    connected: bool,
}

impl MemorySource {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            data,
            position: 0,
            chunk_size: chunk_size.max(1),
            connected: false,
        }
    }
}

impl ByteSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory ({} bytes)", self.data.len())
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<RawChunk>> {
        if !self.connected {
            return Err(anyhow!("memory source not connected"));
        }
        if self.position >= self.data.len() {
            self.connected = false;
            return Err(anyhow!("memory source exhausted"));
        }
        let end = (self.position + self.chunk_size).min(self.data.len());
        let chunk = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(Some(RawChunk::new(chunk)))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        self.connected = false;
    }
}
