//! TCP stream source (caller mode).

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{ByteSource, RawChunk};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const READ_CHUNK_SIZE: usize = 16 * 1024;

pub struct TcpSource {
    addr: String,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
}

impl TcpSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            buffer: vec![0u8; READ_CHUNK_SIZE],
        }
    }
}

impl ByteSource for TcpSource {
    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    fn connect(&mut self) -> Result<()> {
        let target = self
            .addr
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", self.addr))?
            .next()
            .ok_or_else(|| anyhow!("{} resolved to no addresses", self.addr))?;
        let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)
            .with_context(|| format!("connect to {}", self.addr))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("set tcp read timeout")?;
        stream.set_nodelay(true).context("set tcp nodelay")?;
        log::info!("TcpSource: connected to {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<RawChunk>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("tcp source not connected; call connect() first"))?;
        match stream.read(&mut self.buffer) {
            Ok(0) => {
                self.stream = None;
                Err(anyhow!("tcp stream closed by peer"))
            }
            Ok(read) => Ok(Some(RawChunk::new(self.buffer[..read].to_vec()))),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(err) => {
                self.stream = None;
                Err(anyhow!("read tcp stream: {}", err))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
