//! UDP datagram source.
//!
//! Encoders such as OBS push MJPEG as back-to-back datagrams with no framing
//! beyond the JPEG markers themselves. Each datagram becomes one `RawChunk`.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::Duration;

use super::{ByteSource, RawChunk};

/// Typical payload size of one transport unit (7 × 188-byte TS packets).
pub const DATAGRAM_PAYLOAD_SIZE: usize = 1316;

const RECV_BUFFER_SIZE: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_millis(200);

pub struct UdpSource {
    bind_addr: String,
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
    datagrams: u64,
}

impl UdpSource {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            socket: None,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
            datagrams: 0,
        }
    }

    /// Local address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn datagrams_received(&self) -> u64 {
        self.datagrams
    }
}

impl ByteSource for UdpSource {
    fn describe(&self) -> String {
        format!("udp://{}", self.bind_addr)
    }

    fn connect(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.bind_addr)
            .with_context(|| format!("bind udp socket on {}", self.bind_addr))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("set udp read timeout")?;
        log::info!("UdpSource: listening on {}", self.bind_addr);
        self.socket = Some(socket);
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<RawChunk>> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| anyhow!("udp source not connected; call connect() first"))?;
        match socket.recv_from(&mut self.buffer) {
            Ok((0, _)) => Ok(None),
            Ok((len, _)) => {
                self.datagrams += 1;
                Ok(Some(RawChunk::new(self.buffer[..len].to_vec())))
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(err) => Err(anyhow!("recv udp datagram: {}", err)),
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) {
        self.socket = None;
    }
}
