//! In-memory transports for simulated meters
//!
//! [`MemoryTransport::pair`] gives a full-duplex point to point link, the
//! way an optical port or a direct serial cable behaves. [`SharedLine`]
//! models a half-duplex current loop where every station hears every byte,
//! its own included.

use crate::stream::{StreamAccessor, TransportKind, TransportLayer};
use async_trait::async_trait;
use c12_core::{C12Error, C12Result};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// One end of an in-memory point to point link
#[derive(Debug)]
pub struct MemoryTransport {
    stream: DuplexStream,
    closed: bool,
}

impl MemoryTransport {
    /// Two connected ends; bytes written to one are read from the other
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a, b) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        (
            MemoryTransport {
                stream: a,
                closed: false,
            },
            MemoryTransport {
                stream: b,
                closed: false,
            },
        )
    }
}

#[async_trait]
impl TransportLayer for MemoryTransport {
    async fn open(&mut self) -> C12Result<()> {
        self.closed = false;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }
}

#[async_trait]
impl StreamAccessor for MemoryTransport {
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
        let n = self.stream.read(buf).await?;
        if n == 0 {
            self.closed = true;
        }
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> C12Result<usize> {
        Ok(self.stream.write(buf).await?)
    }

    async fn flush(&mut self) -> C12Result<()> {
        Ok(self.stream.flush().await?)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> C12Result<()> {
        let _ = self.stream.shutdown().await;
        self.closed = true;
        Ok(())
    }
}

type Bus = Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>>;

/// A simulated shared current loop
#[derive(Debug, Clone, Default)]
pub struct SharedLine {
    bus: Bus,
}

impl SharedLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new station to the line
    pub fn station(&self) -> LineStation {
        let (sender, inbox) = mpsc::unbounded_channel();
        if let Ok(mut bus) = self.bus.lock() {
            bus.push(sender);
        }
        LineStation {
            bus: self.bus.clone(),
            inbox,
            pending: Vec::new(),
            closed: false,
        }
    }
}

/// A station attached to a [`SharedLine`]
///
/// Every write is delivered to all stations in the order it was made, so
/// two stations writing before either reads see each other's bytes mixed
/// into their echo.
#[derive(Debug)]
pub struct LineStation {
    bus: Bus,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl TransportLayer for LineStation {
    async fn open(&mut self) -> C12Result<()> {
        self.closed = false;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::CurrentLoop
    }

    fn echoes_written_bytes(&self) -> bool {
        true
    }
}

#[async_trait]
impl StreamAccessor for LineStation {
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
        if self.pending.is_empty() {
            match self.inbox.recv().await {
                Some(chunk) => self.pending = chunk,
                None => {
                    self.closed = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> C12Result<usize> {
        let bus = self
            .bus
            .lock()
            .map_err(|_| C12Error::InvalidState("Shared line poisoned".to_string()))?;
        for station in bus.iter() {
            let _ = station.send(buf.to_vec());
        }
        Ok(buf.len())
    }

    async fn flush(&mut self) -> C12Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> C12Result<()> {
        self.inbox.close();
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_bytes_both_ways() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.write_all(&[0xEE, 0x00]).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).await.unwrap(), 2);
        b.write_all(&[0x06]).await.unwrap();
        assert_eq!(a.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 0x06);
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_zero() {
        let (mut a, b) = MemoryTransport::pair();
        drop(b);
        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_shared_line_echo_and_broadcast() {
        let line = SharedLine::new();
        let mut first = line.station();
        let mut second = line.station();

        first.write_all(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(first.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(second.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }
}
