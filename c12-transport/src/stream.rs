//! Stream accessor trait for the transport layer

use async_trait::async_trait;
use c12_core::{C12Error, C12Result};
use std::fmt;

/// Kind of physical medium behind a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Modem,
    CurrentLoop,
    Tcp,
    Udp,
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Serial => "serial",
            TransportKind::Modem => "modem",
            TransportKind::CurrentLoop => "current loop",
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Stream accessor interface to access a physical stream to a remote meter
///
/// Implementations do not apply timeouts of their own, the [`Channel`]
/// wraps every call with the deadline supplied by the protocol engine.
/// `read` must therefore be cancel safe.
///
/// [`Channel`]: crate::channel::Channel
#[async_trait]
pub trait StreamAccessor: Send {
    /// Read data from the stream
    ///
    /// Waits until at least one byte is available.
    ///
    /// # Returns
    ///
    /// Number of bytes read, or 0 if the peer closed the stream
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize>;

    /// Write data to the stream
    ///
    /// # Returns
    ///
    /// Number of bytes written
    async fn write(&mut self, buf: &[u8]) -> C12Result<usize>;

    /// Write all data to the stream
    async fn write_all(&mut self, buf: &[u8]) -> C12Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..]).await?;
            if n == 0 {
                return Err(C12Error::ChannelDisconnectedUnexpectedly);
            }
            written += n;
        }
        Ok(())
    }

    /// Flush any buffered data
    async fn flush(&mut self) -> C12Result<()>;

    /// Check if the stream is closed
    fn is_closed(&self) -> bool;

    /// Close the stream
    async fn close(&mut self) -> C12Result<()>;
}

/// Transport layer trait that extends StreamAccessor
#[async_trait]
pub trait TransportLayer: StreamAccessor {
    /// Open the physical layer connection
    async fn open(&mut self) -> C12Result<()>;

    fn kind(&self) -> TransportKind;

    /// Whether every written byte comes back on the receive line
    fn echoes_written_bytes(&self) -> bool {
        false
    }

    /// Change the line speed after a negotiate, if the medium has one
    async fn set_baud_rate(&mut self, _baud: u32) -> C12Result<()> {
        Ok(())
    }

    /// Current line speed, `None` where the medium has no baud rate
    fn baud_rate(&self) -> Option<u32> {
        None
    }
}

pub(crate) fn not_connected(what: &str) -> C12Error {
    C12Error::Connection(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("{} not connected", what),
    ))
}

pub(crate) fn already_open() -> C12Error {
    C12Error::Connection(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "Connection has already been opened",
    ))
}
