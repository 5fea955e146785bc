//! Current loop transport
//!
//! A current loop converter is a serial port on a shared half-duplex line:
//! every byte written comes back on the receive wire. The channel reads the
//! echo back and compares it, a mismatch means another station was
//! transmitting at the same time.

use crate::serial::{SerialSettings, SerialTransport};
use crate::stream::{StreamAccessor, TransportKind, TransportLayer};
use async_trait::async_trait;
use c12_core::C12Result;

#[derive(Debug)]
pub struct CurrentLoopTransport<T: TransportLayer = SerialTransport> {
    inner: T,
}

impl CurrentLoopTransport<SerialTransport> {
    pub fn new(settings: SerialSettings) -> Self {
        Self::with_transport(SerialTransport::new(settings))
    }
}

impl<T: TransportLayer> CurrentLoopTransport<T> {
    pub fn with_transport(inner: T) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: TransportLayer> TransportLayer for CurrentLoopTransport<T> {
    async fn open(&mut self) -> C12Result<()> {
        self.inner.open().await
    }

    fn kind(&self) -> TransportKind {
        TransportKind::CurrentLoop
    }

    fn echoes_written_bytes(&self) -> bool {
        true
    }

    async fn set_baud_rate(&mut self, baud: u32) -> C12Result<()> {
        self.inner.set_baud_rate(baud).await
    }

    fn baud_rate(&self) -> Option<u32> {
        self.inner.baud_rate()
    }
}

#[async_trait]
impl<T: TransportLayer> StreamAccessor for CurrentLoopTransport<T> {
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
        self.inner.read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> C12Result<usize> {
        self.inner.write(buf).await
    }

    async fn flush(&mut self) -> C12Result<()> {
        self.inner.flush().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&mut self) -> C12Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;

    #[tokio::test]
    async fn test_reports_echo_and_forwards_io() {
        let (port, mut peer) = MemoryTransport::pair();
        let mut transport = CurrentLoopTransport::with_transport(port);
        assert!(transport.echoes_written_bytes());
        assert_eq!(transport.kind(), TransportKind::CurrentLoop);

        transport.write_all(&[0xEE]).await.unwrap();
        let mut buf = [0u8; 1];
        peer.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0xEE);
    }
}
