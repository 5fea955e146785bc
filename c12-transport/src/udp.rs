//! UDP transport implementation

use crate::stream::{StreamAccessor, TransportKind, TransportLayer, already_open, not_connected};
use async_trait::async_trait;
use c12_core::{C12Error, C12Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Maximum UDP payload size
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65507;

/// UDP transport layer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpSettings {
    /// `host:port` of the meter
    pub remote_address: String,
    /// Local address to bind, any port when not given
    pub local_address: Option<String>,
}

impl UdpSettings {
    /// Create new UDP settings
    pub fn new(remote_address: impl Into<String>) -> Self {
        Self {
            remote_address: remote_address.into(),
            local_address: None,
        }
    }

    pub fn with_local_address(mut self, local_address: impl Into<String>) -> Self {
        self.local_address = Some(local_address.into());
        self
    }
}

/// UDP transport layer implementation
///
/// Opening binds a local socket and resolves the peer, nothing is sent, so
/// it does not fail because the meter is unreachable. Datagrams from other
/// peers are dropped. A datagram is served to readers in pieces until it
/// is exhausted.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    remote: Option<SocketAddr>,
    settings: UdpSettings,
    closed: bool,
    read_buffer: Vec<u8>,
    read_position: usize,
}

impl UdpTransport {
    /// Create a new UDP transport layer
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            socket: None,
            remote: None,
            settings,
            closed: true,
            read_buffer: Vec::new(),
            read_position: 0,
        }
    }

    /// Local address the socket is bound to, once open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    async fn read_next_packet(&mut self) -> C12Result<()> {
        let socket = self.socket.as_ref().ok_or_else(|| not_connected("UDP socket"))?;
        let remote = self.remote.ok_or_else(|| not_connected("UDP socket"))?;
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];
        loop {
            let (len, addr) = socket.recv_from(&mut buf).await?;
            if addr == remote {
                buf.truncate(len);
                self.read_buffer = buf;
                self.read_position = 0;
                return Ok(());
            }
            log::debug!("UDP datagram from unexpected peer {} dropped", addr);
        }
    }
}

#[async_trait]
impl TransportLayer for UdpTransport {
    async fn open(&mut self) -> C12Result<()> {
        if !self.closed {
            return Err(already_open());
        }

        let remote = tokio::net::lookup_host(self.settings.remote_address.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                C12Error::InvalidData(format!(
                    "Invalid UDP address: {}",
                    self.settings.remote_address
                ))
            })?;
        let local = match &self.settings.local_address {
            Some(local) => local.clone(),
            None if remote.is_ipv6() => "[::]:0".to_string(),
            None => "0.0.0.0:0".to_string(),
        };
        let socket = UdpSocket::bind(local.as_str()).await?;

        self.socket = Some(socket);
        self.remote = Some(remote);
        self.read_buffer.clear();
        self.read_position = 0;
        self.closed = false;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }
}

#[async_trait]
impl StreamAccessor for UdpTransport {
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
        if self.read_position >= self.read_buffer.len() {
            self.read_next_packet().await?;
        }

        let available = self.read_buffer.len() - self.read_position;
        let to_read = buf.len().min(available);
        buf[..to_read].copy_from_slice(&self.read_buffer[self.read_position..self.read_position + to_read]);
        self.read_position += to_read;
        Ok(to_read)
    }

    async fn write(&mut self, buf: &[u8]) -> C12Result<usize> {
        let socket = self.socket.as_ref().ok_or_else(|| not_connected("UDP socket"))?;
        let remote = self.remote.ok_or_else(|| not_connected("UDP socket"))?;
        if buf.len() > MAX_UDP_PAYLOAD_SIZE {
            return Err(C12Error::InvalidData(format!(
                "UDP datagram of {} bytes exceeds {}",
                buf.len(),
                MAX_UDP_PAYLOAD_SIZE
            )));
        }
        Ok(socket.send_to(buf, remote).await?)
    }

    async fn flush(&mut self) -> C12Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> C12Result<()> {
        self.socket = None;
        self.remote = None;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_without_peer_listening() {
        let mut transport = UdpTransport::new(UdpSettings::new("127.0.0.1:1153"));
        transport.open().await.unwrap();
        assert!(!transport.is_closed());
        transport.close().await.unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_datagram_is_served_in_pieces() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut transport = UdpTransport::new(UdpSettings::new(peer.local_addr().unwrap().to_string()));
        transport.open().await.unwrap();

        transport.write_all(&[0x60, 0x00]).await.unwrap();
        let mut request = [0u8; 16];
        let (len, from) = peer.recv_from(&mut request).await.unwrap();
        assert_eq!(&request[..len], &[0x60, 0x00]);

        peer.send_to(&[1, 2, 3, 4, 5], from).await.unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(transport.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }
}
