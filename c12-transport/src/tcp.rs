//! TCP transport implementation

use crate::stream::{StreamAccessor, TransportKind, TransportLayer, already_open, not_connected};
use async_trait::async_trait;
use c12_core::{C12Error, C12Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Wrapper for TcpStream that implements Debug
struct DebugTcpStream(TcpStream);

impl fmt::Debug for DebugTcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream").finish()
    }
}

impl Deref for DebugTcpStream {
    type Target = TcpStream;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DebugTcpStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// TCP transport layer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSettings {
    /// `host:port`, the host may be a name
    pub address: String,
    pub connect_timeout: Option<Duration>,
}

impl TcpSettings {
    /// Create new TCP settings
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create TCP settings with connect timeout
    pub fn with_timeout(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Some(timeout),
        }
    }
}

/// TCP transport layer implementation
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<DebugTcpStream>,
    settings: TcpSettings,
    closed: bool,
}

impl TcpTransport {
    /// Create a new TCP transport layer
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            stream: None,
            settings,
            closed: true,
        }
    }

    pub fn settings(&self) -> &TcpSettings {
        &self.settings
    }
}

#[async_trait]
impl TransportLayer for TcpTransport {
    async fn open(&mut self) -> C12Result<()> {
        if !self.closed {
            return Err(already_open());
        }

        let connect = TcpStream::connect(self.settings.address.as_str());
        let stream = if let Some(timeout) = self.settings.connect_timeout {
            tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| {
                    C12Error::Connection(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("Connect to {} timed out", self.settings.address),
                    ))
                })??
        } else {
            connect.await?
        };
        stream.set_nodelay(true)?;
        log::debug!("TCP connected to {}", self.settings.address);

        self.stream = Some(DebugTcpStream(stream));
        self.closed = false;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

#[async_trait]
impl StreamAccessor for TcpTransport {
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("TCP stream"))?;

        match stream.read(buf).await {
            Ok(0) => {
                self.closed = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.closed = true;
                Err(C12Error::Connection(e))
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> C12Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("TCP stream"))?;
        stream.write(buf).await.map_err(C12Error::Connection)
    }

    async fn flush(&mut self) -> C12Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("TCP stream"))?;
        stream.flush().await.map_err(C12Error::Connection)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> C12Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.closed = true;
        Ok(())
    }
}
