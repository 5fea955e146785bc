//! Serial port transport implementation

use crate::stream::{StreamAccessor, TransportKind, TransportLayer, already_open, not_connected};
use async_trait::async_trait;
use c12_core::{C12Error, C12Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Wrapper for SerialStream that implements Debug
struct DebugSerialStream(SerialStream);

impl fmt::Debug for DebugSerialStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialStream").finish()
    }
}

impl Deref for DebugSerialStream {
    type Target = SerialStream;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DebugSerialStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(value: FlowControl) -> Self {
        match value {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Serial port transport layer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    /// Create new serial settings with 8N1 and no flow control
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Serial port transport layer implementation
#[derive(Debug)]
pub struct SerialTransport {
    stream: Option<DebugSerialStream>,
    settings: SerialSettings,
    closed: bool,
}

impl SerialTransport {
    /// Create a new serial transport layer
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            stream: None,
            settings,
            closed: true,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[async_trait]
impl TransportLayer for SerialTransport {
    async fn open(&mut self) -> C12Result<()> {
        if !self.closed {
            return Err(already_open());
        }

        let stream = tokio_serial::new(&self.settings.port_name, self.settings.baud_rate)
            .data_bits(self.settings.data_bits.into())
            .stop_bits(self.settings.stop_bits.into())
            .parity(self.settings.parity.into())
            .flow_control(self.settings.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                C12Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to open serial port {}: {}", self.settings.port_name, e),
                ))
            })?;
        log::debug!(
            "Serial port {} opened at {} baud",
            self.settings.port_name,
            self.settings.baud_rate
        );

        self.stream = Some(DebugSerialStream(stream));
        self.closed = false;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn set_baud_rate(&mut self, baud: u32) -> C12Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("Serial stream"))?;
        stream.set_baud_rate(baud).map_err(|e| {
            C12Error::Connection(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to set baud rate {}: {}", baud, e),
            ))
        })?;
        self.settings.baud_rate = baud;
        Ok(())
    }

    fn baud_rate(&self) -> Option<u32> {
        Some(self.settings.baud_rate)
    }
}

#[async_trait]
impl StreamAccessor for SerialTransport {
    async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("Serial stream"))?;

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
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("Serial stream"))?;
        stream.write(buf).await.map_err(C12Error::Connection)
    }

    async fn flush(&mut self) -> C12Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("Serial stream"))?;
        stream.flush().await.map_err(C12Error::Connection)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> C12Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush().await;
        }
        self.closed = true;
        Ok(())
    }
}
