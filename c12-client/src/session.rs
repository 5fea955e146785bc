//! Caller-facing meter session
//!
//! A [`Session`] owns the engine behind a `tokio` mutex, so concurrent
//! callers are served one transaction at a time. Every operation takes a
//! deadline that the channel applies to its reads and sleeps. A write in
//! progress always completes. An expired deadline abandons the exchange and
//! reports a read timeout, the session itself stays usable.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use c12_client::Session;
//! use c12_core::{Dialect, ProtocolConfig, TableDescriptor};
//! use c12_transport::{ChannelConfig, SerialSettings};
//! use std::time::Duration;
//!
//! # async fn example() -> c12_core::C12Result<()> {
//! let channel = ChannelConfig::Serial(SerialSettings::new("/dev/ttyUSB0", 9600));
//! let session = Session::connect(channel, Dialect::C1218, ProtocolConfig::default()).await?;
//! let table = session.read_table(&TableDescriptor::full(1), Duration::from_secs(30)).await?;
//! println!("{} bytes", table.actual_length());
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

use crate::engine::{Negotiated, Protocol};
use crate::progress::ProgressSink;
use c12_application::service::IdentifyResponse;
use c12_core::{C12Result, Dialect, ProtocolConfig, TableDescriptor, TableRawData};
use c12_security::{Clock, SystemClock};
use c12_session::SessionState;
use c12_transport::{CancelHandle, Channel, ChannelConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// An established session with one meter
pub struct Session {
    protocol: Mutex<Protocol>,
    cancel: CancelHandle,
    dialect: Dialect,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("dialect", &self.dialect).finish()
    }
}

impl Session {
    /// Open the channel described by `channel_config` and start a session
    pub async fn connect(channel_config: ChannelConfig, dialect: Dialect, config: ProtocolConfig) -> C12Result<Self> {
        Self::connect_with_channel(Channel::from_config(channel_config), dialect, config).await
    }

    /// Start a session on an existing channel, opened if needed
    pub async fn connect_with_channel(channel: Channel, dialect: Dialect, config: ProtocolConfig) -> C12Result<Self> {
        Self::connect_with_clock(channel, dialect, config, Arc::new(SystemClock)).await
    }

    /// Like [`connect_with_channel`](Self::connect_with_channel), with the
    /// clock that seeds C12.22 initialization vectors
    pub async fn connect_with_clock(
        channel: Channel,
        dialect: Dialect,
        config: ProtocolConfig,
        clock: Arc<dyn Clock>,
    ) -> C12Result<Self> {
        Self::start(Protocol::new(channel, dialect, config, clock)?).await
    }

    /// Start a session on an engine prepared by the caller
    pub async fn start(mut protocol: Protocol) -> C12Result<Self> {
        let cancel = protocol.channel().cancel_handle();
        let dialect = protocol.dialect();
        protocol.start_session().await?;
        Ok(Self {
            protocol: Mutex::new(protocol),
            cancel,
            dialect,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn set_progress(&self, sink: Option<Arc<dyn ProgressSink>>) {
        self.protocol.lock().await.set_progress(sink);
    }

    /// Read a table within `timeout`
    ///
    /// # Errors
    ///
    /// * `IndexOutOfRange` / `NumberOutOfRange` for a bad descriptor, before
    ///   any I/O
    /// * `ChannelReadTimeout` when `timeout` expires
    /// * `PartialData` when the meter sent less than it announced
    pub async fn read_table(&self, descriptor: &TableDescriptor, timeout: Duration) -> C12Result<TableRawData> {
        let mut protocol = self.protocol.lock().await;
        protocol.begin_deadline(timeout);
        let result = protocol.read_table(descriptor).await;
        protocol.end_deadline();
        result
    }

    /// Write a table within `timeout`
    pub async fn write_table(&self, descriptor: &TableDescriptor, data: &[u8], timeout: Duration) -> C12Result<()> {
        let mut protocol = self.protocol.lock().await;
        protocol.begin_deadline(timeout);
        let result = protocol.write_table(descriptor, data).await;
        protocol.end_deadline();
        result
    }

    /// Run procedure `number` and return its response data
    pub async fn execute_procedure(&self, number: u16, parameters: &[u8], timeout: Duration) -> C12Result<Vec<u8>> {
        let mut protocol = self.protocol.lock().await;
        protocol.begin_deadline(timeout);
        let result = protocol.execute_procedure(number, parameters).await;
        protocol.end_deadline();
        result
    }

    /// Keep the session open for `seconds` more
    pub async fn wait(&self, seconds: u32, timeout: Duration) -> C12Result<()> {
        let mut protocol = self.protocol.lock().await;
        protocol.begin_deadline(timeout);
        let result = protocol.wait(seconds).await;
        protocol.end_deadline();
        result
    }

    /// Interrupt the running operation at its next cancellation point
    ///
    /// The operation fails with `OperationCancelled` and the session is
    /// closed. A write in progress completes first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// End the session and close the channel, errors are only logged
    pub async fn disconnect(&self) {
        self.protocol.lock().await.end_session().await;
    }

    pub async fn state(&self) -> SessionState {
        self.protocol.lock().await.state()
    }

    pub async fn is_active(&self) -> bool {
        self.state().await.is_active()
    }

    pub async fn identification(&self) -> Option<IdentifyResponse> {
        self.protocol.lock().await.identification().cloned()
    }

    pub async fn negotiated(&self) -> Option<Negotiated> {
        self.protocol.lock().await.negotiated()
    }
}
