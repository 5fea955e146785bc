//! Channel: timed and cancellable byte I/O over a transport
//!
//! The channel owns the transport and applies every timeout itself, the
//! protocol engine only supplies durations or deadlines. Bytes arriving
//! ahead of what a read asked for are kept in a read-ahead buffer, so
//! headers can be peeked before committing to a full packet.
//!
//! A caller may also set an operation deadline. It caps every read and
//! sleep until it is cleared, while writes and their echo always finish.
//!
//! Cancellation is cooperative. A request made through the
//! [`CancelHandle`] is honored before a transmission starts and while a
//! read is waiting for data, unless an uninterruptible window is open.
//! Writes always run inside such a window, together with the read back of
//! the echo on media that echo.

use crate::buffer::CircularBuffer;
use crate::cancel::{CancelHandle, Uninterruptible, UninterruptibleGuard};
use crate::config::ChannelConfig;
use crate::stream::{TransportKind, TransportLayer, not_connected};
use c12_core::{C12Error, C12Result, to_hex};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

const READ_CHUNK_SIZE: usize = 1024;

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "Disconnected",
            ChannelState::Connecting => "Connecting",
            ChannelState::Connected => "Connected",
        }
    }
}

/// Byte and event counters of a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub read_timeouts: u64,
    pub collisions: u64,
}

impl ChannelStatistics {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

enum Fill {
    Data,
    Elapsed,
}

/// Byte channel to a remote meter
pub struct Channel {
    transport: Box<dyn TransportLayer>,
    state: ChannelState,
    input: CircularBuffer,
    scratch: Vec<u8>,
    intercharacter_timeout: Duration,
    cancel: CancelHandle,
    window: Uninterruptible,
    statistics: ChannelStatistics,
    operation_deadline: Option<Instant>,
    operation_deadline_hit: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.transport.kind())
            .field("state", &self.state)
            .field("buffered", &self.input.len())
            .field("intercharacter_timeout", &self.intercharacter_timeout)
            .finish()
    }
}

impl Channel {
    pub fn new(transport: Box<dyn TransportLayer>) -> Self {
        Self {
            transport,
            state: ChannelState::Disconnected,
            input: CircularBuffer::new(),
            scratch: vec![0u8; READ_CHUNK_SIZE],
            intercharacter_timeout: Duration::ZERO,
            cancel: CancelHandle::new(),
            window: Uninterruptible::new(),
            statistics: ChannelStatistics::default(),
            operation_deadline: None,
            operation_deadline_hit: false,
        }
    }

    pub fn from_config(config: ChannelConfig) -> Self {
        Self::new(config.into_transport())
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn echoes_written_bytes(&self) -> bool {
        self.transport.echoes_written_bytes()
    }

    pub fn intercharacter_timeout(&self) -> Duration {
        self.intercharacter_timeout
    }

    /// Maximum silence between two bytes of one read, zero to apply the
    /// read timeout to the whole read
    pub fn set_intercharacter_timeout(&mut self, timeout: Duration) {
        self.intercharacter_timeout = timeout;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Open an uninterruptible window, closed when the guard is dropped
    pub fn uninterruptible(&self) -> UninterruptibleGuard {
        self.window.enter()
    }

    pub fn statistics(&self) -> &ChannelStatistics {
        &self.statistics
    }

    /// Bytes received but not yet consumed
    pub fn buffered_len(&self) -> usize {
        self.input.len()
    }

    pub async fn open(&mut self) -> C12Result<()> {
        if self.state == ChannelState::Connected {
            return Ok(());
        }
        self.check_cancelled()?;
        self.state = ChannelState::Connecting;
        match self.transport.open().await {
            Ok(()) => {
                self.input.clear();
                self.state = ChannelState::Connected;
                log::debug!("Channel {} connected", self.transport.kind());
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Disconnected;
                log::debug!("Channel {} failed to connect: {}", self.transport.kind(), e);
                Err(e)
            }
        }
    }

    /// Release the transport, calling it again does nothing
    pub async fn close(&mut self) -> C12Result<()> {
        if self.state == ChannelState::Disconnected && self.transport.is_closed() {
            return Ok(());
        }
        if let Err(e) = self.transport.close().await {
            log::warn!("Channel {} close failed: {}", self.transport.kind(), e);
        }
        self.input.clear();
        self.state = ChannelState::Disconnected;
        log::debug!("Channel {} disconnected", self.transport.kind());
        Ok(())
    }

    /// Line speed of the underlying medium, if it has one
    pub fn baud_rate(&self) -> Option<u32> {
        self.transport.baud_rate()
    }

    pub async fn set_baud_rate(&mut self, baud: u32) -> C12Result<()> {
        self.ensure_connected()?;
        self.transport.set_baud_rate(baud).await
    }

    fn ensure_connected(&self) -> C12Result<()> {
        if self.state == ChannelState::Connected {
            Ok(())
        } else {
            Err(not_connected("Channel"))
        }
    }

    fn honor_cancel(&self) -> C12Error {
        self.cancel.reset();
        log::debug!("Channel {} operation cancelled", self.transport.kind());
        C12Error::OperationCancelled
    }

    /// Bound all reads and sleeps by `deadline` until it is set to `None`
    pub fn set_operation_deadline(&mut self, deadline: Option<Instant>) {
        self.operation_deadline = deadline;
        self.operation_deadline_hit = false;
    }

    pub fn operation_deadline(&self) -> Option<Instant> {
        self.operation_deadline
    }

    /// Whether a read or sleep was cut short by the operation deadline
    pub fn operation_deadline_expired(&self) -> bool {
        self.operation_deadline_hit
    }

    /// `deadline` lowered to the operation deadline, and whether it was
    ///
    /// The echo of a write is read inside the uninterruptible window and is
    /// not capped.
    fn capped(&self, deadline: Instant) -> (Instant, bool) {
        match self.operation_deadline {
            Some(limit) if limit < deadline && !self.window.is_active() => (limit, true),
            _ => (deadline, false),
        }
    }

    /// Fail with `OperationCancelled` if a cancellation is pending and can
    /// be honored now
    pub fn check_cancelled(&self) -> C12Result<()> {
        if !self.window.is_active() && self.cancel.is_cancelled() {
            return Err(self.honor_cancel());
        }
        Ok(())
    }

    async fn fill(&mut self, deadline: Instant) -> C12Result<Fill> {
        let (deadline, by_operation) = self.capped(deadline);
        let token = self.cancel.token();
        let honor = !self.window.is_active();
        let read = tokio::time::timeout_at(deadline, self.transport.read(&mut self.scratch));
        let outcome = if honor {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                outcome = read => Some(outcome),
            }
        } else {
            Some(read.await)
        };
        let Some(outcome) = outcome else {
            return Err(self.honor_cancel());
        };
        match outcome {
            Err(_) => {
                if by_operation {
                    log::debug!("Channel {} read stopped at the operation deadline", self.transport.kind());
                    self.operation_deadline_hit = true;
                }
                Ok(Fill::Elapsed)
            }
            Ok(Ok(0)) => {
                self.state = ChannelState::Disconnected;
                log::debug!("Channel {} closed by peer", self.transport.kind());
                Err(C12Error::ChannelDisconnectedUnexpectedly)
            }
            Ok(Ok(n)) => {
                log::trace!("RX {}", to_hex(&self.scratch[..n]));
                self.input.put(&self.scratch[..n]);
                self.statistics.bytes_received += n as u64;
                Ok(Fill::Data)
            }
            Ok(Err(e)) => {
                self.state = ChannelState::Disconnected;
                Err(e)
            }
        }
    }

    /// Buffer at least `count` bytes
    ///
    /// With `whole` the deadline applies to all bytes. Otherwise the first
    /// byte has to arrive within `timeout` and each next one within the
    /// intercharacter timeout, when that is not zero.
    async fn fill_to(&mut self, count: usize, timeout: Duration, whole: Option<Instant>) -> C12Result<()> {
        let mut deadline = whole.unwrap_or_else(|| Instant::now() + timeout);
        while self.input.len() < count {
            match self.fill(deadline).await? {
                Fill::Data => {
                    if whole.is_none() && !self.intercharacter_timeout.is_zero() {
                        deadline = Instant::now() + self.intercharacter_timeout;
                    }
                }
                Fill::Elapsed => {
                    self.statistics.read_timeouts += 1;
                    return Err(C12Error::ChannelReadTimeout {
                        bytes_read: self.input.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let mut data = vec![0u8; count.min(self.input.len())];
        self.input.get(&mut data);
        data
    }

    /// Read whatever is available, up to `max` bytes, waiting for at least one
    pub async fn read(&mut self, max: usize, timeout: Duration) -> C12Result<Vec<u8>> {
        self.ensure_connected()?;
        self.fill_to(1, timeout, None).await?;
        Ok(self.take(max))
    }

    /// Read exactly `count` bytes
    ///
    /// Bytes received before a timeout are dropped, the error reports how
    /// many there were.
    pub async fn read_exact(&mut self, count: usize, timeout: Duration) -> C12Result<Vec<u8>> {
        self.ensure_connected()?;
        if let Err(e) = self.fill_to(count, timeout, None).await {
            if e.is_timeout() {
                self.input.clear();
            }
            return Err(e);
        }
        Ok(self.take(count))
    }

    /// Read exactly `count` bytes, all of them before `deadline`
    pub async fn read_exact_until(&mut self, count: usize, deadline: Instant) -> C12Result<Vec<u8>> {
        self.ensure_connected()?;
        if let Err(e) = self.fill_to(count, Duration::ZERO, Some(deadline)).await {
            if e.is_timeout() {
                self.input.clear();
            }
            return Err(e);
        }
        Ok(self.take(count))
    }

    /// Wait for `count` bytes without consuming them
    pub async fn peek_exact(&mut self, count: usize, timeout: Duration) -> C12Result<Vec<u8>> {
        self.ensure_connected()?;
        self.fill_to(count, timeout, None).await?;
        Ok(self.input.peek(count))
    }

    /// Drop up to `count` buffered bytes
    pub fn discard(&mut self, count: usize) -> usize {
        self.input.discard(count)
    }

    /// Skip garbage until one of `valid` arrives, leaving it unread
    pub async fn wait_start_char(&mut self, valid: &[u8], timeout: Duration) -> C12Result<u8> {
        self.ensure_connected()?;
        let deadline = Instant::now() + timeout;
        let mut garbage = 0;
        loop {
            let (dropped, found) = self.input.discard_until(valid);
            garbage += dropped;
            if let (true, Some(byte)) = (found, self.input.peek_byte(0)) {
                if garbage > 0 {
                    log::debug!("Skipped {} garbage bytes before start byte {:02X}", garbage, byte);
                }
                return Ok(byte);
            }
            if let Fill::Elapsed = self.fill(deadline).await? {
                self.statistics.read_timeouts += 1;
                if garbage > 0 {
                    log::debug!("No valid start byte among {} garbage bytes", garbage);
                }
                return Err(C12Error::ChannelReadTimeout { bytes_read: garbage });
            }
        }
    }

    /// Skip garbage until one of `valid` arrives and consume it
    pub async fn read_start_char(&mut self, valid: &[u8], timeout: Duration) -> C12Result<u8> {
        let byte = self.wait_start_char(valid, timeout).await?;
        self.input.discard(1);
        Ok(byte)
    }

    /// Push bytes back, the next read returns them first
    pub fn unread(&mut self, bytes: &[u8]) {
        self.input.unget(bytes);
    }

    /// Drop buffered bytes and whatever the transport has ready right now
    pub async fn clear_input(&mut self) -> C12Result<()> {
        self.ensure_connected()?;
        self.input.clear();
        loop {
            match tokio::time::timeout(Duration::ZERO, self.transport.read(&mut self.scratch)).await {
                Ok(Ok(0)) => {
                    self.state = ChannelState::Disconnected;
                    return Err(C12Error::ChannelDisconnectedUnexpectedly);
                }
                Ok(Ok(n)) => log::trace!("Cleared {}", to_hex(&self.scratch[..n])),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Drop input until the line stays silent for `silence`
    pub async fn clear_input_until_silence(&mut self, silence: Duration) -> C12Result<()> {
        self.ensure_connected()?;
        self.input.clear();
        loop {
            match self.fill(Instant::now() + silence).await? {
                Fill::Data => self.input.clear(),
                Fill::Elapsed => return Ok(()),
            }
        }
    }

    /// Sleep, returning early with `OperationCancelled` when cancelled
    ///
    /// A sleep that would outlast the operation deadline stops there with
    /// `ChannelReadTimeout`.
    pub async fn sleep(&mut self, duration: Duration) -> C12Result<()> {
        let (until, by_operation) = self.capped(Instant::now() + duration);
        if self.window.is_active() {
            tokio::time::sleep_until(until).await;
        } else {
            let token = self.cancel.token();
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.honor_cancel()),
                _ = tokio::time::sleep_until(until) => {}
            }
        }
        if by_operation {
            self.operation_deadline_hit = true;
            return Err(C12Error::ChannelReadTimeout { bytes_read: 0 });
        }
        Ok(())
    }

    /// Write all bytes within `timeout`, returning how many were written
    ///
    /// On media that echo, the written bytes are read back and compared.
    /// Foreign bytes in the echo mean another station transmitted at the
    /// same time, reported as `CollisionDetected`.
    pub async fn write(&mut self, bytes: &[u8], timeout: Duration) -> C12Result<usize> {
        self.ensure_connected()?;
        self.check_cancelled()?;
        let _guard = self.window.enter();

        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < bytes.len() {
            let n = match tokio::time::timeout_at(deadline, self.transport.write(&bytes[written..])).await {
                Ok(Ok(0)) => {
                    self.state = ChannelState::Disconnected;
                    return Err(C12Error::ChannelDisconnectedUnexpectedly);
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.state = ChannelState::Disconnected;
                    return Err(e);
                }
                Err(_) => return Err(C12Error::ChannelWriteTimeout { bytes_written: written }),
            };
            written += n;
        }
        match tokio::time::timeout_at(deadline, self.transport.flush()).await {
            Ok(result) => result?,
            Err(_) => return Err(C12Error::ChannelWriteTimeout { bytes_written: written }),
        }
        log::trace!("TX {}", to_hex(bytes));
        self.statistics.bytes_sent += bytes.len() as u64;

        if self.transport.echoes_written_bytes() {
            let echo_timeout = if self.intercharacter_timeout.is_zero() {
                timeout
            } else {
                self.intercharacter_timeout
            };
            self.check_echo(bytes, echo_timeout).await?;
        }
        Ok(written)
    }

    async fn check_echo(&mut self, sent: &[u8], timeout: Duration) -> C12Result<()> {
        let mut deadline = Instant::now() + timeout;
        loop {
            let available = self.input.len().min(sent.len());
            if self.input.peek(available) != sent[..available] {
                log::warn!(
                    "Echo {} does not match sent bytes, collision",
                    to_hex(&self.input.peek(available))
                );
                self.input.clear();
                self.statistics.collisions += 1;
                return Err(C12Error::CollisionDetected);
            }
            if available == sent.len() {
                self.input.discard(available);
                return Ok(());
            }
            match self.fill(deadline).await? {
                Fill::Data => deadline = Instant::now() + timeout,
                Fill::Elapsed => {
                    return Err(C12Error::ChannelWriteTimeout {
                        bytes_written: available,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryTransport, SharedLine};
    use crate::stream::StreamAccessor;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::{Builder, Mock};
    use tokio_test::{assert_err, assert_ok};

    /// Transport replaying a tokio-test script
    struct ScriptedTransport(Mock);

    #[async_trait]
    impl StreamAccessor for ScriptedTransport {
        async fn read(&mut self, buf: &mut [u8]) -> C12Result<usize> {
            Ok(self.0.read(buf).await?)
        }

        async fn write(&mut self, buf: &[u8]) -> C12Result<usize> {
            Ok(self.0.write(buf).await?)
        }

        async fn flush(&mut self) -> C12Result<()> {
            Ok(self.0.flush().await?)
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&mut self) -> C12Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TransportLayer for ScriptedTransport {
        async fn open(&mut self) -> C12Result<()> {
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Memory
        }
    }

    async fn scripted(mock: Mock) -> Channel {
        let mut channel = Channel::new(Box::new(ScriptedTransport(mock)));
        channel.open().await.unwrap();
        channel
    }

    async fn memory_channel() -> (Channel, MemoryTransport) {
        let (near, far) = MemoryTransport::pair();
        let mut channel = Channel::new(Box::new(near));
        channel.open().await.unwrap();
        (channel, far)
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_read_exact_assembles_chunks() {
        let mock = Builder::new().read(&[0xEE, 0x00]).read(&[0x20, 0x00]).build();
        let mut channel = scripted(mock).await;
        assert_eq!(channel.read_exact(3, SECOND).await.unwrap(), vec![0xEE, 0x00, 0x20]);
        assert_eq!(channel.buffered_len(), 1);
        assert_eq!(channel.read(8, SECOND).await.unwrap(), vec![0x00]);
        assert_eq!(channel.statistics().bytes_received, 4);
    }

    #[tokio::test]
    async fn test_write_then_read_reply() {
        let mock = Builder::new().write(&[0xEE, 0x00, 0x20]).read(&[0x06]).build();
        let mut channel = scripted(mock).await;
        assert_eq!(channel.write(&[0xEE, 0x00, 0x20], SECOND).await.unwrap(), 3);
        assert_eq!(channel.read_start_char(&[0x06, 0x15], SECOND).await.unwrap(), 0x06);
        assert_eq!(channel.statistics().bytes_sent, 3);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_disconnect() {
        let mock = Builder::new().read(&[0x06]).build();
        let mut channel = scripted(mock).await;
        let result = channel.read_exact(2, SECOND).await;
        assert!(matches!(result, Err(C12Error::ChannelDisconnectedUnexpectedly)));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_timeout_not_disconnect() {
        let (mut channel, far) = memory_channel().await;
        let result = channel.read_exact(1, SECOND).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { bytes_read: 0 })));
        assert!(channel.is_connected());

        drop(far);
        let result = channel.read_exact(1, SECOND).await;
        assert!(matches!(result, Err(C12Error::ChannelDisconnectedUnexpectedly)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_deadline_caps_reads_and_sleeps() {
        let (mut channel, mut far) = memory_channel().await;
        let start = Instant::now();
        channel.set_operation_deadline(Some(start + Duration::from_millis(300)));
        let result = channel.read_exact(1, 10 * SECOND).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { bytes_read: 0 })));
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert!(channel.operation_deadline_expired());

        // writes still go out whole
        assert_eq!(channel.write(&[0xEE, 0x00, 0x20], SECOND).await.unwrap(), 3);
        let mut received = [0u8; 8];
        let n = far.read(&mut received).await.unwrap();
        assert_eq!(&received[..n], &[0xEE, 0x00, 0x20]);

        assert!(matches!(
            channel.sleep(SECOND).await,
            Err(C12Error::ChannelReadTimeout { .. })
        ));
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        channel.set_operation_deadline(None);
        assert!(!channel.operation_deadline_expired());
        channel.sleep(SECOND).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_intercharacter_timeout_cuts_read_short() {
        let (mut channel, mut far) = memory_channel().await;
        channel.set_intercharacter_timeout(Duration::from_millis(500));
        far.write_all(&[0xEE]).await.unwrap();

        let start = Instant::now();
        let result = channel.read_exact(8, Duration::from_secs(10)).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { bytes_read: 1 })));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(channel.buffered_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_exact_until_deadline() {
        let (mut channel, mut far) = memory_channel().await;
        far.write_all(&[1, 2]).await.unwrap();
        let deadline = Instant::now() + SECOND;
        assert_eq!(channel.read_exact_until(2, deadline).await.unwrap(), vec![1, 2]);
        let result = channel.read_exact_until(1, deadline).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { .. })));
    }

    #[tokio::test]
    async fn test_peek_and_unread() {
        let (mut channel, mut far) = memory_channel().await;
        far.write_all(&[0xEE, 0x00, 0x20, 0x00]).await.unwrap();
        assert_eq!(channel.peek_exact(2, SECOND).await.unwrap(), vec![0xEE, 0x00]);
        assert_eq!(channel.read_exact(1, SECOND).await.unwrap(), vec![0xEE]);
        channel.unread(&[0x55, 0xEE]);
        assert_eq!(channel.read_exact(3, SECOND).await.unwrap(), vec![0x55, 0xEE, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_char_skips_garbage() {
        let (mut channel, mut far) = memory_channel().await;
        far.write_all(&[0x00, 0xFF, 0x60, 0x03]).await.unwrap();
        assert_eq!(channel.wait_start_char(&[0x60], SECOND).await.unwrap(), 0x60);
        assert_eq!(channel.read_exact(2, SECOND).await.unwrap(), vec![0x60, 0x03]);

        far.write_all(&[0x01, 0x02]).await.unwrap();
        let result = channel.read_start_char(&[0x60], SECOND).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { bytes_read: 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_reading() {
        let (mut channel, _far) = memory_channel().await;
        let handle = channel.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });
        let start = Instant::now();
        let result = channel.read_exact(1, Duration::from_secs(10)).await;
        assert!(matches!(result, Err(C12Error::OperationCancelled)));
        assert!(start.elapsed() < SECOND);

        // honored once, the next read runs to its timeout
        let result = channel.read_exact(1, SECOND).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_deferred_inside_window() {
        let (mut channel, _far) = memory_channel().await;
        channel.cancel_handle().cancel();
        {
            let _guard = channel.uninterruptible();
            let result = channel.read_exact(1, SECOND).await;
            assert!(matches!(result, Err(C12Error::ChannelReadTimeout { .. })));
            assert_ok!(channel.check_cancelled());
        }
        assert!(matches!(channel.check_cancelled(), Err(C12Error::OperationCancelled)));
        assert_ok!(channel.check_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_transmit() {
        let (mut channel, _far) = memory_channel().await;
        channel.cancel_handle().cancel();
        let result = channel.write(&[0xEE], SECOND).await;
        assert!(matches!(result, Err(C12Error::OperationCancelled)));
        assert_eq!(channel.statistics().bytes_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cancellable() {
        let (mut channel, _far) = memory_channel().await;
        let handle = channel.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        let result = channel.sleep(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(C12Error::OperationCancelled)));
    }

    #[tokio::test]
    async fn test_echo_is_consumed() {
        let line = SharedLine::new();
        let mut channel = Channel::new(Box::new(line.station()));
        let mut meter = line.station();
        channel.open().await.unwrap();

        channel.write(&[0xEE, 0x00], SECOND).await.unwrap();
        let mut buf = [0u8; 2];
        meter.read(&mut buf).await.unwrap();
        meter.write_all(&[0x06]).await.unwrap();
        assert_eq!(channel.read(8, SECOND).await.unwrap(), vec![0x06]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_transmission_is_collision() {
        let line = SharedLine::new();
        let mut channel = Channel::new(Box::new(line.station()));
        let mut other = line.station();
        channel.open().await.unwrap();
        channel.set_intercharacter_timeout(Duration::from_millis(500));

        other.write_all(&[0xEE, 0x01, 0x00]).await.unwrap();
        let start = Instant::now();
        let result = channel.write(&[0xEE, 0x00, 0x20], Duration::from_secs(10)).await;
        assert!(matches!(result, Err(C12Error::CollisionDetected)));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(channel.statistics().collisions, 1);
        assert_eq!(channel.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_clear_input_and_close_idempotent() {
        let (mut channel, mut far) = memory_channel().await;
        far.write_all(&[1, 2, 3]).await.unwrap();
        channel.unread(&[9]);
        assert_ok!(channel.clear_input().await);
        assert_eq!(channel.buffered_len(), 0);

        assert_ok!(channel.close().await);
        assert_ok!(channel.close().await);
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_err!(channel.read(1, SECOND).await);
    }
}
