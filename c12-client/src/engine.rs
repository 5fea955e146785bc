//! Protocol engine shared by all dialects
//!
//! One [`Protocol`] drives one channel. The dialect decides the wire (packet
//! link or APDU link) and the session start and end sequences; table reads,
//! writes, procedures and waits are the same for all of them.
//!
//! # Failure handling
//!
//! Every error maps to a [`FailureDisposition`]. Errors that keep the session
//! leave it in `SessionActive`; the others close the channel and move the
//! session to `Disconnected`.

use crate::c1222::ApduLink;
use crate::progress::{ProgressSink, ProgressTracker};
use c12_application::iso8825::Reader;
use c12_application::procedure::{PROCEDURE_REQUEST_TABLE, PROCEDURE_RESPONSE_TABLE, ProcedureRequest, ProcedureResponse};
use c12_application::service::{
    IdentifyResponse, MIN_IDENTIFY_RESPONSE_SIZE, NegotiateResponse, Request, Response, baud_to_index,
    logon_response, read_table_response,
};
use c12_core::{
    C12Error, C12Result, Dialect, FailureDisposition, Framing, ProtocolConfig, TableAccess, TableDescriptor,
    TableRawData,
};
use c12_security::{AES_BLOCK_SIZE, Clock, DES_BLOCK_SIZE, SecretKey};
use c12_session::{
    LinkLayer, LinkParameters, PARTIAL_WRITE_SERVICE_OVERHEAD, READ_SERVICE_OVERHEAD, SessionState,
    WRITE_SERVICE_OVERHEAD,
};
use c12_transport::{Channel, TransportKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use zeroize::Zeroize;

/// Pause before the session start is repeated at the initial baud rate
const BAUD_FALLBACK_DELAY: Duration = Duration::from_secs(7);

/// Whether a failed negotiate or logon is worth a second try at the
/// initial baud rate
fn retries_at_initial_baud(error: &C12Error) -> bool {
    !matches!(
        error,
        C12Error::ChannelDisconnectedUnexpectedly
            | C12Error::OperationCancelled
            | C12Error::NokResponse { .. }
            | C12Error::Connection(_)
    )
}

/// Failures that a caller deadline does not explain
fn ends_the_channel(error: &C12Error) -> bool {
    matches!(
        error,
        C12Error::ChannelDisconnectedUnexpectedly | C12Error::OperationCancelled | C12Error::Connection(_)
    )
}

/// Link parameters agreed with the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub packet_size: u16,
    pub max_packets: u8,
    /// Baud rate the channel switched to, if any
    pub baud: Option<u32>,
}

/// How services travel to the meter
pub(crate) enum Wire {
    /// C12.18 and C12.21 packets
    Packet(LinkLayer),
    /// C12.22 APDUs
    Apdu(Box<ApduLink>),
}

/// Session state and wire of one meter connection
pub struct Protocol {
    pub(crate) dialect: Dialect,
    pub(crate) config: ProtocolConfig,
    pub(crate) channel: Channel,
    pub(crate) state: SessionState,
    pub(crate) wire: Wire,
    pub(crate) progress: Option<Arc<dyn ProgressSink>>,
    pub(crate) identification: Option<IdentifyResponse>,
    pub(crate) negotiated: Option<Negotiated>,
    /// C12.21 authenticate key, taken out of the configuration
    pub(crate) authentication_key: Option<SecretKey>,
    procedure_sequence: u8,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("dialect", &self.dialect)
            .field("state", &self.state)
            .field("channel", &self.channel.kind())
            .field("negotiated", &self.negotiated)
            .finish()
    }
}

impl Protocol {
    /// Build the engine for one session
    ///
    /// Key material moves out of `config` into wiped-on-drop holders, the
    /// copies left in the configuration are zeroed.
    pub fn new(channel: Channel, dialect: Dialect, mut config: ProtocolConfig, clock: Arc<dyn Clock>) -> C12Result<Self> {
        config.validate()?;
        let wire = match dialect.capabilities().framing {
            Framing::Packet => Wire::Packet(LinkLayer::new(LinkParameters::from_config(&config))),
            Framing::Apdu => Wire::Apdu(Box::new(ApduLink::new(&config, clock)?)),
        };
        let authentication_key = if config.c1221.enable_authentication {
            Some(SecretKey::new(
                &config.c1221.authentication_key,
                &[DES_BLOCK_SIZE, AES_BLOCK_SIZE],
            )?)
        } else {
            None
        };
        config.c1221.authentication_key.zeroize();
        config.c1222.security_key.zeroize();
        Ok(Self {
            dialect,
            config,
            channel,
            state: SessionState::Disconnected,
            wire,
            progress: None,
            identification: None,
            negotiated: None,
            authentication_key,
            procedure_sequence: 0,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn identification(&self) -> Option<&IdentifyResponse> {
        self.identification.as_ref()
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn set_progress(&mut self, sink: Option<Arc<dyn ProgressSink>>) {
        self.progress = sink;
    }

    pub(crate) fn set_state(&mut self, next: SessionState) -> C12Result<()> {
        self.state.validate_transition(next)?;
        log::debug!("{} session {} -> {}", self.dialect, self.state.as_str(), next.as_str());
        self.state = next;
        Ok(())
    }

    pub(crate) fn packet_link(&mut self) -> C12Result<&mut LinkLayer> {
        match &mut self.wire {
            Wire::Packet(link) => Ok(link),
            Wire::Apdu(_) => Err(C12Error::InvalidState(format!(
                "{} has no packet link",
                self.dialect
            ))),
        }
    }

    pub(crate) fn apdu_link(&mut self) -> C12Result<&mut ApduLink> {
        match &mut self.wire {
            Wire::Apdu(link) => Ok(link),
            Wire::Packet(_) => Err(C12Error::InvalidState(format!(
                "{} has no APDU link",
                self.dialect
            ))),
        }
    }

    fn ensure_active(&self) -> C12Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(C12Error::InvalidState(format!(
                "Session is {}, not active",
                self.state.as_str()
            )))
        }
    }

    /// Send one encoded service and return the raw response
    async fn exchange(&mut self, request: &[u8], tracker: &mut ProgressTracker) -> C12Result<Vec<u8>> {
        match &mut self.wire {
            Wire::Packet(link) => {
                link.request(&mut self.channel, request, &mut |received| tracker.report(received))
                    .await
            }
            Wire::Apdu(link) => {
                let response = link.request(&mut self.channel, request).await?;
                tracker.report(response.len());
                Ok(response)
            }
        }
    }

    /// Run a service, returning the parameters that follow an OK code
    ///
    /// BSY and DNR answers are retried after a delay, up to the application
    /// layer retry count.
    pub(crate) async fn transact_with_progress(
        &mut self,
        request: &Request,
        tracker: &mut ProgressTracker,
    ) -> C12Result<Vec<u8>> {
        let bytes = request.encode();
        let mut retries = self.config.application_layer_retries;
        loop {
            let response = self.exchange(&bytes, tracker).await?;
            match Response::new(&response).check_code() {
                Ok(parameters) => return Ok(parameters.remaining_bytes().to_vec()),
                Err(e) if retries > 0 && e.is_retryable() => {
                    retries -= 1;
                    log::debug!("{} answered with {}, retrying", request.code.name(), e);
                    self.channel.sleep(self.config.application_layer_retry_delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn transact(&mut self, request: &Request) -> C12Result<Vec<u8>> {
        self.transact_with_progress(request, &mut ProgressTracker::new(None, 0)).await
    }

    /// Identify, with toggle bits of a previous session forgotten
    pub(crate) async fn identify(&mut self, with_features: bool) -> C12Result<()> {
        let link = match &mut self.wire {
            Wire::Packet(link) => link,
            Wire::Apdu(_) => return Err(C12Error::InvalidState("Identify needs the packet link".to_string())),
        };
        link.reset();
        link.forget_receive_toggle();
        let response = link
            .request_with_minimum(
                &mut self.channel,
                &Request::identify().encode(),
                MIN_IDENTIFY_RESPONSE_SIZE + 1,
            )
            .await?;
        let mut reader = Response::new(&response).check_code()?;
        let identification = if with_features {
            IdentifyResponse::parse_with_features(&mut reader)?
        } else {
            IdentifyResponse::parse(&mut reader)?
        };
        log::debug!(
            "Meter identified as standard {} version {}.{}",
            identification.reference_standard,
            identification.standard_version,
            identification.standard_revision
        );
        self.identification = Some(identification);
        Ok(())
    }

    /// Negotiate packet size and count, and the baud rate when asked for
    pub(crate) async fn negotiate(&mut self, with_baud: bool) -> C12Result<()> {
        self.set_state(SessionState::Negotiating)?;
        let baud_capable = matches!(self.channel.kind(), TransportKind::Serial | TransportKind::CurrentLoop);
        let baud_index = if with_baud && baud_capable && self.config.session_baud != 0 {
            Some(baud_to_index(self.config.session_baud)?)
        } else {
            None
        };
        let request = Request::negotiate(self.config.packet_size, self.config.max_packets, baud_index);
        let parameters = self.transact(&request).await?;
        let response = NegotiateResponse::parse(&mut Reader::new(&parameters), baud_index.is_some())?;

        let link = self.packet_link()?;
        let packet_size = link.apply_negotiated(response.packet_size, response.max_packets)?;
        let max_packets = link.negotiated_max_packets();
        if let Some(baud) = response.baud {
            self.channel.set_baud_rate(baud).await?;
        }
        log::debug!("Negotiated packet size {} and {} packets", packet_size, max_packets);
        self.negotiated = Some(Negotiated {
            packet_size,
            max_packets,
            baud: response.baud,
        });
        Ok(())
    }

    pub(crate) async fn logon(&mut self) -> C12Result<()> {
        let request = Request::logon(self.config.user_id, &self.config.padded_user());
        self.transact(&request).await?;
        Ok(())
    }

    pub(crate) async fn security(&mut self) -> C12Result<()> {
        if self.dialect.capabilities().security_state {
            self.set_state(SessionState::SecurityHandshake)?;
        }
        let request = Request::security(&self.config.padded_password());
        self.transact(&request).await.map_err(|e| match e {
            C12Error::NokResponse { code, .. } if !code.is_retryable() => {
                C12Error::AuthenticationFailed(format!("Security service rejected with {}", code.mnemonic()))
            }
            other => other,
        })?;
        Ok(())
    }

    async fn negotiate_and_logon(&mut self) -> C12Result<()> {
        if self.config.issue_negotiate {
            self.negotiate(true).await?;
        }
        self.logon().await
    }

    async fn start_c1218(&mut self) -> C12Result<()> {
        let initial_baud = self.channel.baud_rate();
        self.identify(false).await?;
        if let Err(e) = self.negotiate_and_logon().await {
            let initial = match initial_baud {
                Some(initial)
                    if self.config.issue_negotiate
                        && self.config.session_baud != 0
                        && self.config.session_baud != initial
                        && retries_at_initial_baud(&e) =>
                {
                    initial
                }
                _ => return Err(e),
            };
            log::warn!("{} at {} baud, retrying the session start at {} baud", e, self.config.session_baud, initial);
            self.channel.sleep(BAUD_FALLBACK_DELAY).await?;
            self.channel.set_baud_rate(initial).await?;
            self.negotiated = None;
            self.state = SessionState::Identifying;
            self.identify(false).await?;
            self.negotiate_and_logon().await?;
        }
        if self.config.issue_security {
            self.security().await?;
        }
        self.set_state(SessionState::SessionActive)
    }

    async fn start_c1222(&mut self) -> C12Result<()> {
        let link = self.apdu_link()?;
        link.begin_session();
        let sessionless = link.options().sessionless;
        if !sessionless {
            let idle_timeout = self.config.c1222.session_idle_timeout;
            let request = Request::logon_with_idle_timeout(self.config.user_id, &self.config.padded_user(), idle_timeout);
            let parameters = self.transact(&request).await?;
            if let Some(granted) = logon_response(&mut Reader::new(&parameters))? {
                log::debug!("Session idle timeout {} seconds, requested {}", granted, idle_timeout);
            }
        }
        self.apdu_link()?.after_logon();
        if self.config.issue_security && !sessionless {
            self.security().await?;
        } else {
            self.set_state(SessionState::SecurityHandshake)?;
        }
        self.set_state(SessionState::SessionActive)
    }

    /// Bring the session from `Disconnected` to `SessionActive`
    ///
    /// The channel is opened first if needed. Any failure closes it again
    /// and leaves the session `Disconnected`.
    pub async fn start_session(&mut self) -> C12Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(C12Error::InvalidState(format!(
                "Session is {}, cannot start",
                self.state.as_str()
            )));
        }
        let result = async {
            if !self.channel.is_connected() {
                self.channel.open().await?;
            }
            self.set_state(SessionState::Identifying)?;
            match self.dialect {
                Dialect::C1218 => self.start_c1218().await,
                Dialect::C1221 => self.start_c1221().await,
                Dialect::C1222 => self.start_c1222().await,
            }
        }
        .await;
        if let Err(e) = &result {
            log::debug!("{} session start failed: {}", self.dialect, e);
            self.shutdown().await;
        }
        result
    }

    async fn send_goodbye(&mut self) -> C12Result<()> {
        match self.dialect {
            Dialect::C1222 => {
                let options = &self.config.c1222;
                if options.sessionless {
                    return Ok(());
                }
                if options.issue_terminate {
                    self.transact(&Request::terminate()).await?;
                } else if self.config.issue_logoff {
                    self.transact(&Request::logoff()).await?;
                }
            }
            Dialect::C1218 | Dialect::C1221 => {
                if self.config.issue_logoff {
                    self.transact(&Request::logoff()).await?;
                }
                self.transact(&Request::terminate()).await?;
            }
        }
        Ok(())
    }

    /// Close the channel and wipe session keys, errors are only logged
    pub(crate) async fn shutdown(&mut self) {
        if let Wire::Apdu(link) = &mut self.wire {
            link.end_session();
        }
        if let Some(key) = self.authentication_key.as_mut() {
            key.clear();
        }
        self.state = SessionState::Disconnected;
        if let Err(e) = self.channel.close().await {
            log::debug!("Ignoring error while closing the channel: {}", e);
        }
    }

    /// Log off and terminate on a best effort basis, then close the channel
    pub async fn end_session(&mut self) {
        if self.state.is_active() {
            self.state = SessionState::Terminating;
            if let Err(e) = self.send_goodbye().await {
                log::debug!("Ignoring error while ending the session: {}", e);
            }
        }
        self.shutdown().await;
    }

    /// Bound the next operation by `timeout`, enforced at the channel's
    /// reads and sleeps
    pub(crate) fn begin_deadline(&mut self, timeout: Duration) {
        self.channel.set_operation_deadline(Some(Instant::now() + timeout));
    }

    pub(crate) fn end_deadline(&mut self) {
        self.channel.set_operation_deadline(None);
    }

    /// Apply the disposition of a failed operation
    ///
    /// A failure under an expired caller deadline is reported as a read
    /// timeout that keeps the session.
    pub(crate) async fn settle<T>(&mut self, result: C12Result<T>) -> C12Result<T> {
        let result = match result {
            Err(e) if self.channel.operation_deadline_expired() && !ends_the_channel(&e) => {
                log::debug!("Operation deadline expired with {}", e);
                self.abandon_exchange();
                Err(C12Error::ChannelReadTimeout { bytes_read: 0 })
            }
            other => other,
        };
        if let Err(e) = &result {
            if e.disposition() == FailureDisposition::Disconnect && self.state != SessionState::Disconnected {
                log::warn!("{} session ends after {}", self.dialect, e);
                self.shutdown().await;
            }
        }
        result
    }

    /// A caller deadline expired in the middle of an exchange
    ///
    /// Whatever the meter still sends belongs to the abandoned request, so
    /// the next response toggle bit cannot be trusted.
    pub(crate) fn abandon_exchange(&mut self) {
        if let Wire::Packet(link) = &mut self.wire {
            link.forget_receive_toggle();
        }
    }

    pub fn max_read_size(&self) -> usize {
        match &self.wire {
            Wire::Packet(link) => link.limits().max_read_size,
            Wire::Apdu(link) => link.max_response_size().saturating_sub(READ_SERVICE_OVERHEAD),
        }
    }

    fn max_write_sizes(&self) -> (usize, usize) {
        match &self.wire {
            Wire::Packet(link) => {
                let limits = link.limits();
                (limits.max_write_size, limits.max_partial_write_size)
            }
            Wire::Apdu(link) => {
                let size = link.max_request_size();
                (
                    size.saturating_sub(WRITE_SERVICE_OVERHEAD),
                    size.saturating_sub(PARTIAL_WRITE_SERVICE_OVERHEAD),
                )
            }
        }
    }

    /// Read `count` bytes from `offset` in partial reads of at most `limit`
    async fn read_in_chunks(
        &mut self,
        number: u16,
        offset: u32,
        count: usize,
        limit: usize,
        partial: bool,
    ) -> C12Result<TableRawData> {
        let mut tracker = ProgressTracker::new(self.progress.clone(), count);
        let mut data = Vec::with_capacity(count);
        let mut checksum_valid = true;
        while data.len() < count {
            let position = offset + data.len() as u32;
            let size = (count - data.len()).min(limit);
            let request = Request::read_partial(number, position, size as u16)?;
            let parameters = self.transact_with_progress(&request, &mut tracker).await?;
            let chunk = read_table_response(&mut Reader::new(&parameters), number, Some(position))?;
            checksum_valid &= chunk.checksum_valid;
            tracker.finish_chunk(chunk.data.len());
            let short = chunk.data.len() < size;
            data.extend_from_slice(&chunk.data);
            if short {
                if partial {
                    return Err(C12Error::PartialData {
                        declared: count,
                        actual: data.len(),
                    });
                }
                log::debug!("Table {} ended after {} bytes", number, data.len());
                break;
            }
        }
        tracker.complete();
        Ok(TableRawData {
            number,
            offset: partial.then_some(offset),
            declared_length: data.len(),
            data,
            checksum_valid,
        })
    }

    async fn read_table_inner(&mut self, descriptor: &TableDescriptor) -> C12Result<TableRawData> {
        descriptor.validate()?;
        self.ensure_active()?;
        let number = descriptor.wire_number();
        let limit = self.max_read_size();
        match descriptor.access {
            TableAccess::Full => match descriptor.expected_size {
                Some(size) if size as usize > limit => self.read_in_chunks(number, 0, size as usize, limit, false).await,
                expected => {
                    let mut tracker =
                        ProgressTracker::new(self.progress.clone(), expected.unwrap_or(0) as usize);
                    let parameters = self
                        .transact_with_progress(&Request::read_full(number), &mut tracker)
                        .await?;
                    let table = read_table_response(&mut Reader::new(&parameters), number, None)?;
                    tracker.complete();
                    Ok(table)
                }
            },
            TableAccess::Partial { offset, count } if count as usize > limit => {
                self.read_in_chunks(number, offset, count as usize, limit, true).await
            }
            TableAccess::Partial { offset, count } => {
                let mut tracker = ProgressTracker::new(self.progress.clone(), count as usize);
                let request = Request::read_partial(number, offset, count as u16)?;
                let parameters = self.transact_with_progress(&request, &mut tracker).await?;
                let table = read_table_response(&mut Reader::new(&parameters), number, Some(offset))?;
                tracker.complete();
                Ok(table)
            }
        }
    }

    /// Read a table, splitting it into partial reads that fit the link
    pub async fn read_table(&mut self, descriptor: &TableDescriptor) -> C12Result<TableRawData> {
        let result = self.read_table_inner(descriptor).await;
        self.settle(result).await
    }

    async fn write_in_chunks(&mut self, number: u16, offset: u32, data: &[u8], limit: usize) -> C12Result<()> {
        if limit == 0 {
            return Err(C12Error::InvalidState("Link cannot carry table data".to_string()));
        }
        let mut tracker = ProgressTracker::new(self.progress.clone(), data.len());
        let mut position = offset;
        for chunk in data.chunks(limit) {
            let request = Request::write_partial(number, position, chunk)?;
            self.transact(&request).await?;
            position += chunk.len() as u32;
            tracker.finish_chunk(chunk.len());
            tracker.report(0);
        }
        tracker.complete();
        Ok(())
    }

    async fn write_table_inner(&mut self, descriptor: &TableDescriptor, data: &[u8]) -> C12Result<()> {
        descriptor.validate_write(data)?;
        self.ensure_active()?;
        let number = descriptor.wire_number();
        let (max_write, max_partial_write) = self.max_write_sizes();
        match descriptor.access {
            TableAccess::Full if data.len() <= max_write => {
                self.transact(&Request::write_full(number, data)?).await?;
            }
            TableAccess::Full => self.write_in_chunks(number, 0, data, max_partial_write).await?,
            TableAccess::Partial { offset, .. } if data.len() <= max_partial_write => {
                self.transact(&Request::write_partial(number, offset, data)?).await?;
            }
            TableAccess::Partial { offset, .. } => {
                self.write_in_chunks(number, offset, data, max_partial_write).await?
            }
        }
        Ok(())
    }

    /// Write a table, splitting it into partial writes that fit the link
    pub async fn write_table(&mut self, descriptor: &TableDescriptor, data: &[u8]) -> C12Result<()> {
        let result = self.write_table_inner(descriptor, data).await;
        self.settle(result).await
    }

    async fn execute_procedure_inner(&mut self, number: u16, parameters: &[u8]) -> C12Result<Vec<u8>> {
        self.ensure_active()?;
        let sequence = self.procedure_sequence;
        self.procedure_sequence = self.procedure_sequence.wrapping_add(1);
        let request = ProcedureRequest::new(number, sequence, parameters).encode(self.config.procedure_number_little_endian);
        self.write_table_inner(&TableDescriptor::full(PROCEDURE_REQUEST_TABLE as u32), &request)
            .await?;

        let mut retries = self.config.procedure_retries;
        loop {
            let table = self
                .read_table_inner(&TableDescriptor::full(PROCEDURE_RESPONSE_TABLE as u32))
                .await?;
            let response = ProcedureResponse::decode(&table.data)?;
            if response.number != [request[0], request[1]] || response.sequence != sequence {
                return Err(C12Error::Protocol(format!(
                    "Procedure response {:02X}{:02X} sequence {} does not answer procedure {} sequence {}",
                    response.number[0], response.number[1], response.sequence, number, sequence
                )));
            }
            match response.into_data() {
                Err(e) if retries > 0 && e.is_retryable() => {
                    retries -= 1;
                    log::debug!("Procedure {} not completed yet, reading the result again", number);
                    self.channel.sleep(self.config.procedure_retry_delay).await?;
                }
                other => return other,
            }
        }
    }

    /// Run a procedure through tables 7 and 8, returning its response data
    pub async fn execute_procedure(&mut self, number: u16, parameters: &[u8]) -> C12Result<Vec<u8>> {
        let result = self.execute_procedure_inner(number, parameters).await;
        self.settle(result).await
    }

    /// Ask the meter to keep the session open for `seconds`
    pub async fn wait(&mut self, seconds: u32) -> C12Result<()> {
        let result = async {
            let request = Request::wait(seconds)?;
            self.ensure_active()?;
            self.transact(&request).await.map(|_| ())
        }
        .await;
        self.settle(result).await
    }
}
