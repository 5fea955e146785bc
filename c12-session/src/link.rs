//! C12.18/C12.21 data-link layer
//!
//! Sends application layer messages as packets, each acknowledged by the
//! meter, and reassembles responses, acknowledging every good packet.
//!
//! # Recovery
//!
//! * NAK or silence after a transmitted packet: the packet is sent again,
//!   up to the link layer retry count
//! * bad length or CRC in a received packet: NAK, then wait for the packet
//!   to be repeated
//! * duplicate packet (same toggle bit and CRC as the last accepted one):
//!   ACK and ignore
//! * packet out of sequence in a multi-packet response: receive the rest,
//!   then repeat the whole request

use crate::crc::crc16;
use crate::packet::{ACK, NAK, PACKET_HEADER_SIZE, PACKET_OVERHEAD, Packet, STP, split_into_packets};
use c12_core::config::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use c12_core::{C12Error, C12Result, ProtocolConfig};
use c12_transport::Channel;
use std::time::Duration;

/// Largest pause after a packet with a bad length
const MAXIMUM_BAD_PACKET_LENGTH_SLEEP: Duration = Duration::from_millis(1000);

/// Largest pause after a toggle bit failure before the request is repeated
const MAXIMUM_BAD_TOGGLE_BIT_SLEEP: Duration = Duration::from_millis(1500);

/// Response status, table count and checksum around read data
pub const READ_SERVICE_OVERHEAD: usize = 4;
/// Command, table id, count and checksum around full write data
pub const WRITE_SERVICE_OVERHEAD: usize = 7;
/// Command, table id, offset, count and checksum around partial write data
pub const PARTIAL_WRITE_SERVICE_OVERHEAD: usize = 9;

/// Link parameters, as configured or as negotiated with the meter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParameters {
    pub identity: u8,
    pub data_format: u8,
    pub packet_size: u16,
    pub max_packets: u8,
    pub acknowledgement_timeout: Duration,
    pub intercharacter_timeout: Duration,
    pub channel_traffic_timeout: Duration,
    pub turnaround_delay: Duration,
    pub retries: u8,
}

impl LinkParameters {
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self {
            identity: config.identity,
            data_format: config.data_format,
            packet_size: config.packet_size,
            max_packets: config.max_packets,
            acknowledgement_timeout: config.acknowledgement_timeout,
            intercharacter_timeout: config.intercharacter_timeout,
            channel_traffic_timeout: config.channel_traffic_timeout,
            turnaround_delay: config.turnaround_delay,
            retries: config.link_layer_retries,
        }
    }
}

impl Default for LinkParameters {
    fn default() -> Self {
        Self::from_config(&ProtocolConfig::default())
    }
}

/// Largest table transfers that fit one request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLimits {
    pub max_read_size: usize,
    pub max_write_size: usize,
    pub max_partial_write_size: usize,
}

impl LinkLimits {
    pub fn new(packet_size: u16, max_packets: u8) -> Self {
        let capacity = (packet_size as usize).saturating_sub(PACKET_OVERHEAD) * max_packets as usize;
        let limit = |overhead: usize| capacity.saturating_sub(overhead).min(u16::MAX as usize);
        Self {
            max_read_size: limit(READ_SERVICE_OVERHEAD),
            max_write_size: limit(WRITE_SERVICE_OVERHEAD),
            max_partial_write_size: limit(PARTIAL_WRITE_SERVICE_OVERHEAD),
        }
    }
}

/// Link layer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub retransmissions: u64,
    pub crc_errors: u64,
    pub length_errors: u64,
    pub duplicates: u64,
    pub sequence_errors: u64,
}

impl LinkStatistics {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of receiving one application layer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Vec<u8>),
    /// The response got out of sequence, the request has to be sent again
    RetryRequest,
}

/// Errors after which the same packet may be tried again
fn is_link_retryable(error: &C12Error) -> bool {
    matches!(
        error,
        C12Error::ChannelReadTimeout { .. }
            | C12Error::ChannelWriteTimeout { .. }
            | C12Error::FrameInvalid(_)
            | C12Error::Protocol(_)
    )
}

/// Packet link state of one session
#[derive(Debug)]
pub struct LinkLayer {
    params: LinkParameters,
    negotiated_packet_size: u16,
    negotiated_max_packets: u8,
    next_toggle: bool,
    /// Toggle bit and CRC of the last accepted packet
    last_received: Option<(bool, u16)>,
    incoming_identity: u8,
    statistics: LinkStatistics,
}

impl LinkLayer {
    pub fn new(params: LinkParameters) -> Self {
        Self {
            negotiated_packet_size: params.packet_size,
            negotiated_max_packets: params.max_packets,
            params,
            next_toggle: false,
            last_received: None,
            incoming_identity: 0,
            statistics: LinkStatistics::default(),
        }
    }

    pub fn parameters(&self) -> &LinkParameters {
        &self.params
    }

    pub fn parameters_mut(&mut self) -> &mut LinkParameters {
        &mut self.params
    }

    pub fn negotiated_packet_size(&self) -> u16 {
        self.negotiated_packet_size
    }

    pub fn negotiated_max_packets(&self) -> u8 {
        self.negotiated_max_packets
    }

    pub fn incoming_identity(&self) -> u8 {
        self.incoming_identity
    }

    pub fn statistics(&self) -> &LinkStatistics {
        &self.statistics
    }

    pub fn limits(&self) -> LinkLimits {
        LinkLimits::new(self.negotiated_packet_size, self.negotiated_max_packets)
    }

    /// Back to the configured parameters, toggle bits unknown
    pub fn reset(&mut self) {
        self.negotiated_packet_size = self.params.packet_size;
        self.negotiated_max_packets = self.params.max_packets;
        self.next_toggle = false;
        self.last_received = None;
    }

    /// Forget the toggle bit of the meter, done before identify
    pub fn forget_receive_toggle(&mut self) {
        self.last_received = None;
    }

    /// Adopt the packet size and count returned by negotiate
    ///
    /// A meter may only lower the requested values; a larger offer falls
    /// back to the requested one. Nothing is applied when the result is
    /// below the smallest packet size or the meter offers no packets.
    ///
    /// # Errors
    ///
    /// `NumberOutOfRange` for a packet size under 32 bytes or a packet
    /// count of zero.
    pub fn apply_negotiated(&mut self, packet_size: u16, max_packets: u8) -> C12Result<u16> {
        let requested = self.params.packet_size;
        let size = requested.min(packet_size);
        if size < MIN_PACKET_SIZE {
            return Err(C12Error::NumberOutOfRange {
                what: "negotiated packet size",
                value: size as u64,
                min: MIN_PACKET_SIZE as u64,
                max: requested.min(MAX_PACKET_SIZE) as u64,
            });
        }
        if max_packets == 0 {
            return Err(C12Error::NumberOutOfRange {
                what: "negotiated number of packets",
                value: 0,
                min: 1,
                max: self.params.max_packets as u64,
            });
        }
        if size != packet_size {
            log::warn!(
                "Meter offered packet size {}, requested {}, using {}",
                packet_size,
                requested,
                size
            );
        }
        let packets = max_packets.min(self.params.max_packets.max(1));
        if packets != max_packets {
            log::warn!(
                "Meter offered {} packets, requested {}, using {}",
                max_packets,
                self.params.max_packets,
                packets
            );
        }
        self.negotiated_packet_size = size;
        self.negotiated_max_packets = packets;
        Ok(size)
    }

    /// Adopt the timing values returned by the C12.21 timing setup
    pub fn apply_timing(
        &mut self,
        channel_traffic_timeout: Duration,
        intercharacter_timeout: Duration,
        acknowledgement_timeout: Duration,
        retries: u8,
    ) {
        self.params.channel_traffic_timeout = channel_traffic_timeout;
        self.params.intercharacter_timeout = intercharacter_timeout;
        self.params.acknowledgement_timeout = acknowledgement_timeout;
        self.params.retries = retries;
    }

    async fn write_control(&self, channel: &mut Channel, byte: u8) -> C12Result<()> {
        channel.write(&[byte], self.params.acknowledgement_timeout).await?;
        Ok(())
    }

    /// Read and drop a packet that arrived while an ACK was expected
    async fn skip_stray_packet(&self, channel: &mut Channel) -> C12Result<()> {
        let result = async {
            let header = channel.read_exact(PACKET_HEADER_SIZE - 1, self.params.intercharacter_timeout).await?;
            let length = u16::from_be_bytes([header[3], header[4]]) as usize;
            if length <= (self.negotiated_packet_size as usize).saturating_sub(PACKET_OVERHEAD) {
                channel.read_exact(length + 2, self.params.intercharacter_timeout).await?;
            }
            Ok(())
        }
        .await;
        match result {
            Err(e @ (C12Error::OperationCancelled | C12Error::ChannelDisconnectedUnexpectedly)) => Err(e),
            _ => Ok(()),
        }
    }

    async fn send_packet(&mut self, channel: &mut Channel, bytes: &[u8]) -> C12Result<()> {
        channel.sleep(self.params.turnaround_delay).await?;
        channel.write(bytes, self.params.channel_traffic_timeout).await?;
        self.statistics.packets_sent += 1;

        let mut stray_packets = self.params.retries;
        loop {
            match channel
                .read_start_char(&[ACK, NAK, STP], self.params.acknowledgement_timeout)
                .await?
            {
                ACK => return Ok(()),
                NAK => {
                    channel.clear_input().await?;
                    return Err(C12Error::Protocol(format!(
                        "Expected character 0x{:02X}, received 0x{:02X}",
                        ACK, NAK
                    )));
                }
                _ => {
                    if stray_packets == 0 {
                        return Err(C12Error::Protocol(format!(
                            "Expected character 0x{:02X}, received 0x{:02X}",
                            ACK, STP
                        )));
                    }
                    stray_packets -= 1;
                    log::debug!("Received packet when the acknowledgement is expected");
                    self.skip_stray_packet(channel).await?;
                    channel.sleep(self.params.turnaround_delay).await?;
                    self.write_control(channel, ACK).await?;
                }
            }
        }
    }

    /// Send one application layer message, waiting for ACK of each packet
    pub async fn send_message(&mut self, channel: &mut Channel, message: &[u8]) -> C12Result<()> {
        let packets = split_into_packets(
            self.params.identity,
            self.params.data_format,
            message,
            self.negotiated_packet_size as usize,
        )?;
        for mut packet in packets {
            packet.control.set_toggle(self.next_toggle);
            let bytes = packet.encode()?;
            let mut retries = self.params.retries;
            loop {
                match self.send_packet(channel, &bytes).await {
                    Ok(()) => break,
                    Err(e) if retries > 0 && is_link_retryable(&e) && !channel.operation_deadline_expired() => {
                        retries -= 1;
                        self.statistics.retransmissions += 1;
                        log::debug!("Retrying packet after {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.next_toggle = !self.next_toggle;
        }
        Ok(())
    }

    /// Read one packet, CRC checked unless `accept_bad_crc`
    async fn receive_packet(&mut self, channel: &mut Channel, accept_bad_crc: bool) -> C12Result<(Packet, u16)> {
        let timeout = self.params.intercharacter_timeout;
        channel
            .read_start_char(&[STP], self.params.acknowledgement_timeout)
            .await?;
        let header = channel.read_exact(PACKET_HEADER_SIZE - 1, timeout).await?;
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        if length == 0 || length > (self.negotiated_packet_size as usize).saturating_sub(PACKET_OVERHEAD) {
            self.statistics.length_errors += 1;
            channel
                .sleep(self.params.acknowledgement_timeout.min(MAXIMUM_BAD_PACKET_LENGTH_SLEEP))
                .await?;
            channel.clear_input().await?;
            return Err(C12Error::FrameInvalid(format!(
                "Inbound packet data length {} is bad",
                length
            )));
        }
        let rest = channel.read_exact(length + 2, timeout).await?;

        let mut bytes = Vec::with_capacity(length + PACKET_OVERHEAD);
        bytes.push(STP);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&rest);
        let body_end = length + PACKET_HEADER_SIZE;
        let crc = u16::from_le_bytes([bytes[body_end], bytes[body_end + 1]]);
        if crc != crc16(&bytes[..body_end]) && !accept_bad_crc {
            self.statistics.crc_errors += 1;
            log::warn!("CRC check failed, packet dropped");
            return Err(C12Error::FrameInvalid("CRC check failed".to_string()));
        }
        let packet = Packet::new(
            bytes[1],
            crate::packet::Control::from_byte(bytes[2]),
            bytes[3],
            bytes[PACKET_HEADER_SIZE..body_end].to_vec(),
        );
        channel.sleep(self.params.turnaround_delay).await?;
        Ok((packet, crc))
    }

    /// Receive one application layer message
    ///
    /// `progress` is called with the number of bytes assembled so far after
    /// every accepted packet.
    ///
    /// # Errors
    ///
    /// `PartialData` when the meter falls silent after part of a
    /// multi-packet message was accepted.
    pub async fn receive_message(
        &mut self,
        channel: &mut Channel,
        progress: &mut (dyn FnMut(usize) + Send),
    ) -> C12Result<Received> {
        let mut message = Vec::new();
        let mut retry_request = false;
        let mut previous_sequence: Option<u8> = None;
        // estimated from the first packet: packets to come times its size
        let mut declared: Option<usize> = None;
        loop {
            let mut retries = self.params.retries;
            let mut retry_request_at_timeout = false;
            let (packet, crc) = loop {
                match self.receive_packet(channel, retry_request).await {
                    Ok((packet, crc)) => {
                        if !retry_request {
                            if let Some((toggle, last_crc)) = self.last_received {
                                if toggle == packet.control.toggle() {
                                    if last_crc == crc {
                                        self.statistics.duplicates += 1;
                                        log::debug!("Duplicate packet acknowledged and ignored");
                                        self.write_control(channel, ACK).await?;
                                        if retries == 0 {
                                            return Err(C12Error::Protocol(
                                                "Received packet toggle bit failure".to_string(),
                                            ));
                                        }
                                        retries -= 1;
                                        retry_request_at_timeout = !packet.control.is_multi_packet();
                                        continue;
                                    }
                                    self.last_received = None;
                                    retry_request = true;
                                    self.statistics.sequence_errors += 1;
                                    log::debug!("Packet is bad or out of sequence, the request will be repeated");
                                }
                            }
                        }
                        break (packet, crc);
                    }
                    Err(e) => {
                        if channel.operation_deadline_expired() {
                            return Err(e);
                        }
                        if retry_request_at_timeout {
                            // the response to our request was lost, repeat it with the same toggle bit
                            self.next_toggle = !self.next_toggle;
                            return Ok(Received::RetryRequest);
                        }
                        if retries == 0 && retry_request {
                            return Ok(Received::RetryRequest);
                        }
                        if !is_link_retryable(&e) {
                            return Err(e);
                        }
                        channel.sleep(self.params.turnaround_delay).await?;
                        if channel.is_connected() {
                            self.write_control(channel, NAK).await?;
                        }
                        if retries == 0 {
                            return Err(match (declared, e) {
                                (Some(declared), C12Error::ChannelReadTimeout { .. }) if !retry_request => {
                                    log::debug!("Meter stopped after {} bytes of about {}", message.len(), declared);
                                    C12Error::PartialData {
                                        declared,
                                        actual: message.len(),
                                    }
                                }
                                (_, e) => e,
                            });
                        }
                        retries -= 1;
                        log::debug!("Waiting for the packet again after {}", e);
                    }
                }
            };

            self.statistics.packets_received += 1;
            self.incoming_identity = packet.identity;
            self.write_control(channel, ACK).await?;

            let multi = packet.control.is_multi_packet();
            let sequence = packet.sequence;
            if !retry_request {
                let lost = if multi && !packet.control.is_first_packet() {
                    previous_sequence.is_none_or(|previous| previous.wrapping_sub(1) != sequence)
                } else {
                    previous_sequence.is_some()
                };
                if lost {
                    self.last_received = None;
                    retry_request = true;
                    self.statistics.sequence_errors += 1;
                    log::debug!("Packet sequence {} lost, the request will be repeated", sequence);
                } else {
                    if multi && packet.control.is_first_packet() {
                        declared = Some((sequence as usize + 1) * packet.data.len());
                    }
                    message.extend_from_slice(&packet.data);
                    progress(message.len());
                    self.last_received = Some((packet.control.toggle(), crc));
                    previous_sequence = Some(sequence);
                }
            }
            if !multi || sequence == 0 {
                break;
            }
        }
        if retry_request {
            Ok(Received::RetryRequest)
        } else {
            Ok(Received::Message(message))
        }
    }

    /// Send a request and receive its response
    ///
    /// A response that got out of sequence makes the whole request repeat,
    /// up to the link layer retry count.
    pub async fn request(
        &mut self,
        channel: &mut Channel,
        request: &[u8],
        progress: &mut (dyn FnMut(usize) + Send),
    ) -> C12Result<Vec<u8>> {
        let mut retries = self.params.retries;
        loop {
            self.send_message(channel, request).await?;
            match self.receive_message(channel, progress).await? {
                Received::Message(message) => return Ok(message),
                Received::RetryRequest => {
                    if retries == 0 {
                        return Err(C12Error::Protocol(
                            "Link layer retries expired with received packet toggle bit failure".to_string(),
                        ));
                    }
                    retries -= 1;
                    self.last_received = None;
                    channel
                        .sleep(self.params.acknowledgement_timeout.min(MAXIMUM_BAD_TOGGLE_BIT_SLEEP))
                        .await?;
                }
            }
        }
    }

    /// Like [`request`](Self::request), for responses with a known minimum
    /// length
    ///
    /// At session start the toggle bit of the meter is unknown, so a short
    /// successful response is taken as a leftover of a previous session and
    /// the real one is awaited.
    pub async fn request_with_minimum(
        &mut self,
        channel: &mut Channel,
        request: &[u8],
        minimum: usize,
    ) -> C12Result<Vec<u8>> {
        let mut message = self.request(channel, request, &mut |_| {}).await?;
        let mut retries = self.params.retries;
        while message.len() < minimum && message.first() == Some(&0) {
            if retries == 0 {
                return Err(C12Error::Protocol(
                    "Packet was likely produced by a previous session".to_string(),
                ));
            }
            retries -= 1;
            log::debug!("Response of {} bytes is from a previous session", message.len());
            self.last_received = None;
            message = match self.receive_message(channel, &mut |_| {}).await? {
                Received::Message(message) => message,
                Received::RetryRequest => Vec::new(),
            };
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Control;
    use c12_core::FailureDisposition;
    use c12_transport::MemoryTransport;

    async fn connected_pair() -> (Channel, Channel) {
        let (a, b) = MemoryTransport::pair();
        let mut client = Channel::new(Box::new(a));
        let mut meter = Channel::new(Box::new(b));
        client.open().await.unwrap();
        meter.open().await.unwrap();
        (client, meter)
    }

    fn params() -> LinkParameters {
        LinkParameters {
            packet_size: 64,
            turnaround_delay: Duration::ZERO,
            ..LinkParameters::default()
        }
    }

    async fn meter_read_packet(meter: &mut Channel) -> Packet {
        meter.read_start_char(&[STP], Duration::from_secs(10)).await.unwrap();
        let header = meter.read_exact(5, Duration::from_secs(1)).await.unwrap();
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        let rest = meter.read_exact(length + 2, Duration::from_secs(1)).await.unwrap();
        let mut bytes = vec![STP];
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&rest);
        Packet::decode(&bytes).unwrap()
    }

    async fn meter_expect(meter: &mut Channel, byte: u8) {
        let got = meter.read_exact(1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(got, vec![byte]);
    }

    async fn meter_send(meter: &mut Channel, packet: &Packet) {
        meter
            .write(&packet.encode().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    fn response(data: &[u8], toggle: bool) -> Packet {
        Packet::new(0, Control::default().with_toggle(toggle), 0, data.to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_packet_transaction() {
        let (mut client, mut meter) = connected_pair().await;
        let far_end = tokio::spawn(async move {
            let request = meter_read_packet(&mut meter).await;
            assert_eq!(request.data, vec![0x20]);
            assert!(!request.control.toggle());
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            meter_send(&mut meter, &response(&[0x00, 0x00, 0x01, 0x00, 0x00], false)).await;
            meter_expect(&mut meter, ACK).await;
        });

        let mut link = LinkLayer::new(params());
        let reply = link.request(&mut client, &[0x20], &mut |_| {}).await.unwrap();
        assert_eq!(reply, vec![0x00, 0x00, 0x01, 0x00, 0x00]);
        far_end.await.unwrap();
        assert_eq!(link.statistics().packets_sent, 1);
        assert_eq!(link.statistics().packets_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_causes_retransmission() {
        let (mut client, mut meter) = connected_pair().await;
        let far_end = tokio::spawn(async move {
            let first = meter_read_packet(&mut meter).await;
            meter.write(&[NAK], Duration::from_secs(1)).await.unwrap();
            let second = meter_read_packet(&mut meter).await;
            assert_eq!(first, second);
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            meter_send(&mut meter, &response(&[0x00], false)).await;
            meter_expect(&mut meter, ACK).await;
        });

        let mut link = LinkLayer::new(params());
        link.request(&mut client, &[0x52], &mut |_| {}).await.unwrap();
        far_end.await.unwrap();
        assert_eq!(link.statistics().retransmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_crc_is_nakked_and_dropped() {
        let (mut client, mut meter) = connected_pair().await;
        let far_end = tokio::spawn(async move {
            meter_read_packet(&mut meter).await;
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            let mut corrupted = response(&[0x00, 0x11], false).encode().unwrap();
            corrupted[7] ^= 0x01;
            meter.write(&corrupted, Duration::from_secs(1)).await.unwrap();
            meter_expect(&mut meter, NAK).await;
            meter_send(&mut meter, &response(&[0x00, 0x11], false)).await;
            meter_expect(&mut meter, ACK).await;
        });

        let mut link = LinkLayer::new(params());
        let reply = link.request(&mut client, &[0x30, 0x00, 0x00], &mut |_| {}).await.unwrap();
        assert_eq!(reply, vec![0x00, 0x11]);
        far_end.await.unwrap();
        assert_eq!(link.statistics().crc_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_packet_response_reassembled_with_progress() {
        let (mut client, mut meter) = connected_pair().await;
        let payload: Vec<u8> = (0..120u8).collect();
        let expected = payload.clone();
        let far_end = tokio::spawn(async move {
            meter_read_packet(&mut meter).await;
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            let packets = split_into_packets(0, 0, &payload, 64).unwrap();
            assert_eq!(packets.len(), 3);
            for (index, mut packet) in packets.into_iter().enumerate() {
                packet.control.set_toggle(index % 2 == 1);
                meter_send(&mut meter, &packet).await;
                meter_expect(&mut meter, ACK).await;
            }
        });

        let mut link = LinkLayer::new(params());
        let mut seen = Vec::new();
        let reply = link
            .request(&mut client, &[0x30, 0x00, 0x01], &mut |n| seen.push(n))
            .await
            .unwrap();
        assert_eq!(reply, expected);
        assert_eq!(seen, vec![56, 112, 120]);
        far_end.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_packet_is_ignored() {
        let (mut client, mut meter) = connected_pair().await;
        let far_end = tokio::spawn(async move {
            meter_read_packet(&mut meter).await;
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            let first = response(&[0x00, 0x01], false);
            meter_send(&mut meter, &first).await;
            meter_expect(&mut meter, ACK).await;

            meter_read_packet(&mut meter).await;
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            // the meter missed our ACK and repeats the old packet first
            meter_send(&mut meter, &first).await;
            meter_expect(&mut meter, ACK).await;
            meter_send(&mut meter, &response(&[0x00, 0x02], true)).await;
            meter_expect(&mut meter, ACK).await;
        });

        let mut link = LinkLayer::new(params());
        assert_eq!(link.request(&mut client, &[0x30, 0, 1], &mut |_| {}).await.unwrap(), vec![0x00, 0x01]);
        assert_eq!(link.request(&mut client, &[0x30, 0, 2], &mut |_| {}).await.unwrap(), vec![0x00, 0x02]);
        far_end.await.unwrap();
        assert_eq!(link.statistics().duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_length_resynchronizes() {
        let (mut client, mut meter) = connected_pair().await;
        let far_end = tokio::spawn(async move {
            meter_read_packet(&mut meter).await;
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            // length 0x7FFF exceeds the packet size
            meter
                .write(&[STP, 0x00, 0x00, 0x00, 0x7F, 0xFF, 0x00], Duration::from_secs(1))
                .await
                .unwrap();
            meter_expect(&mut meter, NAK).await;
            meter_send(&mut meter, &response(&[0x00], false)).await;
            meter_expect(&mut meter, ACK).await;
        });

        let mut link = LinkLayer::new(params());
        assert_eq!(link.request(&mut client, &[0x52], &mut |_| {}).await.unwrap(), vec![0x00]);
        far_end.await.unwrap();
        assert_eq!(link.statistics().length_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_meter_times_out_after_retries() {
        let (mut client, meter) = connected_pair().await;
        let mut link = LinkLayer::new(params());
        let result = link.send_message(&mut client, &[0x20]).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout { .. })));
        assert_eq!(link.statistics().retransmissions, 3);
        drop(meter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_silent_mid_message_reports_partial_data() {
        let (mut client, mut meter) = connected_pair().await;
        let payload: Vec<u8> = (0..120u8).collect();
        let far_end = tokio::spawn(async move {
            meter_read_packet(&mut meter).await;
            meter.write(&[ACK], Duration::from_secs(1)).await.unwrap();
            let packets = split_into_packets(0, 0, &payload, 64).unwrap();
            meter_send(&mut meter, &packets[0]).await;
            meter_expect(&mut meter, ACK).await;
            // packets two and three never come
            meter
        });

        let mut link = LinkLayer::new(params());
        let mut seen = Vec::new();
        let result = link
            .request(&mut client, &[0x30, 0x00, 0x01], &mut |n| seen.push(n))
            .await;
        assert_eq!(seen, vec![56]);
        match result {
            Err(C12Error::PartialData { declared, actual }) => {
                assert_eq!(declared, 168);
                assert_eq!(actual, 56);
            }
            other => panic!("expected partial data, got {:?}", other),
        }
        assert_eq!(C12Error::PartialData { declared: 168, actual: 56 }.disposition(), FailureDisposition::KeepSession);
        drop(far_end.await.unwrap());
    }

    #[test]
    fn test_negotiated_fallback() {
        let mut link = LinkLayer::new(params());
        assert_eq!(link.apply_negotiated(48, 2).unwrap(), 48);
        assert_eq!(link.negotiated_max_packets(), 2);
        // larger than requested is not accepted
        assert_eq!(link.apply_negotiated(128, 1).unwrap(), 64);
        assert_eq!(link.negotiated_packet_size(), 64);
        link.reset();
        assert_eq!(link.negotiated_packet_size(), 64);
    }

    #[test]
    fn test_negotiated_values_out_of_range_rejected() {
        let mut link = LinkLayer::new(params());
        link.apply_negotiated(48, 1).unwrap();
        let result = link.apply_negotiated(16, 1);
        assert!(matches!(
            result,
            Err(C12Error::NumberOutOfRange { value: 16, min, .. }) if min == MIN_PACKET_SIZE as u64
        ));
        let result = link.apply_negotiated(64, 0);
        assert!(matches!(result, Err(C12Error::NumberOutOfRange { value: 0, .. })));
        // a rejected answer leaves the previous agreement in place
        assert_eq!(link.negotiated_packet_size(), 48);
        assert_eq!(link.negotiated_max_packets(), 1);
    }

    #[test]
    fn test_limits() {
        let limits = LinkLimits::new(64, 1);
        assert_eq!(limits.max_read_size, 52);
        assert_eq!(limits.max_write_size, 49);
        assert_eq!(limits.max_partial_write_size, 47);
        assert_eq!(LinkLimits::new(8192, 255).max_read_size, u16::MAX as usize);
    }
}
