//! C12.18/C12.21 data-link packet
//!
//! ```text
//! EE | identity | control | sequence | length (2, BE) | data | CRC (2, LE)
//! ```
//!
//! The sequence number counts the packets still to come, it is zero on the
//! last packet of a message.

use crate::crc::{CrcCalc, crc16};
use c12_core::{C12Error, C12Result, to_hex};
use std::fmt;

/// Packet start byte
pub const STP: u8 = 0xEE;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Bytes before the data: start, identity, control, sequence, length
pub const PACKET_HEADER_SIZE: usize = 6;
/// Header plus CRC
pub const PACKET_OVERHEAD: usize = PACKET_HEADER_SIZE + 2;

/// Control byte of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Control(u8);

impl Control {
    pub const MULTI_PACKET: u8 = 0x80;
    pub const FIRST_PACKET: u8 = 0x40;
    pub const TOGGLE: u8 = 0x20;
    pub const DATA_FORMAT: u8 = 0x03;

    pub fn from_byte(byte: u8) -> Self {
        Control(byte)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }

    pub fn is_multi_packet(&self) -> bool {
        self.0 & Self::MULTI_PACKET != 0
    }

    pub fn is_first_packet(&self) -> bool {
        self.0 & Self::FIRST_PACKET != 0
    }

    pub fn toggle(&self) -> bool {
        self.0 & Self::TOGGLE != 0
    }

    pub fn data_format(&self) -> u8 {
        self.0 & Self::DATA_FORMAT
    }

    pub fn set_toggle(&mut self, toggle: bool) {
        if toggle {
            self.0 |= Self::TOGGLE;
        } else {
            self.0 &= !Self::TOGGLE;
        }
    }

    pub fn with_toggle(mut self, toggle: bool) -> Self {
        self.set_toggle(toggle);
        self
    }
}

/// One data-link packet
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub identity: u8,
    pub control: Control,
    pub sequence: u8,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(identity: u8, control: Control, sequence: u8, data: Vec<u8>) -> Self {
        Self {
            identity,
            control,
            sequence,
            data,
        }
    }

    /// Bytes ready for transmission, CRC included
    pub fn encode(&self) -> C12Result<Vec<u8>> {
        if self.data.len() > u16::MAX as usize {
            return Err(C12Error::NumberOutOfRange {
                what: "packet data length",
                value: self.data.len() as u64,
                min: 0,
                max: u16::MAX as u64,
            });
        }
        let mut bytes = Vec::with_capacity(self.data.len() + PACKET_OVERHEAD);
        bytes.push(STP);
        bytes.push(self.identity);
        bytes.push(self.control.byte());
        bytes.push(self.sequence);
        bytes.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.data);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Parse a complete packet
    ///
    /// # Errors
    ///
    /// `FrameInvalid` when the start byte, the length or the CRC is wrong.
    pub fn decode(bytes: &[u8]) -> C12Result<Self> {
        if bytes.len() < PACKET_OVERHEAD {
            return Err(C12Error::FrameInvalid(format!(
                "Packet too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != STP {
            return Err(C12Error::FrameInvalid(format!(
                "Packet starts with 0x{:02X} instead of 0x{:02X}",
                bytes[0], STP
            )));
        }
        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        if bytes.len() != length + PACKET_OVERHEAD {
            return Err(C12Error::FrameInvalid(format!(
                "Packet length {} does not match {} received bytes",
                length,
                bytes.len()
            )));
        }
        let mut calc = CrcCalc::new();
        calc.update_bytes(bytes);
        calc.validate()?;
        Ok(Self {
            identity: bytes[1],
            control: Control::from_byte(bytes[2]),
            sequence: bytes[3],
            data: bytes[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + length].to_vec(),
        })
    }

    /// CRC as found at the end of the encoded packet
    pub fn crc(&self) -> C12Result<u16> {
        let bytes = self.encode()?;
        Ok(u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]))
    }

    pub fn is_last(&self) -> bool {
        !self.control.is_multi_packet() || self.sequence == 0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("identity", &self.identity)
            .field("control", &format_args!("0x{:02X}", self.control.byte()))
            .field("sequence", &self.sequence)
            .field("data", &to_hex(&self.data))
            .finish()
    }
}

/// Split an application layer message into packets of `packet_size`
/// bytes at most, CRC and header included
///
/// Toggle bits are left clear, the link layer sets them at transmission.
pub fn split_into_packets(
    identity: u8,
    data_format: u8,
    message: &[u8],
    packet_size: usize,
) -> C12Result<Vec<Packet>> {
    if packet_size <= PACKET_OVERHEAD {
        return Err(C12Error::NumberOutOfRange {
            what: "packet size",
            value: packet_size as u64,
            min: PACKET_OVERHEAD as u64 + 1,
            max: u16::MAX as u64,
        });
    }
    let chunk_size = packet_size - PACKET_OVERHEAD;
    let chunks: Vec<&[u8]> = if message.is_empty() {
        vec![message]
    } else {
        message.chunks(chunk_size).collect()
    };
    if chunks.len() > 256 {
        return Err(C12Error::NumberOutOfRange {
            what: "number of packets",
            value: chunks.len() as u64,
            min: 1,
            max: 256,
        });
    }
    let multi = chunks.len() > 1;
    let count = chunks.len();
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let control = if !multi {
                data_format & Control::DATA_FORMAT
            } else if index == 0 {
                Control::MULTI_PACKET | Control::FIRST_PACKET
            } else {
                Control::MULTI_PACKET
            };
            Packet::new(
                identity,
                Control::from_byte(control),
                (count - 1 - index) as u8,
                chunk.to_vec(),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_packet_bytes() {
        let packet = Packet::new(0, Control::default(), 0, vec![0x20]);
        assert_eq!(
            packet.encode().unwrap(),
            vec![0xEE, 0x00, 0x00, 0x00, 0x00, 0x01, 0x20, 0x13, 0x10]
        );
    }

    #[test]
    fn test_decode_encoded() {
        let packet = Packet::new(3, Control::from_byte(0xC0).with_toggle(true), 2, vec![1, 2, 3, 4]);
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.control.toggle());
        assert!(decoded.control.is_first_packet());
        assert!(!decoded.is_last());
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let bytes = Packet::new(0, Control::default(), 0, vec![0x00, 0x00, 0x08, 0x01])
            .encode()
            .unwrap();
        for position in 1..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[position] ^= 1 << bit;
                assert!(
                    Packet::decode(&corrupted).is_err(),
                    "flip of bit {} in byte {} accepted",
                    bit,
                    position
                );
            }
        }
    }

    #[test]
    fn test_split_multi_packet() {
        let message: Vec<u8> = (0..100u8).collect();
        let packets = split_into_packets(0, 0, &message, 48).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].control.byte(), 0xC0);
        assert_eq!(packets[1].control.byte(), 0x80);
        assert_eq!(
            packets.iter().map(|p| p.sequence).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );
        assert_eq!(packets[0].data.len(), 40);
        assert_eq!(packets[2].data.len(), 20);
        let joined: Vec<u8> = packets.iter().flat_map(|p| p.data.clone()).collect();
        assert_eq!(joined, message);
    }

    #[test]
    fn test_split_single_packet_keeps_data_format() {
        let packets = split_into_packets(0, 1, &[0x52], 64).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].control.data_format(), 1);
        assert!(packets[0].is_last());
    }
}
