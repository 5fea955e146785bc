//! Session layer for ANSI C12 protocols
//!
//! This crate provides the C12.18/C12.21 data-link layer (CRC-16 packets,
//! toggle bit, multi-packet messages, ACK/NAK), the C12.22 APDU stream
//! framing and the session state machine.
//!
//! # 会话层
//! - `crc`: CRC-16/X-25 of packets
//! - `packet`: packet encoding, decoding and splitting
//! - `link`: sending and receiving messages over the packet link
//! - `apdu`: C12.22 APDU reading and writing on streams
//! - `state`: session state transitions

pub mod apdu;
pub mod crc;
pub mod link;
pub mod packet;
pub mod state;

pub use apdu::{APDU_START, read_apdu, write_apdu};
pub use crc::{CrcCalc, crc16};
pub use link::{
    LinkLayer, LinkLimits, LinkParameters, LinkStatistics, PARTIAL_WRITE_SERVICE_OVERHEAD,
    READ_SERVICE_OVERHEAD, Received, WRITE_SERVICE_OVERHEAD,
};
pub use packet::{ACK, Control, NAK, PACKET_HEADER_SIZE, PACKET_OVERHEAD, Packet, STP, split_into_packets};
pub use state::SessionState;
