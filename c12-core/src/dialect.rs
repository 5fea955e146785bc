//! ANSI C12 dialects and their capability table

use serde::{Deserialize, Serialize};
use std::fmt;

/// One specific ANSI C12 protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// Optical port and direct serial
    C1218,
    /// Telephone modem, C12.18 framing plus authentication and timing setup
    C1221,
    /// Network APDUs with EAX' security
    C1222,
}

/// How requests are framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `EE` packets with toggle bit, multi-packet and ACK/NAK
    Packet,
    /// `0x60` ACSE APDUs carrying EPSEM
    Apdu,
}

/// Integrity check applied to every received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// CRC-16/X-25 over the whole packet
    Crc16,
    /// Four byte EAX' tag, only when security is enabled
    EaxTag,
}

/// Security exchange performed while starting a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityHandshake {
    /// Security service with a 20 byte password
    Password,
    /// Password, or DES/AES ticket authentication
    PasswordOrAuthenticate,
    /// EAX' protected logon and security
    EaxPrime,
}

/// Everything that differs between dialects, as data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectCapabilities {
    pub framing: Framing,
    pub checksum: ChecksumKind,
    pub handshake: SecurityHandshake,
    /// Whether the session passes through the `SecurityHandshake` state
    pub security_state: bool,
    pub supports_identify: bool,
    pub supports_negotiate: bool,
    /// Negotiate may carry a baud rate index
    pub supports_negotiate_baud: bool,
    pub supports_timing_setup: bool,
    /// Sequence numbers wrap at this value: toggle bit for packets,
    /// calling invocation id for APDUs
    pub sequence_modulus: u64,
}

const C1218_CAPABILITIES: DialectCapabilities = DialectCapabilities {
    framing: Framing::Packet,
    checksum: ChecksumKind::Crc16,
    handshake: SecurityHandshake::Password,
    security_state: false,
    supports_identify: true,
    supports_negotiate: true,
    supports_negotiate_baud: true,
    supports_timing_setup: false,
    sequence_modulus: 2,
};

const C1221_CAPABILITIES: DialectCapabilities = DialectCapabilities {
    framing: Framing::Packet,
    checksum: ChecksumKind::Crc16,
    handshake: SecurityHandshake::PasswordOrAuthenticate,
    security_state: false,
    supports_identify: true,
    supports_negotiate: true,
    supports_negotiate_baud: false,
    supports_timing_setup: true,
    sequence_modulus: 2,
};

const C1222_CAPABILITIES: DialectCapabilities = DialectCapabilities {
    framing: Framing::Apdu,
    checksum: ChecksumKind::EaxTag,
    handshake: SecurityHandshake::EaxPrime,
    security_state: true,
    supports_identify: false,
    supports_negotiate: false,
    supports_negotiate_baud: false,
    supports_timing_setup: false,
    sequence_modulus: 1 << 32,
};

impl Dialect {
    pub const ALL: [Dialect; 3] = [Dialect::C1218, Dialect::C1221, Dialect::C1222];

    pub const fn capabilities(&self) -> &'static DialectCapabilities {
        match self {
            Dialect::C1218 => &C1218_CAPABILITIES,
            Dialect::C1221 => &C1221_CAPABILITIES,
            Dialect::C1222 => &C1222_CAPABILITIES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::C1218 => "C12.18",
            Dialect::C1221 => "C12.21",
            Dialect::C1222 => "C12.22",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_table() {
        assert_eq!(Dialect::C1218.capabilities().framing, Framing::Packet);
        assert_eq!(Dialect::C1221.capabilities().checksum, ChecksumKind::Crc16);
        assert!(Dialect::C1221.capabilities().supports_timing_setup);
        assert!(!Dialect::C1221.capabilities().supports_negotiate_baud);

        let c1222 = Dialect::C1222.capabilities();
        assert_eq!(c1222.framing, Framing::Apdu);
        assert!(c1222.security_state);
        assert_eq!(c1222.sequence_modulus, 1u64 << 32);

        let with_security_state: Vec<_> = Dialect::ALL
            .iter()
            .filter(|d| d.capabilities().security_state)
            .collect();
        assert_eq!(with_security_state, vec![&Dialect::C1222]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Dialect::C1221.to_string(), "C12.21");
    }
}
