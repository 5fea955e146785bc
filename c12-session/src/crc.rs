//! CRC-16 of C12.18 and C12.21 packets
//!
//! CRC-16/X-25: polynomial 0x1021 bit reversed, initial value 0xFFFF,
//! result inverted and transmitted low byte first.

use c12_core::{C12Error, C12Result};

const INITIAL_CRC: u16 = 0xFFFF;
/// Register value after running a packet with its CRC appended
const GOOD_CRC: u16 = 0xF0B8;
const KEY: u16 = 0x8408; // Bit-reversed 1021

static CRC_TABLE: once_cell::sync::Lazy<[u16; 256]> = once_cell::sync::Lazy::new(|| {
    let mut table = [0u16; 256];
    for (b, entry) in table.iter_mut().enumerate() {
        let mut v = b as u16;
        for _ in 0..8 {
            if (v & 1) == 1 {
                v = (v >> 1) ^ KEY;
            } else {
                v >>= 1;
            }
        }
        *entry = v;
    }
    table
});

/// Running CRC-16 calculator
#[derive(Debug, Clone)]
pub struct CrcCalc {
    register: u16,
}

impl CrcCalc {
    pub fn new() -> Self {
        Self {
            register: INITIAL_CRC,
        }
    }

    pub fn reset(&mut self) {
        self.register = INITIAL_CRC;
    }

    pub fn update(&mut self, byte: u8) {
        self.register = (self.register >> 8) ^ CRC_TABLE[((self.register ^ byte as u16) & 0xFF) as usize];
    }

    pub fn update_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            self.update(byte);
        }
    }

    /// Final CRC value
    pub fn value(&self) -> u16 {
        self.register ^ 0xFFFF
    }

    /// CRC bytes in transmission order
    pub fn value_bytes(&self) -> [u8; 2] {
        self.value().to_le_bytes()
    }

    /// Check the register after the CRC bytes were fed in too
    pub fn validate(&self) -> C12Result<()> {
        if self.register != GOOD_CRC {
            return Err(C12Error::FrameInvalid(format!(
                "CRC has wrong value: 0x{:04X}, expected 0x{:04X}",
                self.register, GOOD_CRC
            )));
        }
        Ok(())
    }
}

impl Default for CrcCalc {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC of a complete buffer
pub fn crc16(data: &[u8]) -> u16 {
    let mut calc = CrcCalc::new();
    calc.update_bytes(data);
    calc.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0x906E);
    }

    #[test]
    fn test_known_packet() {
        // Identify request from the C12.18 examples: EE 00 00 00 00 01 20 13 10
        let packet = [0xEE, 0x00, 0x00, 0x00, 0x00, 0x01, 0x20];
        assert_eq!(crc16(&packet).to_le_bytes(), [0x13, 0x10]);
    }

    #[test]
    fn test_residue_validation() {
        let packet = [0xEE, 0x00, 0x20, 0x00, 0x00, 0x01, 0x00];
        let mut calc = CrcCalc::new();
        calc.update_bytes(&packet);
        let crc = calc.value_bytes();
        calc.update_bytes(&crc);
        assert!(calc.validate().is_ok());

        let mut bad = CrcCalc::new();
        bad.update_bytes(&packet);
        bad.update_bytes(&[crc[0] ^ 0x01, crc[1]]);
        assert!(matches!(bad.validate(), Err(C12Error::FrameInvalid(_))));
    }

    #[test]
    fn test_reset() {
        let mut calc = CrcCalc::new();
        calc.update(0x01);
        calc.reset();
        assert_eq!(calc.value(), 0x0000);
    }
}
