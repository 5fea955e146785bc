//! Hex formatting for diagnostic frame dumps

use std::fmt::Write;

/// Format bytes as space separated upper case hex, `EE 00 20`
pub fn to_hex(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        let _ = write!(text, "{:02X}", byte);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0xEE, 0x00, 0x2a]), "EE 00 2A");
        assert_eq!(to_hex(&[]), "");
    }
}
