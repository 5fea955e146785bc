//! Secret key holder

use c12_core::{C12Error, C12Result};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key material, overwritten with zeros when dropped
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: Vec<u8>,
}

impl SecretKey {
    /// Create a key, checking its length against the allowed sizes
    pub fn new(bytes: &[u8], allowed_lengths: &[usize]) -> C12Result<Self> {
        if !allowed_lengths.contains(&bytes.len()) {
            return Err(C12Error::Security(format!(
                "Invalid key length: expected one of {:?} bytes, got {}",
                allowed_lengths,
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// AES-128 key
    pub fn aes128(bytes: &[u8]) -> C12Result<Self> {
        Self::new(bytes, &[16])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite the key material with zeros, keeping its length
    pub fn clear(&mut self) {
        self.bytes.as_mut_slice().zeroize();
    }

    /// Whether the key was cleared
    pub fn is_cleared(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({} bytes, redacted)", self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_checked() {
        assert!(SecretKey::aes128(&[0u8; 16]).is_ok());
        assert!(matches!(SecretKey::aes128(&[0u8; 8]), Err(C12Error::Security(_))));
        assert!(SecretKey::new(&[1u8; 8], &[8, 16]).is_ok());
    }

    #[test]
    fn test_clear_and_redacted_debug() {
        let mut key = SecretKey::aes128(&[0x5Au8; 16]).unwrap();
        assert!(!format!("{:?}", key).contains("5A"));
        key.clear();
        assert_eq!(key.as_bytes(), &[0u8; 16]);
        assert!(key.is_cleared());
    }

    #[test]
    fn test_zeroize_releases_material() {
        let mut key = SecretKey::aes128(&[0x5Au8; 16]).unwrap();
        let copy = key.clone();
        key.zeroize();
        assert!(key.is_empty());
        // clones own their material
        assert_eq!(copy.as_bytes(), &[0x5Au8; 16]);
    }
}
