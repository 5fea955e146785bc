//! Plain block cipher modes
//!
//! ECB over AES-128 and single block DES, as used by the C12.21
//! authenticate service.

use crate::key::SecretKey;
use aes::Aes128;
use c12_core::{C12Error, C12Result};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;

pub const AES_BLOCK_SIZE: usize = 16;
pub const DES_BLOCK_SIZE: usize = 8;

/// AES-128 in ECB mode
#[derive(Clone)]
pub struct AesBlock {
    cipher: Aes128,
}

impl AesBlock {
    pub fn new(key: &SecretKey) -> C12Result<Self> {
        let cipher = Aes128::new_from_slice(key.as_bytes()).map_err(|_| {
            C12Error::Security(format!("Invalid AES-128 key length: {}", key.len()))
        })?;
        Ok(Self { cipher })
    }

    fn check_size(data: &[u8]) -> C12Result<()> {
        if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
            return Err(C12Error::Security(format!(
                "AES data of {} bytes is not a whole number of blocks",
                data.len()
            )));
        }
        Ok(())
    }

    pub fn encrypt_block(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    /// Encrypt whole blocks in place
    pub fn encrypt(&self, data: &mut [u8]) -> C12Result<()> {
        Self::check_size(data)?;
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }

    /// Decrypt whole blocks in place
    pub fn decrypt(&self, data: &mut [u8]) -> C12Result<()> {
        Self::check_size(data)?;
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}

/// Single block DES with a 64 bit key
#[derive(Clone)]
pub struct LegacyDes {
    cipher: Des,
}

impl LegacyDes {
    pub fn new(key: &SecretKey) -> C12Result<Self> {
        let cipher = Des::new_from_slice(key.as_bytes())
            .map_err(|_| C12Error::Security(format!("Invalid DES key length: {}", key.len())))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, block: &[u8; DES_BLOCK_SIZE]) -> [u8; DES_BLOCK_SIZE] {
        let mut out = *block;
        self.cipher.encrypt_block(GenericArray::from_mut_slice(&mut out));
        out
    }

    pub fn decrypt(&self, block: &[u8; DES_BLOCK_SIZE]) -> [u8; DES_BLOCK_SIZE] {
        let mut out = *block;
        self.cipher.decrypt_block(GenericArray::from_mut_slice(&mut out));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_fips197_vector() {
        let key = SecretKey::aes128(&[
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ])
        .unwrap();
        let aes = AesBlock::new(&key).unwrap();
        let mut data = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        aes.encrypt(&mut data).unwrap();
        assert_eq!(
            data,
            [
                0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
                0xc5, 0x5a
            ]
        );
        aes.decrypt(&mut data).unwrap();
        assert_eq!(data[0], 0x00);
        assert_eq!(data[15], 0xff);
    }

    #[test]
    fn test_aes_rejects_partial_block() {
        let aes = AesBlock::new(&SecretKey::aes128(&[0u8; 16]).unwrap()).unwrap();
        assert!(aes.encrypt(&mut [0u8; 15]).is_err());
    }

    #[test]
    fn test_des_known_vector() {
        // FIPS 81 example
        let key = SecretKey::new(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef], &[8]).unwrap();
        let des = LegacyDes::new(&key).unwrap();
        let plain = *b"Now is t";
        let encrypted = des.encrypt(&plain);
        assert_eq!(encrypted, [0x3f, 0xa4, 0x0e, 0x8a, 0x98, 0x4d, 0x48, 0x15]);
        assert_eq!(des.decrypt(&encrypted), plain);
    }
}
