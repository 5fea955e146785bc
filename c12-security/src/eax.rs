//! AES-128 EAX' authenticated encryption
//!
//! EAX' is the EAX variant of ANSI C12.22: the nonce is the canonified
//! cleartext of the APDU, CMAC' is keyed with the precomputed values
//! D = dbl(L) and Q = dbl(D) where L = E(K, 0), and the MAC is the last
//! four bytes of the tag block.
//!
//! Without payload the mode only authenticates: the MAC is taken from the
//! CMAC' of the cleartext.

use crate::block::{AES_BLOCK_SIZE, AesBlock};
use crate::key::SecretKey;
use c12_core::{C12Error, C12Result};
use zeroize::Zeroize;

/// Size of the EAX' message authentication code
pub const MAC_SIZE: usize = 4;

type Block = [u8; AES_BLOCK_SIZE];

fn dbl(input: &Block) -> Block {
    let mut out = [0u8; AES_BLOCK_SIZE];
    let mut carry = 0u8;
    for (o, i) in out.iter_mut().zip(input.iter()) {
        *o = (i << 1) | carry;
        carry = i >> 7;
    }
    if carry != 0 {
        out[0] ^= 0x87;
    }
    out
}

fn xor_block(target: &mut Block, other: &[u8]) {
    for (t, o) in target.iter_mut().zip(other.iter()) {
        *t ^= o;
    }
}

/// Constant time comparison of two MACs
pub fn verify_tag(expected: &[u8], received: &[u8]) -> bool {
    if expected.len() != received.len() {
        return false;
    }
    expected
        .iter()
        .zip(received.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// EAX' context bound to one key
pub struct AesEax {
    aes: AesBlock,
    d: Block,
    q: Block,
}

impl AesEax {
    pub fn new(key: &SecretKey) -> C12Result<Self> {
        let aes = AesBlock::new(key)?;
        let mut l = [0u8; AES_BLOCK_SIZE];
        aes.encrypt_block(&mut l);
        let d = dbl(&l);
        let q = dbl(&d);
        l.zeroize();
        Ok(Self { aes, d, q })
    }

    /// CMAC' of `data`, accumulated onto `ws`
    fn cmac(&self, ws: &mut Block, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let last = (data.len() - 1) / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        for chunk in data[..last].chunks_exact(AES_BLOCK_SIZE) {
            xor_block(ws, chunk);
            self.aes.encrypt_block(ws);
        }
        let tail = &data[last..];
        xor_block(ws, tail);
        if tail.len() == AES_BLOCK_SIZE {
            xor_block(ws, &self.d);
        } else {
            ws[tail.len()] ^= 0x80;
            xor_block(ws, &self.q);
        }
        self.aes.encrypt_block(ws);
    }

    fn ctr(&self, nonce: &Block, data: &mut [u8]) {
        let mut counter = *nonce;
        counter[12] &= 0x7F;
        counter[14] &= 0x7F;
        for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
            let mut stream = counter;
            self.aes.encrypt_block(&mut stream);
            xor_block_into(chunk, &stream);
            for byte in counter.iter_mut().rev() {
                *byte = byte.wrapping_add(1);
                if *byte != 0 {
                    break;
                }
            }
        }
    }

    fn nonce_mac(&self, cleartext: &[u8]) -> Block {
        let mut ws = self.d;
        self.cmac(&mut ws, cleartext);
        ws
    }

    fn payload_mac(&self, nonce: &Block, ciphertext: &[u8]) -> [u8; MAC_SIZE] {
        let mut ws = self.q;
        self.cmac(&mut ws, ciphertext);
        xor_block(&mut ws, nonce);
        mac_of(&ws)
    }

    /// MAC over the cleartext only
    pub fn authenticate(&self, cleartext: &[u8]) -> [u8; MAC_SIZE] {
        mac_of(&self.nonce_mac(cleartext))
    }

    /// Encrypt `data` in place, returning its MAC
    pub fn encrypt_buffer(&self, cleartext: &[u8], data: &mut [u8]) -> [u8; MAC_SIZE] {
        let nonce = self.nonce_mac(cleartext);
        if data.is_empty() {
            return mac_of(&nonce);
        }
        self.ctr(&nonce, data);
        self.payload_mac(&nonce, data)
    }

    /// Decrypt `data` in place, returning the MAC computed over the ciphertext
    pub fn decrypt_buffer(&self, cleartext: &[u8], data: &mut [u8]) -> [u8; MAC_SIZE] {
        let nonce = self.nonce_mac(cleartext);
        if data.is_empty() {
            return mac_of(&nonce);
        }
        let mac = self.payload_mac(&nonce, data);
        self.ctr(&nonce, data);
        mac
    }

    /// Encrypt and append the MAC
    pub fn encrypt_and_authenticate(&self, cleartext: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(plaintext.len() + MAC_SIZE);
        result.extend_from_slice(plaintext);
        let mac = self.encrypt_buffer(cleartext, &mut result);
        result.extend_from_slice(&mac);
        result
    }

    /// Verify the trailing MAC and decrypt
    ///
    /// A wrong key, a modified ciphertext and a modified MAC all fail the
    /// same way.
    pub fn decrypt_and_verify(&self, cleartext: &[u8], data: &[u8]) -> C12Result<Vec<u8>> {
        if data.len() < MAC_SIZE {
            return Err(C12Error::AuthenticationFailed(
                "Data block is shorter than its MAC".to_string(),
            ));
        }
        let (ciphertext, received) = data.split_at(data.len() - MAC_SIZE);
        let mut plaintext = ciphertext.to_vec();
        let mac = self.decrypt_buffer(cleartext, &mut plaintext);
        if !verify_tag(&mac, received) {
            plaintext.zeroize();
            return Err(C12Error::AuthenticationFailed(
                "Data not validated, tampering or wrong key".to_string(),
            ));
        }
        Ok(plaintext)
    }
}

impl Drop for AesEax {
    fn drop(&mut self) {
        self.d.zeroize();
        self.q.zeroize();
    }
}

impl std::fmt::Debug for AesEax {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesEax(redacted)")
    }
}

fn xor_block_into(target: &mut [u8], stream: &Block) {
    for (t, s) in target.iter_mut().zip(stream.iter()) {
        *t ^= s;
    }
}

fn mac_of(block: &Block) -> [u8; MAC_SIZE] {
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&block[AES_BLOCK_SIZE - MAC_SIZE..]);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eax() -> AesEax {
        let key = SecretKey::aes128(&[
            0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF,
            0x4F, 0x3C,
        ])
        .unwrap();
        AesEax::new(&key).unwrap()
    }

    #[test]
    fn test_dbl_carries_towards_higher_bytes() {
        let mut input = [0u8; AES_BLOCK_SIZE];
        input[0] = 0x81;
        let out = dbl(&input);
        assert_eq!(out[0], 0x02);
        assert_eq!(out[1], 0x01);

        input = [0u8; AES_BLOCK_SIZE];
        input[15] = 0x80;
        assert_eq!(dbl(&input)[0], 0x87);
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let eax = eax();
        let cleartext = b"\xA1\x09\x06\x07\x60\x7C\x86\xF7\x54\x01\x16";
        let plaintext = b"\x51\x70\x61\x73\x73\x77\x6F\x72\x64\x20\x20\x20\x20\x20\x20\x20\x20\x20\x20\x20\x20\x00\x01";
        let sealed = eax.encrypt_and_authenticate(cleartext, plaintext);
        assert_eq!(sealed.len(), plaintext.len() + MAC_SIZE);
        assert_ne!(&sealed[..plaintext.len()], &plaintext[..]);
        assert_eq!(eax.decrypt_and_verify(cleartext, &sealed).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn test_tampered_tag_fails_with_intact_ciphertext() {
        let eax = eax();
        let mut sealed = eax.encrypt_and_authenticate(b"context", b"table data");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            eax.decrypt_and_verify(b"context", &sealed),
            Err(C12Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_tampered_cleartext_or_ciphertext_fails() {
        let eax = eax();
        let sealed = eax.encrypt_and_authenticate(b"context", b"table data");
        assert!(eax.decrypt_and_verify(b"contexu", &sealed).is_err());
        let mut flipped = sealed.clone();
        flipped[0] ^= 0x80;
        assert!(eax.decrypt_and_verify(b"context", &flipped).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = eax().encrypt_and_authenticate(b"context", b"table data");
        let other = AesEax::new(&SecretKey::aes128(&[0u8; 16]).unwrap()).unwrap();
        assert!(matches!(
            other.decrypt_and_verify(b"context", &sealed),
            Err(C12Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_authenticate_only_matches_empty_payload() {
        let eax = eax();
        let mac = eax.authenticate(b"cleartext apdu");
        assert_eq!(eax.encrypt_buffer(b"cleartext apdu", &mut []), mac);
        assert_eq!(eax.decrypt_and_verify(b"cleartext apdu", &mac).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_multi_block_payload() {
        let eax = eax();
        let payload: Vec<u8> = (0..=200u8).collect();
        let sealed = eax.encrypt_and_authenticate(&[0x55; 33], &payload);
        assert_eq!(eax.decrypt_and_verify(&[0x55; 33], &sealed).unwrap(), payload);
    }

    #[test]
    fn test_verify_tag_length_mismatch() {
        assert!(verify_tag(&[1, 2, 3, 4], &[1, 2, 3, 4]));
        assert!(!verify_tag(&[1, 2, 3, 4], &[1, 2, 3]));
        assert!(!verify_tag(&[1, 2, 3, 4], &[1, 2, 3, 5]));
    }
}
