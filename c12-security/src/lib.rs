//! Security module for ANSI C12 protocols
//!
//! This crate provides the AES-128 EAX' mode that protects C12.22 APDUs,
//! the plain AES and DES block modes of the C12.21 authenticate service,
//! and the per-session security context that owns the key material.

pub mod block;
pub mod context;
pub mod eax;
pub mod key;

pub use block::{AES_BLOCK_SIZE, AesBlock, DES_BLOCK_SIZE, LegacyDes};
pub use context::{Clock, FixedClock, SecurityContext, SystemClock};
pub use eax::{AesEax, MAC_SIZE, verify_tag};
pub use key::SecretKey;
