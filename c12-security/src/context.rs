//! C12.22 security context
//!
//! Holds the key material of one session together with the nonce
//! discipline: the initialization vector sent with every secured APDU is
//! the UTC time in seconds and never repeats for the same key.

use crate::eax::AesEax;
use crate::key::SecretKey;
use c12_core::{C12Error, C12Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time for initialization vectors
pub trait Clock: Send + Sync + fmt::Debug {
    /// Seconds since 1970-01-01 UTC
    fn unix_seconds(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to, for deterministic tests
#[derive(Debug, Default)]
pub struct FixedClock {
    seconds: AtomicU64,
}

impl FixedClock {
    pub fn new(seconds: u64) -> Self {
        Self {
            seconds: AtomicU64::new(seconds),
        }
    }

    pub fn advance(&self, seconds: u64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn unix_seconds(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }
}

/// Key material and nonce state of a C12.22 session
pub struct SecurityContext {
    key: SecretKey,
    key_id: u8,
    eax: AesEax,
    last_iv: Option<u32>,
    fixed_iv: Option<u32>,
    clock: Arc<dyn Clock>,
}

impl SecurityContext {
    pub fn new(key: SecretKey, key_id: u8, clock: Arc<dyn Clock>) -> C12Result<Self> {
        let eax = AesEax::new(&key)?;
        Ok(Self {
            key,
            key_id,
            eax,
            last_iv: None,
            fixed_iv: None,
            clock,
        })
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn eax(&self) -> &AesEax {
        &self.eax
    }

    /// Use `iv` for the next APDU instead of the clock
    ///
    /// The value is taken once; it still has to be greater than every IV
    /// already sent under this key, otherwise the clock rule applies.
    pub fn set_initialization_vector(&mut self, iv: u32) {
        self.fixed_iv = Some(iv);
    }

    pub fn last_initialization_vector(&self) -> Option<u32> {
        self.last_iv
    }

    /// Initialization vector for the next secured APDU
    ///
    /// Strictly greater than the previous one under this key.
    ///
    /// # Errors
    ///
    /// `Security` once `u32::MAX` was sent, the key must be replaced.
    pub fn next_initialization_vector(&mut self) -> C12Result<u32> {
        let candidate = self
            .fixed_iv
            .take()
            .unwrap_or_else(|| self.clock.unix_seconds() as u32);
        let iv = match self.last_iv {
            Some(last) if candidate <= last => {
                let next = last.checked_add(1).ok_or_else(|| {
                    C12Error::Security("Initialization vectors exhausted for this key".to_string())
                })?;
                log::debug!("IV {} would repeat, using {}", candidate, next);
                next
            }
            _ => candidate,
        };
        self.last_iv = Some(iv);
        Ok(iv)
    }

    /// Overwrite the key with zeros, the context is unusable afterwards
    pub fn clear(&mut self) {
        self.key.clear();
        self.eax = match AesEax::new(&self.key) {
            Ok(eax) => eax,
            Err(_) => return,
        };
        self.last_iv = None;
        self.fixed_iv = None;
    }

    pub fn is_cleared(&self) -> bool {
        self.key.is_cleared()
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("key", &self.key)
            .field("key_id", &self.key_id)
            .field("last_iv", &self.last_iv)
            .finish()
    }
}
