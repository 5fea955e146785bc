//! Protocol configuration
//!
//! Plain data with serde derives so that an external loader can populate it.
//! Defaults follow common C12 meter behaviour.

use crate::error::{C12Error, C12Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest packet size a C12.18 link may negotiate
pub const MIN_PACKET_SIZE: u16 = 32;

/// Largest packet size a C12.18 link may negotiate
pub const MAX_PACKET_SIZE: u16 = 8192;

/// Maximum length of the user name sent with logon
pub const MAX_USER_LENGTH: usize = 10;

/// Size of the password field of the security service
pub const PASSWORD_LENGTH: usize = 20;

/// Standard C12.22 application context
pub const STANDARD_APPLICATION_CONTEXT: &str = "2.16.124.113620.1.22";

/// Base for relative AP titles when no application context is given
pub const STANDARD_NETWORK_CONTEXT: &str = "2.16.124.113620.1.22.0";

/// C12.22 EPSEM security mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityMode {
    ClearText = 0,
    ClearTextWithAuthentication = 1,
    CipherTextWithAuthentication = 2,
}

impl SecurityMode {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(SecurityMode::ClearText),
            1 => Some(SecurityMode::ClearTextWithAuthentication),
            2 => Some(SecurityMode::CipherTextWithAuthentication),
            _ => None,
        }
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, SecurityMode::ClearText)
    }
}

/// C12.22 EPSEM response control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseControl {
    Always = 0,
    OnException = 1,
    Never = 2,
}

impl ResponseControl {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(ResponseControl::Always),
            1 => Some(ResponseControl::OnException),
            2 => Some(ResponseControl::Never),
            _ => None,
        }
    }
}

/// C12.21 specific options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct C1221Options {
    /// Issue timing setup after identify
    pub issue_timing_setup: bool,
    /// Authenticate with a ticket instead of sending the password
    pub enable_authentication: bool,
    /// 8 byte DES key or 16 byte AES key
    pub authentication_key: Vec<u8>,
    pub authentication_key_id: u8,
}

impl Default for C1221Options {
    fn default() -> Self {
        Self {
            issue_timing_setup: false,
            enable_authentication: false,
            authentication_key: vec![0; 8],
            authentication_key_id: 0,
        }
    }
}

/// C12.22 specific options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct C1222Options {
    /// Absolute UID, empty to omit the element
    pub application_context: String,
    /// Absolute or relative (leading `.`) UID of the meter
    pub called_ap_title: String,
    /// Absolute or relative UID of this client
    pub calling_ap_title: String,
    pub calling_ae_qualifier: Option<u32>,
    pub security_mode: SecurityMode,
    pub response_control: ResponseControl,
    /// 16 byte AES key
    pub security_key: Vec<u8>,
    pub security_key_id: u8,
    /// Every request carries security, no logon/logoff
    pub sessionless: bool,
    /// End sessions with terminate instead of logoff
    pub issue_terminate: bool,
    /// Requested session idle timeout, seconds
    pub session_idle_timeout: u16,
    /// Time allowed for a complete response APDU
    pub response_timeout: Duration,
    pub max_apdu_size_outgoing: u32,
    /// Zero means the same as outgoing
    pub max_apdu_size_incoming: u32,
    /// Up to four bytes of device class
    pub ed_class: Vec<u8>,
    /// Start value for the initialization vector instead of the clock
    pub initialization_vector: Option<u32>,
}

impl Default for C1222Options {
    fn default() -> Self {
        Self {
            application_context: STANDARD_APPLICATION_CONTEXT.to_string(),
            called_ap_title: String::new(),
            calling_ap_title: String::new(),
            calling_ae_qualifier: None,
            security_mode: SecurityMode::ClearText,
            response_control: ResponseControl::Always,
            security_key: vec![0; 16],
            security_key_id: 0,
            sessionless: false,
            issue_terminate: false,
            session_idle_timeout: 60,
            response_timeout: Duration::from_secs(300),
            max_apdu_size_outgoing: 0x7FFF,
            max_apdu_size_incoming: 0,
            ed_class: Vec::new(),
            initialization_vector: None,
        }
    }
}

impl C1222Options {
    pub fn effective_max_apdu_incoming(&self) -> u32 {
        if self.max_apdu_size_incoming == 0 {
            self.max_apdu_size_outgoing
        } else {
            self.max_apdu_size_incoming
        }
    }
}

/// Protocol engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// User name sent with logon, at most ten characters
    pub user: String,
    pub user_id: u16,
    /// Password for the security service, padded with spaces to 20 bytes
    pub password: Vec<u8>,
    /// Identity byte of C12.18/C12.21 packets
    pub identity: u8,
    /// Data format bits of the packet control byte
    pub data_format: u8,
    /// Requested packet size, 32 ..= 8192
    pub packet_size: u16,
    pub max_packets: u8,
    /// Baud rate requested with negotiate, zero to keep the current one
    pub session_baud: u32,
    pub acknowledgement_timeout: Duration,
    pub intercharacter_timeout: Duration,
    pub channel_traffic_timeout: Duration,
    pub turnaround_delay: Duration,
    pub link_layer_retries: u8,
    /// Retries on BSY and DNR, zero disables them
    pub application_layer_retries: u8,
    pub application_layer_retry_delay: Duration,
    /// Retries of a procedure whose result is "not completed"
    pub procedure_retries: u8,
    pub procedure_retry_delay: Duration,
    /// Some meters expect the procedure number in table 7 little endian
    pub procedure_number_little_endian: bool,
    pub issue_negotiate: bool,
    pub issue_security: bool,
    pub issue_logoff: bool,
    pub c1221: C1221Options,
    pub c1222: C1222Options,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            user_id: 0,
            password: vec![b'0'; PASSWORD_LENGTH],
            identity: 0,
            data_format: 0,
            packet_size: 1024,
            max_packets: 255,
            session_baud: 0,
            acknowledgement_timeout: Duration::from_millis(2000),
            intercharacter_timeout: Duration::from_millis(500),
            channel_traffic_timeout: Duration::from_millis(6000),
            turnaround_delay: Duration::from_millis(20),
            link_layer_retries: 3,
            application_layer_retries: 2,
            application_layer_retry_delay: Duration::from_millis(2000),
            procedure_retries: 20,
            procedure_retry_delay: Duration::from_millis(500),
            procedure_number_little_endian: false,
            issue_negotiate: true,
            issue_security: true,
            issue_logoff: true,
            c1221: C1221Options::default(),
            c1222: C1222Options::default(),
        }
    }
}

impl ProtocolConfig {
    /// Check that every field fits its wire representation
    ///
    /// # Errors
    ///
    /// `NumberOutOfRange` for sizes that do not fit, `InvalidData` for
    /// malformed credentials.
    pub fn validate(&self) -> C12Result<()> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(C12Error::NumberOutOfRange {
                what: "packet size",
                value: self.packet_size as u64,
                min: MIN_PACKET_SIZE as u64,
                max: MAX_PACKET_SIZE as u64,
            });
        }
        if self.max_packets == 0 {
            return Err(C12Error::NumberOutOfRange {
                what: "maximum number of packets",
                value: 0,
                min: 1,
                max: 255,
            });
        }
        if self.user.len() > MAX_USER_LENGTH {
            return Err(C12Error::NumberOutOfRange {
                what: "user name length",
                value: self.user.len() as u64,
                min: 0,
                max: MAX_USER_LENGTH as u64,
            });
        }
        if self.password.len() > PASSWORD_LENGTH {
            return Err(C12Error::NumberOutOfRange {
                what: "password length",
                value: self.password.len() as u64,
                min: 0,
                max: PASSWORD_LENGTH as u64,
            });
        }
        if self.data_format > 3 {
            return Err(C12Error::NumberOutOfRange {
                what: "data format",
                value: self.data_format as u64,
                min: 0,
                max: 3,
            });
        }
        if self.c1221.enable_authentication && !matches!(self.c1221.authentication_key.len(), 8 | 16) {
            return Err(C12Error::InvalidData(format!(
                "Authentication key must be 8 (DES) or 16 (AES) bytes, got {}",
                self.c1221.authentication_key.len()
            )));
        }
        if self.c1222.security_mode.is_secure() && self.c1222.security_key.len() != 16 {
            return Err(C12Error::InvalidData(format!(
                "Security key must be 16 bytes, got {}",
                self.c1222.security_key.len()
            )));
        }
        if self.c1222.ed_class.len() > 4 {
            return Err(C12Error::NumberOutOfRange {
                what: "ED class length",
                value: self.c1222.ed_class.len() as u64,
                min: 0,
                max: 4,
            });
        }
        Ok(())
    }

    /// Password padded with spaces to the 20 byte security field
    pub fn padded_password(&self) -> [u8; PASSWORD_LENGTH] {
        let mut field = [b' '; PASSWORD_LENGTH];
        let len = self.password.len().min(PASSWORD_LENGTH);
        field[..len].copy_from_slice(&self.password[..len]);
        field
    }

    /// User name padded with spaces to the 10 byte logon field
    pub fn padded_user(&self) -> [u8; MAX_USER_LENGTH] {
        let mut field = [b' '; MAX_USER_LENGTH];
        let bytes = self.user.as_bytes();
        let len = bytes.len().min(MAX_USER_LENGTH);
        field[..len].copy_from_slice(&bytes[..len]);
        field
    }
}
