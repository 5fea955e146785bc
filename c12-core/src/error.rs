use std::fmt;
use thiserror::Error;

/// Negative acknowledgement codes returned by a C12 meter in the first
/// byte of a response
///
/// Values in `0x01..0x20` and `0x80..=0xFF` are error responses; any code
/// not named here is kept verbatim in [`NokCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NokCode {
    /// Rejection of the received service request
    Err,
    /// Service not supported
    Sns,
    /// Insufficient security clearance
    Isc,
    /// Operation not possible
    Onp,
    /// Inappropriate action requested
    Iar,
    /// Device busy
    Bsy,
    /// Data not ready
    Dnr,
    /// Data locked
    Dlk,
    /// Renegotiate request
    Rno,
    /// Invalid service sequence state
    Isss,
    /// Security mechanism error
    Sme,
    /// Unknown or invalid called AP title
    Uat,
    /// Network timeout
    Nett,
    /// Node not reachable
    Netr,
    /// Request too large
    Rqtl,
    /// Response too large
    Rstl,
    /// Segmentation not possible
    Sgnp,
    /// Segmentation error
    Sgerr,
    /// Not ready (relay still waiting)
    Nry,
    /// Any other code
    Other(u8),
}

impl NokCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x01 => NokCode::Err,
            0x02 => NokCode::Sns,
            0x03 => NokCode::Isc,
            0x04 => NokCode::Onp,
            0x05 => NokCode::Iar,
            0x06 => NokCode::Bsy,
            0x07 => NokCode::Dnr,
            0x08 => NokCode::Dlk,
            0x09 => NokCode::Rno,
            0x0A => NokCode::Isss,
            0x0B => NokCode::Sme,
            0x0C => NokCode::Uat,
            0x0D => NokCode::Nett,
            0x0E => NokCode::Netr,
            0x0F => NokCode::Rqtl,
            0x10 => NokCode::Rstl,
            0x11 => NokCode::Sgnp,
            0x12 => NokCode::Sgerr,
            0x1E => NokCode::Nry,
            other => NokCode::Other(other),
        }
    }

    /// Raw code byte as sent on the wire
    pub fn code(&self) -> u8 {
        match self {
            NokCode::Err => 0x01,
            NokCode::Sns => 0x02,
            NokCode::Isc => 0x03,
            NokCode::Onp => 0x04,
            NokCode::Iar => 0x05,
            NokCode::Bsy => 0x06,
            NokCode::Dnr => 0x07,
            NokCode::Dlk => 0x08,
            NokCode::Rno => 0x09,
            NokCode::Isss => 0x0A,
            NokCode::Sme => 0x0B,
            NokCode::Uat => 0x0C,
            NokCode::Nett => 0x0D,
            NokCode::Netr => 0x0E,
            NokCode::Rqtl => 0x0F,
            NokCode::Rstl => 0x10,
            NokCode::Sgnp => 0x11,
            NokCode::Sgerr => 0x12,
            NokCode::Nry => 0x1E,
            NokCode::Other(code) => *code,
        }
    }

    /// Busy and data-not-ready are transient, the request can be repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, NokCode::Bsy | NokCode::Dnr)
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            NokCode::Err => "ERR",
            NokCode::Sns => "SNS",
            NokCode::Isc => "ISC",
            NokCode::Onp => "ONP",
            NokCode::Iar => "IAR",
            NokCode::Bsy => "BSY",
            NokCode::Dnr => "DNR",
            NokCode::Dlk => "DLK",
            NokCode::Rno => "RNO",
            NokCode::Isss => "ISSS",
            NokCode::Sme => "SME",
            NokCode::Uat => "UAT",
            NokCode::Nett => "NETT",
            NokCode::Netr => "NETR",
            NokCode::Rqtl => "RQTL",
            NokCode::Rstl => "RSTL",
            NokCode::Sgnp => "SGNP",
            NokCode::Sgerr => "SGERR",
            NokCode::Nry => "NRY",
            NokCode::Other(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for NokCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.mnemonic(), self.code())
    }
}

/// Result code of a meter procedure, read back from table 8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureResult {
    Completed,
    NotCompleted,
    InvalidParameter,
    SetupConflict,
    IgnoredDueToTiming,
    NoAuthorization,
    UnknownProcedure,
    Other(u8),
}

impl ProcedureResult {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0 => ProcedureResult::Completed,
            1 => ProcedureResult::NotCompleted,
            2 => ProcedureResult::InvalidParameter,
            3 => ProcedureResult::SetupConflict,
            4 => ProcedureResult::IgnoredDueToTiming,
            5 => ProcedureResult::NoAuthorization,
            6 => ProcedureResult::UnknownProcedure,
            other => ProcedureResult::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ProcedureResult::Completed => 0,
            ProcedureResult::NotCompleted => 1,
            ProcedureResult::InvalidParameter => 2,
            ProcedureResult::SetupConflict => 3,
            ProcedureResult::IgnoredDueToTiming => 4,
            ProcedureResult::NoAuthorization => 5,
            ProcedureResult::UnknownProcedure => 6,
            ProcedureResult::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcedureResult::Completed)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcedureResult::NotCompleted)
    }
}

impl fmt::Display for ProcedureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcedureResult::Completed => "completed",
            ProcedureResult::NotCompleted => "not completed",
            ProcedureResult::InvalidParameter => "invalid parameter",
            ProcedureResult::SetupConflict => "setup conflict",
            ProcedureResult::IgnoredDueToTiming => "ignored due to timing",
            ProcedureResult::NoAuthorization => "no authorization",
            ProcedureResult::UnknownProcedure => "unknown procedure",
            ProcedureResult::Other(_) => "unknown result",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// What a failed transaction leaves behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The session stays active and the caller may retry
    KeepSession,
    /// The session is unusable, the caller must reconnect
    Disconnect,
}

/// Main error type for C12 protocol operations
#[derive(Error, Debug)]
pub enum C12Error {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Channel read timeout, {bytes_read} bytes read")]
    ChannelReadTimeout { bytes_read: usize },

    #[error("Channel write timeout, {bytes_written} bytes written")]
    ChannelWriteTimeout { bytes_written: usize },

    #[error("Channel disconnected unexpectedly")]
    ChannelDisconnectedUnexpectedly,

    #[error("Collision detected on a shared line")]
    CollisionDetected,

    #[error("Modem: {0}")]
    ModemResponse(String),

    #[error("Bad procedure result: {0}")]
    BadProcedureResult(ProcedureResult),

    #[error("NOK response {code}")]
    NokResponse { code: NokCode, extra: Vec<u8> },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Operation cancelled")]
    OperationCancelled,

    #[error("{what} index {index} is out of range 0 .. {max}")]
    IndexOutOfRange {
        what: &'static str,
        index: u64,
        max: u64,
    },

    #[error("{what} value {value} is out of range {min} .. {max}")]
    NumberOutOfRange {
        what: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Partial data: declared {declared} bytes, received {actual}")]
    PartialData { declared: usize, actual: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame invalid: {0}")]
    FrameInvalid(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Security error: {0}")]
    Security(String),
}

impl C12Error {
    /// Shorthand for a NOK response without extra parameters
    pub fn nok(code: NokCode) -> Self {
        C12Error::NokResponse {
            code,
            extra: Vec::new(),
        }
    }

    /// Session state implied by this failure
    ///
    /// The mapping is total: a failed transaction either keeps the session
    /// in `SessionActive` or forces it to `Disconnected`.
    pub fn disposition(&self) -> FailureDisposition {
        match self {
            C12Error::ChannelReadTimeout { .. }
            | C12Error::ChannelWriteTimeout { .. }
            | C12Error::CollisionDetected
            | C12Error::BadProcedureResult(_)
            | C12Error::NokResponse { .. }
            | C12Error::IndexOutOfRange { .. }
            | C12Error::NumberOutOfRange { .. }
            | C12Error::PartialData { .. }
            | C12Error::InvalidData(_)
            | C12Error::InvalidState(_) => FailureDisposition::KeepSession,
            C12Error::Connection(_)
            | C12Error::ChannelDisconnectedUnexpectedly
            | C12Error::ModemResponse(_)
            | C12Error::AuthenticationFailed(_)
            | C12Error::OperationCancelled
            | C12Error::Protocol(_)
            | C12Error::FrameInvalid(_)
            | C12Error::Security(_) => FailureDisposition::Disconnect,
        }
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            C12Error::NokResponse { code, .. } => code.is_retryable(),
            C12Error::BadProcedureResult(result) => result.is_retryable(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            C12Error::ChannelReadTimeout { .. } | C12Error::ChannelWriteTimeout { .. }
        )
    }

    /// NOK code carried by this error, if any
    pub fn nok_code(&self) -> Option<NokCode> {
        match self {
            C12Error::NokResponse { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for C12 operations
pub type C12Result<T> = Result<T, C12Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nok_code_round_trip_of_named_codes() {
        for byte in (0x01u8..=0x12).chain([0x1E, 0x13, 0x80, 0xFF]) {
            assert_eq!(NokCode::from_byte(byte).code(), byte);
        }
        assert_eq!(NokCode::from_byte(0x06), NokCode::Bsy);
        assert_eq!(NokCode::from_byte(0x13), NokCode::Other(0x13));
    }

    #[test]
    fn test_nok_retryable() {
        assert!(NokCode::Bsy.is_retryable());
        assert!(NokCode::Dnr.is_retryable());
        assert!(!NokCode::Err.is_retryable());
        assert!(C12Error::nok(NokCode::Dnr).is_retryable());
        assert!(!C12Error::nok(NokCode::Isc).is_retryable());
    }

    #[test]
    fn test_disposition() {
        assert_eq!(
            C12Error::ChannelReadTimeout { bytes_read: 0 }.disposition(),
            FailureDisposition::KeepSession
        );
        assert_eq!(
            C12Error::nok(NokCode::Err).disposition(),
            FailureDisposition::KeepSession
        );
        assert_eq!(
            C12Error::ChannelDisconnectedUnexpectedly.disposition(),
            FailureDisposition::Disconnect
        );
        assert_eq!(
            C12Error::AuthenticationFailed("tag".into()).disposition(),
            FailureDisposition::Disconnect
        );
    }

    #[test]
    fn test_procedure_result() {
        assert!(ProcedureResult::from_byte(0).is_success());
        assert!(ProcedureResult::from_byte(1).is_retryable());
        assert_eq!(ProcedureResult::from_byte(9), ProcedureResult::Other(9));
        assert_eq!(
            C12Error::BadProcedureResult(ProcedureResult::SetupConflict).to_string(),
            "Bad procedure result: setup conflict (3)"
        );
    }

    #[test]
    fn test_nok_display() {
        let err = C12Error::NokResponse {
            code: NokCode::Isc,
            extra: vec![],
        };
        assert_eq!(err.to_string(), "NOK response ISC (0x03)");
    }
}
