//! Session state machine

use c12_core::{C12Error, C12Result};

/// State of a meter session
///
/// # State Transitions
/// ```text
/// Disconnected -> Identifying (on connect)
/// Identifying -> Negotiating | SecurityHandshake | SessionActive
/// Negotiating -> SecurityHandshake | SessionActive
/// SecurityHandshake -> SessionActive
/// SessionActive -> Terminating (on disconnect)
/// Terminating -> Disconnected
/// any -> Disconnected (on a failure that ends the session)
/// ```
///
/// C12.22 has no identify step, its session starts with the logon in
/// `Identifying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Identifying,
    Negotiating,
    SecurityHandshake,
    SessionActive,
    Terminating,
}

impl SessionState {
    /// Table reads, writes and procedures are allowed
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::SessionActive)
    }

    /// Between connect and an active session
    pub fn is_starting(&self) -> bool {
        matches!(
            self,
            SessionState::Identifying | SessionState::Negotiating | SessionState::SecurityHandshake
        )
    }

    pub fn validate_transition(&self, new_state: SessionState) -> C12Result<()> {
        use SessionState::*;
        let valid = match (*self, new_state) {
            (_, Disconnected) => true,
            (Disconnected, Identifying) => true,
            (Identifying, Negotiating | SecurityHandshake | SessionActive) => true,
            (Negotiating, SecurityHandshake | SessionActive) => true,
            (SecurityHandshake, SessionActive) => true,
            (SessionActive, Terminating) => true,
            // failed transaction keeps the session
            (SessionActive, SessionActive) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(C12Error::InvalidState(format!(
                "Invalid state transition: {} -> {}",
                self.as_str(),
                new_state.as_str()
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Identifying => "Identifying",
            SessionState::Negotiating => "Negotiating",
            SessionState::SecurityHandshake => "SecurityHandshake",
            SessionState::SessionActive => "SessionActive",
            SessionState::Terminating => "Terminating",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
