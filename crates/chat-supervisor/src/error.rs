//! Error types for the chat connection

use std::time::Duration;

/// Errors from a connect attempt or a chat operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No chat token could be obtained
    #[error("chat token unavailable: {0}")]
    Token(String),

    #[error("chat transport error: {0}")]
    Transport(String),

    /// The chat server refused the login
    #[error("chat login rejected: {0}")]
    Rejected(String),

    #[error("chat handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("not connected to chat")]
    NotConnected,

    #[error("connection supervisor has stopped")]
    SupervisorGone,
}

impl Error {
    /// Whether a failed attempt should back off on the clean schedule.
    /// Refused logins and timeouts are clean; transport errors are not.
    pub fn is_clean_failure(&self) -> bool {
        matches!(
            self,
            Error::Token(_) | Error::Rejected(_) | Error::Timeout(_)
        )
    }
}

/// Result alias for chat operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_classification() {
        assert!(Error::Rejected("Login authentication failed".into()).is_clean_failure());
        assert!(Error::Timeout(Duration::from_secs(15)).is_clean_failure());
        assert!(!Error::Transport("connection reset".into()).is_clean_failure());
    }

    #[test]
    fn timeout_display_shows_duration() {
        let text = Error::Timeout(Duration::from_secs(15)).to_string();
        assert_eq!(text, "chat handshake timed out after 15s");
    }
}
