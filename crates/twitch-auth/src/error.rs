//! Error types for Twitch identity operations

/// Errors from token exchange, validation and record persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 4xx from the identity service: the refresh token was revoked or
    /// rotated, or the client credentials are wrong. Not retryable until an
    /// operator re-authorizes.
    #[error("upstream rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Network failure, timeout or 5xx. The next scheduled tick retries.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("missing configuration: {0}")]
    ConfigurationMissing(String),
}

impl Error {
    /// Whether the identity service refused the request outright.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }

    /// Short label for metrics and notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Rejected { .. } => "rejected",
            Error::Unavailable(_) => "unavailable",
            Error::InvalidResponse(_) => "invalid_response",
            Error::CredentialParse(_) => "credential_parse",
            Error::Io(_) => "io",
            Error::ConfigurationMissing(_) => "configuration_missing",
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_includes_status_and_body() {
        let err = Error::Rejected {
            status: 400,
            body: r#"{"message":"Invalid refresh token"}"#.into(),
        };
        let text = err.to_string();
        assert!(text.contains("400"), "got: {text}");
        assert!(text.contains("Invalid refresh token"), "got: {text}");
        assert!(err.is_rejected());
    }

    #[test]
    fn kinds_are_distinct_labels() {
        assert_eq!(Error::Unavailable("timeout".into()).kind(), "unavailable");
        assert_eq!(Error::Io("disk full".into()).kind(), "io");
        assert!(!Error::Unavailable("503".into()).is_rejected());
    }
}
