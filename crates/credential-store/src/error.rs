//! Error types for credential store operations

use twitch_auth::CredentialClass;

/// Errors from `CredentialStore`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The class holds no token at all and the refresh just failed.
    #[error("no usable {class} token: {reason}")]
    NoToken {
        class: CredentialClass,
        reason: String,
    },

    /// No client credentials were configured for the class.
    #[error("{0} credentials are not configured")]
    ConfigurationMissing(CredentialClass),

    #[error(transparent)]
    Upstream(#[from] twitch_auth::Error),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_token_names_the_class() {
        let err = Error::NoToken {
            class: CredentialClass::Chat,
            reason: "upstream rejected request (400): invalid".into(),
        };
        assert!(err.to_string().starts_with("no usable chat token"));
    }

    #[test]
    fn upstream_errors_pass_through_display() {
        let err: Error = twitch_auth::Error::Unavailable("timeout".into()).into();
        assert_eq!(err.to_string(), "upstream unavailable: timeout");
    }
}
