//! Credential classes and their lifetime policy
//!
//! Each class expires independently. The refresh window is the lead time
//! before true expiry at which a proactive refresh kicks in; the monitor
//! interval is shorter than the class's shortest observed lifetime so a tick
//! always lands inside the window at least once.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Independently expiring token kinds managed by the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialClass {
    /// App access token minted from client credentials (Helix calls)
    App,
    /// Broadcaster user token (channel points, EventSub)
    User,
    /// Bot account token used to log in to chat
    Chat,
}

impl CredentialClass {
    pub const ALL: [CredentialClass; 3] = [
        CredentialClass::App,
        CredentialClass::User,
        CredentialClass::Chat,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            CredentialClass::App => "app",
            CredentialClass::User => "user",
            CredentialClass::Chat => "chat",
        }
    }

    /// OAuth grant used to mint a new access token for this class.
    pub fn grant_type(&self) -> &'static str {
        match self {
            CredentialClass::App => "client_credentials",
            CredentialClass::User | CredentialClass::Chat => "refresh_token",
        }
    }

    /// Whether the class carries a refresh token (and is therefore persisted).
    pub fn is_refreshable(&self) -> bool {
        !matches!(self, CredentialClass::App)
    }

    pub fn refresh_window(&self) -> Duration {
        match self {
            CredentialClass::App => Duration::from_secs(DAY),
            CredentialClass::User | CredentialClass::Chat => Duration::from_secs(30 * 60),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        match self {
            CredentialClass::App => Duration::from_secs(6 * HOUR),
            CredentialClass::User | CredentialClass::Chat => Duration::from_secs(45 * 60),
        }
    }

    /// File name of the persisted record inside the storage directory.
    pub fn record_file_name(&self) -> &'static str {
        match self {
            CredentialClass::App => "app-token.json",
            CredentialClass::User => "user-token.json",
            CredentialClass::Chat => "chat-token.json",
        }
    }
}

impl fmt::Display for CredentialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown credential class: {0}")]
pub struct UnknownClass(pub String);

impl FromStr for CredentialClass {
    type Err = UnknownClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" => Ok(CredentialClass::App),
            "user" => Ok(CredentialClass::User),
            "chat" => Ok(CredentialClass::Chat),
            other => Err(UnknownClass(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_types_match_oauth_flows() {
        assert_eq!(CredentialClass::App.grant_type(), "client_credentials");
        assert_eq!(CredentialClass::User.grant_type(), "refresh_token");
        assert_eq!(CredentialClass::Chat.grant_type(), "refresh_token");
    }

    #[test]
    fn refresh_windows() {
        assert_eq!(
            CredentialClass::App.refresh_window(),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            CredentialClass::Chat.refresh_window(),
            Duration::from_secs(1_800)
        );
    }

    #[test]
    fn monitor_tick_is_shorter_than_lifetime_minus_window() {
        // Lifetimes the identity service usually grants
        let lifetimes = [
            (CredentialClass::App, Duration::from_secs(60 * 86_400)),
            (CredentialClass::User, Duration::from_secs(4 * 3_600)),
            (CredentialClass::Chat, Duration::from_secs(4 * 3_600)),
        ];
        for (class, lifetime) in lifetimes {
            let usable = lifetime - class.refresh_window();
            assert!(
                class.monitor_interval() < usable,
                "{class}: a tick must land inside the refresh window"
            );
        }
    }

    #[test]
    fn only_app_is_not_refreshable() {
        assert!(!CredentialClass::App.is_refreshable());
        assert!(CredentialClass::User.is_refreshable());
        assert!(CredentialClass::Chat.is_refreshable());
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Chat".parse::<CredentialClass>(), Ok(CredentialClass::Chat));
        assert_eq!(" app ".parse::<CredentialClass>(), Ok(CredentialClass::App));
        assert_eq!(
            "bot".parse::<CredentialClass>(),
            Err(UnknownClass("bot".into()))
        );
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&CredentialClass::User).unwrap();
        assert_eq!(json, "\"user\"");
    }
}
