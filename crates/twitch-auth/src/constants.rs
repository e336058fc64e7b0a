//! Twitch identity endpoints and request pacing
//!
//! The endpoint URLs are defaults; `Endpoints` lets tests and staging
//! deployments point the client somewhere else.

use std::time::Duration;

/// Token endpoint for client-credentials and refresh-token grants
pub const TOKEN_ENDPOINT: &str = "https://id.twitch.tv/oauth2/token";

/// Introspection endpoint; reports the remaining lifetime of an access token
pub const VALIDATE_ENDPOINT: &str = "https://id.twitch.tv/oauth2/validate";

/// Header carrying the client identifier on validation requests
pub const CLIENT_ID_HEADER: &str = "Client-Id";

/// Minimum spacing between any two outbound identity requests.
/// Applies across all credential classes.
pub const MIN_REQUEST_SPACING: Duration = Duration::from_secs(1);

/// Per-request timeout for identity calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
