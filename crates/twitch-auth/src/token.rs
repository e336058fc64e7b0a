//! Token refresh and validation against the Twitch identity service
//!
//! Two interactions:
//! 1. Refresh: POST to the token endpoint with the class's grant type. App
//!    tokens are minted from client credentials; user and chat tokens use
//!    their refresh token.
//! 2. Validate: GET the validate endpoint with the access token as a bearer
//!    credential. The response reports how long the token has left.
//!
//! Neither call retries. A rejection (4xx) means an operator must
//! re-authorize; anything else is treated as transient and left to the
//! next scheduled tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::class::CredentialClass;
use crate::constants::{
    CLIENT_ID_HEADER, MIN_REQUEST_SPACING, REQUEST_TIMEOUT, TOKEN_ENDPOINT, VALIDATE_ENDPOINT,
};
use crate::error::{Error, Result};
use crate::limiter::RequestLimiter;
use crate::record::TokenRecord;

/// Client id and secret registered with the identity service.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Secret<String>,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: Secret<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }
}

/// Identity service URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub token_url: String,
    pub validate_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token_url: TOKEN_ENDPOINT.to_owned(),
            validate_url: VALIDATE_ENDPOINT.to_owned(),
        }
    }
}

/// Response from the token endpoint for both grant types.
///
/// `expires_in` is a delta in seconds from the response time. Client
/// credential grants carry no refresh token.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<Vec<String>>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Response from the validate endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Validation {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Seconds of lifetime left on the validated token
    pub expires_in: u64,
}

/// HTTP client for the identity service.
///
/// Every request, whatever the class, goes through the same
/// `RequestLimiter`, so refreshes and validations for different classes
/// never burst.
pub struct OAuthClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    credentials: HashMap<CredentialClass, ClientCredentials>,
    limiter: Arc<RequestLimiter>,
}

impl OAuthClient {
    pub fn new(endpoints: Endpoints) -> Result<Self> {
        Self::with_limiter(endpoints, Arc::new(RequestLimiter::new(MIN_REQUEST_SPACING)))
    }

    pub fn with_limiter(endpoints: Endpoints, limiter: Arc<RequestLimiter>) -> Result<Self> {
        Self::build(endpoints, limiter, REQUEST_TIMEOUT)
    }

    fn build(endpoints: Endpoints, limiter: Arc<RequestLimiter>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Unavailable(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoints,
            credentials: HashMap::new(),
            limiter,
        })
    }

    /// Register the application credentials used for `class`.
    ///
    /// App and user tokens normally share the broadcaster application; the
    /// chat token may belong to a separate bot application.
    pub fn with_credentials(mut self, class: CredentialClass, creds: ClientCredentials) -> Self {
        self.credentials.insert(class, creds);
        self
    }

    pub fn is_configured(&self, class: CredentialClass) -> bool {
        self.credentials.contains_key(&class)
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn credentials_for(&self, class: CredentialClass) -> Result<&ClientCredentials> {
        self.credentials.get(&class).ok_or_else(|| {
            Error::ConfigurationMissing(format!("no client credentials for {class} tokens"))
        })
    }

    /// Mint a new access token for `class`.
    ///
    /// `issued_at` (unix ms) anchors the returned record's expiry. When the
    /// response omits a refresh token, the one passed in is carried over.
    pub async fn refresh(
        &self,
        class: CredentialClass,
        refresh_token: Option<&str>,
        issued_at: u64,
    ) -> Result<TokenRecord> {
        let creds = self.credentials_for(class)?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", class.grant_type()),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.expose().as_str()),
        ];
        if class.is_refreshable() {
            let rt = refresh_token.filter(|t| !t.is_empty()).ok_or_else(|| {
                Error::ConfigurationMissing(format!("no refresh token for {class} tokens"))
            })?;
            form.push(("refresh_token", rt));
        }

        self.limiter.acquire().await;
        debug!(class = %class, "requesting token refresh");

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("token refresh request failed: {e}")))?;

        let response = check_status(response, "token refresh").await?;
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("invalid refresh response: {e}")))?;

        let carried = token
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| refresh_token.map(str::to_owned));
        let carried = if class.is_refreshable() { carried } else { None };

        TokenRecord::new(class, token.access_token, carried, issued_at, token.expires_in)
    }

    /// Ask the identity service how long `access_token` has left.
    pub async fn validate(&self, class: CredentialClass, access_token: &str) -> Result<Validation> {
        let creds = self.credentials_for(class)?;

        self.limiter.acquire().await;
        debug!(class = %class, "validating token");

        let response = self
            .http
            .get(&self.endpoints.validate_url)
            .bearer_auth(access_token)
            .header(CLIENT_ID_HEADER, &creds.client_id)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("token validation request failed: {e}")))?;

        let response = check_status(response, "token validation").await?;
        response
            .json::<Validation>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("invalid validation response: {e}")))
    }
}

/// Map non-success statuses onto the error taxonomy: 4xx is a rejection,
/// everything else is transient.
async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));

    if status.is_client_error() {
        warn!(status = status.as_u16(), "{what} rejected");
        return Err(Error::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    Err(Error::Unavailable(format!("{what} returned {status}: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Form;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Seen {
        forms: Mutex<Vec<HashMap<String, String>>>,
        headers: Mutex<Vec<HeaderMap>>,
    }

    async fn stub_server(
        token_status: StatusCode,
        token_body: &'static str,
        validate_status: StatusCode,
        validate_body: &'static str,
    ) -> (Endpoints, Arc<Seen>) {
        let seen = Arc::new(Seen::default());
        let app = axum::Router::new()
            .route(
                "/oauth2/token",
                post(
                    move |State(seen): State<Arc<Seen>>,
                          Form(form): Form<HashMap<String, String>>| async move {
                        seen.forms.lock().unwrap().push(form);
                        (token_status, token_body)
                    },
                ),
            )
            .route(
                "/oauth2/validate",
                get(
                    move |State(seen): State<Arc<Seen>>, headers: HeaderMap| async move {
                        seen.headers.lock().unwrap().push(headers);
                        (validate_status, validate_body)
                    },
                ),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let endpoints = Endpoints {
            token_url: format!("http://{addr}/oauth2/token"),
            validate_url: format!("http://{addr}/oauth2/validate"),
        };
        (endpoints, seen)
    }

    fn client(endpoints: Endpoints) -> OAuthClient {
        let limiter = Arc::new(RequestLimiter::new(Duration::from_millis(1)));
        let creds = ClientCredentials::new("cid", Secret::new("csecret".to_owned()));
        OAuthClient::with_limiter(endpoints, limiter)
            .unwrap()
            .with_credentials(CredentialClass::App, creds.clone())
            .with_credentials(CredentialClass::Chat, creds)
    }

    #[test]
    fn token_response_without_refresh_token_deserializes() {
        let json = r#"{"access_token":"at_app","expires_in":5184000,"token_type":"bearer"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_app");
        assert!(token.refresh_token.is_none());
        assert_eq!(token.expires_in, 5_184_000);
    }

    #[test]
    fn default_endpoints_point_at_twitch() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.token_url, "https://id.twitch.tv/oauth2/token");
        assert_eq!(endpoints.validate_url, "https://id.twitch.tv/oauth2/validate");
    }

    #[tokio::test]
    async fn app_refresh_uses_client_credentials_grant() {
        let (endpoints, seen) = stub_server(
            StatusCode::OK,
            r#"{"access_token":"at_app","expires_in":5184000,"token_type":"bearer"}"#,
            StatusCode::OK,
            "{}",
        )
        .await;

        let record = client(endpoints)
            .refresh(CredentialClass::App, None, 1_000)
            .await
            .unwrap();

        assert_eq!(record.access_token, "at_app");
        assert!(record.refresh_token.is_none());
        assert_eq!(record.expires_at, 1_000 + 5_184_000 * 1000);

        let forms = seen.forms.lock().unwrap();
        assert_eq!(forms[0]["grant_type"], "client_credentials");
        assert_eq!(forms[0]["client_id"], "cid");
        assert_eq!(forms[0]["client_secret"], "csecret");
        assert!(!forms[0].contains_key("refresh_token"));
    }

    #[tokio::test]
    async fn chat_refresh_sends_refresh_token_and_keeps_rotated_one() {
        let (endpoints, seen) = stub_server(
            StatusCode::OK,
            r#"{"access_token":"at_new","refresh_token":"rt_new","expires_in":14400,"scope":["chat:read","chat:edit"]}"#,
            StatusCode::OK,
            "{}",
        )
        .await;

        let record = client(endpoints)
            .refresh(CredentialClass::Chat, Some("rt_old"), 0)
            .await
            .unwrap();

        assert_eq!(record.refresh_token.as_deref(), Some("rt_new"));
        assert_eq!(record.expires_at, 14_400_000);
        let forms = seen.forms.lock().unwrap();
        assert_eq!(forms[0]["grant_type"], "refresh_token");
        assert_eq!(forms[0]["refresh_token"], "rt_old");
    }

    #[tokio::test]
    async fn missing_refresh_token_in_response_keeps_previous() {
        let (endpoints, _) = stub_server(
            StatusCode::OK,
            r#"{"access_token":"at_new","expires_in":14400}"#,
            StatusCode::OK,
            "{}",
        )
        .await;

        let record = client(endpoints)
            .refresh(CredentialClass::Chat, Some("rt_keep"), 0)
            .await
            .unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("rt_keep"));
    }

    #[tokio::test]
    async fn bad_request_is_rejected() {
        let (endpoints, _) = stub_server(
            StatusCode::BAD_REQUEST,
            r#"{"status":400,"message":"Invalid refresh token"}"#,
            StatusCode::OK,
            "{}",
        )
        .await;

        let err = client(endpoints)
            .refresh(CredentialClass::Chat, Some("rt_revoked"), 0)
            .await
            .unwrap_err();
        assert!(err.is_rejected(), "got: {err:?}");
        assert!(err.to_string().contains("Invalid refresh token"));
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let (endpoints, _) = stub_server(
            StatusCode::SERVICE_UNAVAILABLE,
            "down for maintenance",
            StatusCode::OK,
            "{}",
        )
        .await;

        let err = client(endpoints)
            .refresh(CredentialClass::App, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn zero_lifetime_is_invalid_response() {
        let (endpoints, _) = stub_server(
            StatusCode::OK,
            r#"{"access_token":"at","expires_in":0}"#,
            StatusCode::OK,
            "{}",
        )
        .await;

        let err = client(endpoints)
            .refresh(CredentialClass::App, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let endpoints = Endpoints {
            token_url: "http://127.0.0.1:1/oauth2/token".into(),
            validate_url: "http://127.0.0.1:1/oauth2/validate".into(),
        };
        let err = client(endpoints)
            .refresh(CredentialClass::App, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn unconfigured_class_is_configuration_missing() {
        let err = client(Endpoints::default())
            .refresh(CredentialClass::User, Some("rt"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationMissing(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn refreshable_class_without_refresh_token_is_configuration_missing() {
        let err = client(Endpoints::default())
            .refresh(CredentialClass::Chat, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationMissing(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn validate_sends_bearer_and_client_id() {
        let (endpoints, seen) = stub_server(
            StatusCode::OK,
            "{}",
            StatusCode::OK,
            r#"{"client_id":"cid","login":"summonbot","scopes":["chat:read"],"user_id":"42","expires_in":120}"#,
        )
        .await;

        let validation = client(endpoints)
            .validate(CredentialClass::Chat, "at_live")
            .await
            .unwrap();
        assert_eq!(validation.expires_in, 120);
        assert_eq!(validation.login.as_deref(), Some("summonbot"));

        let headers = seen.headers.lock().unwrap();
        assert_eq!(headers[0]["authorization"], "Bearer at_live");
        assert_eq!(headers[0]["client-id"], "cid");
    }

    #[tokio::test]
    async fn validate_unauthorized_is_rejected() {
        let (endpoints, _) = stub_server(
            StatusCode::OK,
            "{}",
            StatusCode::UNAUTHORIZED,
            r#"{"status":401,"message":"invalid access token"}"#,
        )
        .await;

        let err = client(endpoints)
            .validate(CredentialClass::App, "at_dead")
            .await
            .unwrap_err();
        assert!(err.is_rejected());
    }
}
