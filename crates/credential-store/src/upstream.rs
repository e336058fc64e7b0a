//! Seam between the credential store and the identity service
//!
//! The store only needs "mint a token" and "how long has this token left".
//! `OAuthClient` is the production implementation; tests substitute counting
//! stubs.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn TokenUpstream>`).

use std::future::Future;
use std::pin::Pin;

use twitch_auth::{CredentialClass, OAuthClient, TokenRecord, Validation};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of fresh tokens for the store.
pub trait TokenUpstream: Send + Sync {
    /// Whether client credentials exist for `class`.
    fn is_configured(&self, class: CredentialClass) -> bool;

    /// Mint a new token. `issued_at` is the store's clock reading in unix ms.
    fn refresh<'a>(
        &'a self,
        class: CredentialClass,
        refresh_token: Option<&'a str>,
        issued_at: u64,
    ) -> BoxFuture<'a, twitch_auth::Result<TokenRecord>>;

    /// Introspect an access token.
    fn validate<'a>(
        &'a self,
        class: CredentialClass,
        access_token: &'a str,
    ) -> BoxFuture<'a, twitch_auth::Result<Validation>>;
}

impl TokenUpstream for OAuthClient {
    fn is_configured(&self, class: CredentialClass) -> bool {
        OAuthClient::is_configured(self, class)
    }

    fn refresh<'a>(
        &'a self,
        class: CredentialClass,
        refresh_token: Option<&'a str>,
        issued_at: u64,
    ) -> BoxFuture<'a, twitch_auth::Result<TokenRecord>> {
        Box::pin(OAuthClient::refresh(self, class, refresh_token, issued_at))
    }

    fn validate<'a>(
        &'a self,
        class: CredentialClass,
        access_token: &'a str,
    ) -> BoxFuture<'a, twitch_auth::Result<Validation>> {
        Box::pin(OAuthClient::validate(self, class, access_token))
    }
}
