//! Twitch identity client library
//!
//! Token refresh and validation against the Twitch identity service, the
//! credential classes the bot manages, and the on-disk mirror of refreshed
//! tokens. This crate knows nothing about caching or scheduling; the
//! `credential-store` crate layers those on top.
//!
//! Credential flow:
//! 1. `OAuthClient::refresh()` mints a `TokenRecord` for a class
//! 2. `OAuthClient::validate()` reports the remaining lifetime of a token
//! 3. `RecordStore::save()` mirrors user and chat records to disk
//! 4. `RecordStore::load()` recovers the latest refresh token after restart

pub mod class;
pub mod constants;
pub mod error;
pub mod limiter;
pub mod record;
pub mod token;

pub use class::{CredentialClass, UnknownClass};
pub use constants::*;
pub use error::{Error, Result};
pub use limiter::RequestLimiter;
pub use record::{RecordStore, TokenRecord};
pub use token::{ClientCredentials, Endpoints, OAuthClient, TokenResponse, Validation};
