//! Cached credentials with refresh-ahead-of-expiry
//!
//! One slot per credential class. Each slot pairs a refresh mutex with a
//! short-lived `RwLock` over the cached state:
//! - the mutex serializes upstream calls for the class, so N concurrent
//!   callers on a stale cache produce exactly one refresh
//! - the `RwLock` is never held across network I/O, so readers (the fast
//!   path and `status_report`) never wait on a refresh in flight
//!
//! Classes are independent: a slow App refresh never delays a Chat caller.
//!
//! A failed refresh holds the class: foreground callers get the cached
//! (degraded) token or `NoToken` without contacting upstream until the
//! monitor's next tick or an operator `force_refresh` retries it.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{Notification, NotificationSink};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use twitch_auth::{CredentialClass, RecordStore, TokenRecord};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::upstream::TokenUpstream;

const COMPONENT: &str = "credential-store";

/// Live state for one class. Written only while the class's refresh mutex is
/// held; `status_report` reads it without the mutex.
#[derive(Debug, Default, Clone)]
struct CachedCredential {
    access_token: Option<String>,
    refresh_token: Option<String>,
    issued_at: Option<u64>,
    /// `None` when the token came from configuration and was never checked
    expires_at: Option<u64>,
    last_refreshed_at: Option<u64>,
    last_validated_at: Option<u64>,
    degraded: bool,
    invalid: bool,
    last_error: Option<String>,
    /// Set when the last refresh failed; cleared by the next success
    failed_at: Option<u64>,
}

impl CachedCredential {
    fn replace_with(&mut self, record: &TokenRecord, now: u64) {
        let refresh_token = record
            .refresh_token
            .clone()
            .or_else(|| self.refresh_token.take());
        *self = CachedCredential {
            access_token: Some(record.access_token.clone()),
            refresh_token,
            issued_at: Some(record.issued_at),
            expires_at: Some(record.expires_at),
            last_refreshed_at: Some(now),
            last_validated_at: Some(now),
            degraded: false,
            invalid: false,
            last_error: None,
            failed_at: None,
        };
    }

    /// Answer for a class whose last refresh failed, without calling
    /// upstream.
    fn held_token(&self, class: CredentialClass) -> Result<IssuedToken> {
        match &self.access_token {
            Some(access_token) => Ok(IssuedToken {
                access_token: access_token.clone(),
                expires_at: self.expires_at,
                degraded: true,
            }),
            None => Err(Error::NoToken {
                class,
                reason: self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "refresh failed".to_owned()),
            }),
        }
    }

    fn fresh_token(&self, class: CredentialClass, now: u64) -> Option<IssuedToken> {
        let access = self.access_token.as_ref()?;
        let expires_at = self.expires_at?;
        if now.saturating_add(window_millis(class)) < expires_at {
            Some(IssuedToken {
                access_token: access.clone(),
                expires_at: Some(expires_at),
                degraded: false,
            })
        } else {
            None
        }
    }
}

#[derive(Default)]
struct ClassSlot {
    refresh_lock: Mutex<()>,
    cache: RwLock<CachedCredential>,
}

/// Token handed to callers.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: Option<u64>,
    /// The last refresh failed and this is the previous, possibly stale,
    /// token. Callers may still try it.
    pub degraded: bool,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Per-class view for the operator API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClassStatus {
    pub valid: bool,
    pub configured: bool,
    pub degraded: bool,
    pub expires_at: Option<u64>,
    pub remaining_secs: Option<u64>,
    pub needs_refresh: bool,
    pub last_refreshed_at: Option<u64>,
    pub last_validated_at: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: u64,
    pub classes: BTreeMap<CredentialClass, ClassStatus>,
}

impl StatusReport {
    /// Every configured class currently holds a usable token.
    pub fn all_configured_valid(&self) -> bool {
        self.classes
            .values()
            .filter(|s| s.configured)
            .all(|s| s.valid)
    }
}

/// Credential cache for the App, User and Chat classes.
pub struct CredentialStore {
    upstream: Arc<dyn TokenUpstream>,
    records: Option<RecordStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    app: ClassSlot,
    user: ClassSlot,
    chat: ClassSlot,
}

impl CredentialStore {
    pub fn new(
        upstream: Arc<dyn TokenUpstream>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            upstream,
            records: None,
            sink,
            clock,
            app: ClassSlot::default(),
            user: ClassSlot::default(),
            chat: ClassSlot::default(),
        }
    }

    /// Mirror refreshed user and chat tokens to `records`.
    pub fn with_records(mut self, records: RecordStore) -> Self {
        self.records = Some(records);
        self
    }

    /// Seed a class with tokens from configuration. The access token's
    /// expiry is unknown until the first validation.
    pub fn with_seed(
        mut self,
        class: CredentialClass,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Self {
        let cache = self.slot_mut(class).cache.get_mut();
        cache.access_token = access_token.filter(|t| !t.is_empty());
        cache.refresh_token = refresh_token.filter(|t| !t.is_empty());
        self
    }

    fn slot(&self, class: CredentialClass) -> &ClassSlot {
        match class {
            CredentialClass::App => &self.app,
            CredentialClass::User => &self.user,
            CredentialClass::Chat => &self.chat,
        }
    }

    fn slot_mut(&mut self, class: CredentialClass) -> &mut ClassSlot {
        match class {
            CredentialClass::App => &mut self.app,
            CredentialClass::User => &mut self.user,
            CredentialClass::Chat => &mut self.chat,
        }
    }

    pub fn is_configured(&self, class: CredentialClass) -> bool {
        self.upstream.is_configured(class)
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Whether a token expiring at `expires_at` is inside the class's
    /// refresh window right now.
    pub fn needs_refresh(&self, class: CredentialClass, expires_at: u64) -> bool {
        self.now_millis().saturating_add(window_millis(class)) >= expires_at
    }

    /// Replace seeded tokens with whatever was persisted by a previous run.
    ///
    /// A persisted record is newer than configuration by construction: it is
    /// only written after a successful refresh. Unreadable files are
    /// reported and ignored.
    pub async fn load_persisted(&self) {
        let Some(records) = &self.records else {
            return;
        };
        for class in CredentialClass::ALL {
            if !class.is_refreshable() {
                continue;
            }
            match records.load(class).await {
                Ok(Some(record)) => {
                    let slot = self.slot(class);
                    let _guard = slot.refresh_lock.lock().await;
                    let mut cache = slot.cache.write().await;
                    cache.access_token = Some(record.access_token);
                    cache.refresh_token = record.refresh_token;
                    cache.issued_at = Some(record.issued_at);
                    cache.expires_at = Some(record.expires_at);
                    cache.last_validated_at = None;
                    info!(class = %class, expires_at = record.expires_at, "restored persisted token");
                }
                Ok(None) => {}
                Err(e) => self.report_persistence_failure(class, "load", &e),
            }
        }
    }

    /// Return a token for `class` that is not inside its refresh window,
    /// refreshing if needed.
    ///
    /// Concurrent callers for the same class collapse onto one upstream
    /// call. If the refresh fails and an older token is cached, it is
    /// returned with `degraded` set. After a failure no further refresh is
    /// attempted here until the monitor or an operator retries.
    pub async fn get_valid_token(&self, class: CredentialClass) -> Result<IssuedToken> {
        self.obtain(class, false).await
    }

    /// Monitor-side variant of `get_valid_token` that retries a held class.
    pub(crate) async fn scheduled_token(&self, class: CredentialClass) -> Result<IssuedToken> {
        self.obtain(class, true).await
    }

    async fn obtain(&self, class: CredentialClass, retry_failed: bool) -> Result<IssuedToken> {
        if !self.is_configured(class) {
            return Err(Error::ConfigurationMissing(class));
        }
        let slot = self.slot(class);

        if let Some(token) = slot.cache.read().await.fresh_token(class, self.now_millis()) {
            return Ok(token);
        }

        let _guard = slot.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(token) = slot.cache.read().await.fresh_token(class, self.now_millis()) {
            debug!(class = %class, "token refreshed by concurrent caller");
            return Ok(token);
        }

        if !retry_failed {
            let cache = slot.cache.read().await;
            if cache.failed_at.is_some() {
                debug!(class = %class, "last refresh failed, holding until next scheduled attempt");
                return cache.held_token(class);
            }
        }

        if let Some(token) = self.accept_if_validated(slot, class).await {
            return Ok(token);
        }

        self.refresh_locked(slot, class).await
    }

    /// Refresh `class` unconditionally. Returns whether the upstream
    /// exchange succeeded.
    pub async fn force_refresh(&self, class: CredentialClass) -> bool {
        if !self.is_configured(class) {
            warn!(class = %class, "force refresh requested for unconfigured class");
            return false;
        }
        let slot = self.slot(class);
        let _guard = slot.refresh_lock.lock().await;
        info!(class = %class, "forcing token refresh");
        matches!(self.refresh_locked(slot, class).await, Ok(t) if !t.degraded)
    }

    /// Last known expiry of the cached token.
    pub async fn expiry(&self, class: CredentialClass) -> Option<u64> {
        self.slot(class).cache.read().await.expires_at
    }

    /// Introspect the cached token. A missing, rejected or nearly expired
    /// token falls through to a refresh. Returns whether the class holds a
    /// usable (non-degraded) token afterwards.
    pub async fn validate(&self, class: CredentialClass) -> Result<bool> {
        if !self.is_configured(class) {
            return Err(Error::ConfigurationMissing(class));
        }
        let slot = self.slot(class);
        let _guard = slot.refresh_lock.lock().await;

        let (access, expires_at) = {
            let cache = slot.cache.read().await;
            (cache.access_token.clone(), cache.expires_at)
        };
        // Checked by a concurrent caller while we waited for the lock
        if access.is_some() && expires_at.is_some_and(|e| !self.needs_refresh(class, e)) {
            debug!(class = %class, "token already validated");
            return Ok(true);
        }

        let Some(access) = access else {
            debug!(class = %class, "no cached token to validate, refreshing");
            return Ok(!self.refresh_locked(slot, class).await?.degraded);
        };

        let now = self.now_millis();
        match self.upstream.validate(class, &access).await {
            Ok(validation) => {
                let expires_at = now.saturating_add(validation.expires_in.saturating_mul(1000));
                {
                    let mut cache = slot.cache.write().await;
                    cache.expires_at = Some(expires_at);
                    cache.last_validated_at = Some(now);
                }
                if validation.expires_in.saturating_mul(1000) > window_millis(class) {
                    debug!(class = %class, expires_in = validation.expires_in, "token valid");
                    Ok(true)
                } else {
                    info!(class = %class, expires_in = validation.expires_in, "token close to expiry, refreshing");
                    Ok(!self.refresh_locked(slot, class).await?.degraded)
                }
            }
            Err(e) if e.is_rejected() => {
                info!(class = %class, error = %e, "cached token rejected, refreshing");
                slot.cache.write().await.last_validated_at = Some(now);
                Ok(!self.refresh_locked(slot, class).await?.degraded)
            }
            Err(e) => {
                warn!(class = %class, error = %e, "token validation failed");
                slot.cache.write().await.last_error = Some(e.to_string());
                self.sink.notify(
                    Notification::warning(COMPONENT, format!("{class} token validation failed"))
                        .with_detail(&e),
                );
                Err(Error::Upstream(e))
            }
        }
    }

    /// Snapshot of every class. Never waits on a refresh in flight and
    /// performs no I/O.
    pub async fn status_report(&self) -> StatusReport {
        let now = self.now_millis();
        let mut classes = BTreeMap::new();
        for class in CredentialClass::ALL {
            let cache = self.slot(class).cache.read().await.clone();
            let known_expired = cache.expires_at.is_some_and(|e| e <= now);
            classes.insert(
                class,
                ClassStatus {
                    valid: cache.access_token.is_some() && !cache.invalid && !known_expired,
                    configured: self.is_configured(class),
                    degraded: cache.degraded,
                    expires_at: cache.expires_at,
                    remaining_secs: cache.expires_at.map(|e| e.saturating_sub(now) / 1000),
                    needs_refresh: cache
                        .expires_at
                        .is_none_or(|e| now.saturating_add(window_millis(class)) >= e),
                    last_refreshed_at: cache.last_refreshed_at,
                    last_validated_at: cache.last_validated_at,
                    last_error: cache.last_error,
                },
            );
        }
        StatusReport {
            generated_at: now,
            classes,
        }
    }

    /// Validate a token this process has never checked. Returns it when the
    /// identity service reports more life than the refresh window.
    async fn accept_if_validated(
        &self,
        slot: &ClassSlot,
        class: CredentialClass,
    ) -> Option<IssuedToken> {
        let now = self.now_millis();
        let access = {
            let cache = slot.cache.read().await;
            let unchecked = cache.last_validated_at.is_none();
            let known_expired = cache.expires_at.is_some_and(|e| e <= now);
            match &cache.access_token {
                Some(token) if unchecked && !known_expired => token.clone(),
                _ => return None,
            }
        };

        match self.upstream.validate(class, &access).await {
            Ok(validation) => {
                let lifetime = validation.expires_in.saturating_mul(1000);
                let expires_at = now.saturating_add(lifetime);
                let mut cache = slot.cache.write().await;
                cache.expires_at = Some(expires_at);
                cache.last_validated_at = Some(now);
                if lifetime > window_millis(class) {
                    info!(class = %class, expires_in = validation.expires_in, "seeded token validated");
                    Some(IssuedToken {
                        access_token: access,
                        expires_at: Some(expires_at),
                        degraded: false,
                    })
                } else {
                    info!(class = %class, expires_in = validation.expires_in, "seeded token expires soon, refreshing");
                    None
                }
            }
            Err(e) => {
                debug!(class = %class, error = %e, "seeded token failed validation, refreshing");
                slot.cache.write().await.last_validated_at = Some(now);
                None
            }
        }
    }

    /// Run one upstream refresh. Caller must hold the class's refresh mutex.
    async fn refresh_locked(&self, slot: &ClassSlot, class: CredentialClass) -> Result<IssuedToken> {
        let refresh_token = if class.is_refreshable() {
            let cached = slot.cache.read().await.refresh_token.clone();
            match cached {
                Some(token) => Some(token),
                None => self.persisted_refresh_token(class).await,
            }
        } else {
            None
        };

        let now = self.now_millis();
        match self
            .upstream
            .refresh(class, refresh_token.as_deref(), now)
            .await
        {
            Ok(record) => {
                metrics::counter!("token_refresh_total", "class" => class.label(), "outcome" => "success")
                    .increment(1);
                slot.cache.write().await.replace_with(&record, now);
                info!(
                    class = %class,
                    expires_at = record.expires_at,
                    remaining_secs = record.remaining_millis(now) / 1000,
                    "token refreshed"
                );

                if class.is_refreshable() {
                    self.persist(&record).await;
                }

                Ok(IssuedToken {
                    access_token: record.access_token,
                    expires_at: Some(record.expires_at),
                    degraded: false,
                })
            }
            Err(e) => {
                metrics::counter!("token_refresh_total", "class" => class.label(), "outcome" => e.kind())
                    .increment(1);
                warn!(class = %class, error = %e, "token refresh failed");
                self.sink.notify(
                    Notification::warning(COMPONENT, format!("{class} token refresh failed"))
                        .with_detail(&e),
                );

                let mut cache = slot.cache.write().await;
                cache.last_error = Some(e.to_string());
                cache.failed_at = Some(now);
                match cache.access_token.clone() {
                    Some(access_token) => {
                        cache.degraded = true;
                        Ok(IssuedToken {
                            access_token,
                            expires_at: cache.expires_at,
                            degraded: true,
                        })
                    }
                    None => {
                        cache.invalid = true;
                        Err(Error::NoToken {
                            class,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
    }

    async fn persisted_refresh_token(&self, class: CredentialClass) -> Option<String> {
        let records = self.records.as_ref()?;
        match records.load(class).await {
            Ok(record) => record.and_then(|r| r.refresh_token),
            Err(e) => {
                self.report_persistence_failure(class, "load", &e);
                None
            }
        }
    }

    async fn persist(&self, record: &TokenRecord) {
        let Some(records) = &self.records else {
            return;
        };
        if let Err(e) = records.save(record).await {
            self.report_persistence_failure(record.class, "save", &e);
        }
    }

    fn report_persistence_failure(&self, class: CredentialClass, op: &str, e: &twitch_auth::Error) {
        warn!(class = %class, op, error = %e, "token persistence failed");
        self.sink.notify(
            Notification::warning(COMPONENT, format!("failed to {op} persisted {class} token"))
                .with_detail(e),
        );
    }
}

fn window_millis(class: CredentialClass) -> u64 {
    class.refresh_window().as_millis() as u64
}
