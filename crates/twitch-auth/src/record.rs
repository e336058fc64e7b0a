//! Token records and their durable mirror
//!
//! A `TokenRecord` is what one successful exchange produces. Records are never
//! edited in place: a refresh builds a new one and the caller swaps it in.
//!
//! `RecordStore` keeps one JSON file per refreshable class so a restart can
//! pick up the most recent refresh token instead of the (possibly already
//! rotated) one from configuration. All writes use temp-file + rename so a
//! crash mid-write leaves the previous file intact.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::class::CredentialClass;
use crate::error::{Error, Result};

/// One access token (plus refresh token for user-bound classes).
///
/// `issued_at` and `expires_at` are unix timestamps in milliseconds.
/// `expires_at > issued_at` always holds.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub class: CredentialClass,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl TokenRecord {
    /// Build a record from an `expires_in` delta (seconds) measured from
    /// `issued_at`. A zero lifetime would violate the expiry invariant.
    pub fn new(
        class: CredentialClass,
        access_token: String,
        refresh_token: Option<String>,
        issued_at: u64,
        expires_in_secs: u64,
    ) -> Result<Self> {
        if expires_in_secs == 0 {
            return Err(Error::InvalidResponse(format!(
                "{class} token issued with zero lifetime"
            )));
        }
        if access_token.is_empty() {
            return Err(Error::InvalidResponse(format!(
                "{class} token response had an empty access_token"
            )));
        }
        Ok(Self {
            class,
            access_token,
            refresh_token,
            issued_at,
            expires_at: issued_at.saturating_add(expires_in_secs.saturating_mul(1000)),
        })
    }

    /// Milliseconds of lifetime left at `now`, zero once expired.
    pub fn remaining_millis(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("class", &self.class)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// On-disk shape of a persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCredential {
    access_token: String,
    refresh_token: String,
    /// When the token was issued, unix milliseconds
    updated_at: u64,
    /// Expiration, unix milliseconds
    expires_at: u64,
}

/// Durable per-class token files under one directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, class: CredentialClass) -> PathBuf {
        self.dir.join(class.record_file_name())
    }

    /// Persist a record, replacing any previous one for the same class.
    ///
    /// Only refreshable classes are stored; the record must carry its
    /// refresh token.
    pub async fn save(&self, record: &TokenRecord) -> Result<()> {
        let class = record.class;
        if !class.is_refreshable() {
            return Err(Error::CredentialParse(format!(
                "{class} tokens are not persisted"
            )));
        }
        let refresh_token = record.refresh_token.clone().ok_or_else(|| {
            Error::CredentialParse(format!("{class} record has no refresh token"))
        })?;

        let persisted = PersistedCredential {
            access_token: record.access_token.clone(),
            refresh_token,
            updated_at: record.issued_at,
            expires_at: record.expires_at,
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Io(format!("creating token directory: {e}")))?;

        write_atomic(&self.path_for(class), &persisted).await
    }

    /// Read the persisted record for `class`, if there is one.
    ///
    /// A missing file is `Ok(None)`. A file that fails to parse or violates
    /// the record invariants is an error; callers treat it as absent.
    pub async fn load(&self, class: CredentialClass) -> Result<Option<TokenRecord>> {
        let path = self.path_for(class);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(class = %class, path = %path.display(), "no persisted token");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(format!("reading token file: {e}"))),
        };

        let persisted: PersistedCredential = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing {}: {e}", path.display())))?;

        if persisted.access_token.is_empty() || persisted.refresh_token.is_empty() {
            return Err(Error::CredentialParse(format!(
                "{} has an empty token field",
                path.display()
            )));
        }
        if persisted.expires_at <= persisted.updated_at {
            return Err(Error::CredentialParse(format!(
                "{} expires before it was issued",
                path.display()
            )));
        }

        info!(class = %class, path = %path.display(), "loaded persisted token");
        Ok(Some(TokenRecord {
            class,
            access_token: persisted.access_token,
            refresh_token: Some(persisted.refresh_token),
            issued_at: persisted.updated_at,
            expires_at: persisted.expires_at,
        }))
    }
}

/// Write a token file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. Sets permissions to 0600 since the file holds live tokens.
async fn write_atomic(path: &Path, data: &PersistedCredential) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing token: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("token.json");

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token");
    Ok(())
}
