//! Secret Store
//!
//! Append-only registry of versioned HMAC secrets. Raw key material never leaves
//! the crate: the public surface only exposes version metadata.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::database::models::{parse_rfc3339, SecretRow};
use crate::error::{LedgerError, LedgerResult};

/// Minimum length accepted for newly registered secrets.
pub const MIN_SECRET_LEN: usize = 32;

/// Well-known values that must never be used as key material.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "change-me",
    "change_me",
    "change_me_in_production",
    "secret",
    "password",
    "default",
    "placeholder",
    "test",
    "your_secret_here",
    "insecure",
    "dev-secret",
];

/// True for known placeholder values (case-insensitive, surrounding whitespace ignored).
pub fn is_placeholder(value: &[u8]) -> bool {
    match std::str::from_utf8(value) {
        Ok(text) => {
            let normalized = text.trim().to_ascii_lowercase();
            PLACEHOLDER_SECRETS.iter().any(|p| *p == normalized)
        }
        Err(_) => false,
    }
}

fn is_unusable(value: &[u8]) -> bool {
    value.iter().all(|b| b.is_ascii_whitespace()) || is_placeholder(value)
}

/// Resolved key material for one version.
#[derive(Clone)]
pub struct Secret {
    version: i64,
    bytes: Arc<[u8]>,
}

impl Secret {
    pub(crate) fn new(version: i64, bytes: Vec<u8>) -> Self {
        Self {
            version,
            bytes: bytes.into(),
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("version", &self.version)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Public view of a registered version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersionInfo {
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SecretStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<i64, Secret>>>,
}

impl SecretStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolve a pinned version, or the latest one when `version` is `None`.
    ///
    /// Fails closed: an unregistered, empty or placeholder secret is an error.
    pub(crate) async fn get(&self, version: Option<i64>) -> LedgerResult<Secret> {
        let version = match version {
            Some(v) => v,
            None => self
                .latest_version()
                .await?
                .ok_or_else(|| LedgerError::Secret("no secret versions registered".to_string()))?,
        };

        if let Some(secret) = self.cache.read().await.get(&version) {
            return Ok(secret.clone());
        }

        let row = sqlx::query_as::<_, SecretRow>(
            "SELECT version, secret, created_at FROM ledger_secrets WHERE version = ?",
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::missing_secret_version(version))?;

        if is_unusable(&row.secret) {
            warn!(version, "Refusing to use empty or placeholder secret");
            return Err(LedgerError::insecure_secret(version));
        }

        let secret = Secret::new(row.version, row.secret);
        // Versions are immutable once written, so a cached copy never goes stale.
        self.cache.write().await.insert(version, secret.clone());
        Ok(secret)
    }

    /// The secret new appends are sealed with.
    pub(crate) async fn latest(&self) -> LedgerResult<Secret> {
        self.get(None).await
    }

    pub async fn latest_version(&self) -> LedgerResult<Option<i64>> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM ledger_secrets")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// Register a new version. Existing versions are never touched.
    pub async fn rotate(&self, new_secret: &[u8]) -> LedgerResult<i64> {
        if is_unusable(new_secret) {
            return Err(LedgerError::Secret(
                "refusing to register an empty or placeholder secret".to_string(),
            ));
        }
        if new_secret.len() < MIN_SECRET_LEN {
            return Err(LedgerError::Secret(format!(
                "secret must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                new_secret.len()
            )));
        }

        let version: i64 = sqlx::query_scalar(
            "INSERT INTO ledger_secrets (version, secret, created_at) \
             SELECT COALESCE(MAX(version), 0) + 1, ?, ? FROM ledger_secrets \
             RETURNING version",
        )
        .bind(new_secret)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        info!(version, "Registered new ledger secret version");
        Ok(version)
    }

    /// Make sure at least one version exists, seeding it from configuration if needed.
    pub async fn bootstrap(&self, initial: Option<&str>) -> LedgerResult<i64> {
        if let Some(version) = self.latest_version().await? {
            // Resolve it once so a placeholder left in storage fails startup, not the first append.
            self.get(Some(version)).await?;
            return Ok(version);
        }

        match initial {
            Some(secret) => self.rotate(secret.as_bytes()).await,
            None => Err(LedgerError::Secret(
                "no secret versions registered and no initial secret configured".to_string(),
            )),
        }
    }

    pub async fn versions(&self) -> LedgerResult<Vec<SecretVersionInfo>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT version, created_at FROM ledger_secrets ORDER BY version ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(version, created_at)| {
                Ok(SecretVersionInfo {
                    version,
                    created_at: parse_rfc3339(&created_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    const GOOD: &[u8] = b"0123456789abcdef0123456789abcdef";
    const OTHER: &[u8] = b"fedcba9876543210fedcba9876543210";

    #[test]
    fn test_placeholder_detection() {
        assert!(is_placeholder(b"changeme"));
        assert!(is_placeholder(b"  CHANGE_ME_IN_PRODUCTION "));
        assert!(!is_placeholder(GOOD));
        assert!(is_unusable(b""));
        assert!(is_unusable(b"   "));
    }

    #[test]
    fn test_debug_redacts_material() {
        let secret = Secret::new(3, GOOD.to_vec());
        let rendered = format!("{:?}", secret);
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("0123456789"));
    }

    #[tokio::test]
    async fn test_rotate_appends_versions() {
        let db = Database::new_in_memory().await.unwrap();
        let store = SecretStore::new(db.pool().clone());

        assert_eq!(store.latest_version().await.unwrap(), None);
        assert_eq!(store.rotate(GOOD).await.unwrap(), 1);
        assert_eq!(store.rotate(OTHER).await.unwrap(), 2);

        let latest = store.latest().await.unwrap();
        assert_eq!(latest.version(), 2);
        assert_eq!(latest.expose(), OTHER);

        let first = store.get(Some(1)).await.unwrap();
        assert_eq!(first.expose(), GOOD);

        let versions = store.versions().await.unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_rotate_rejects_weak_secrets() {
        let db = Database::new_in_memory().await.unwrap();
        let store = SecretStore::new(db.pool().clone());

        assert!(matches!(store.rotate(b"").await, Err(LedgerError::Secret(_))));
        assert!(matches!(store.rotate(b"changeme").await, Err(LedgerError::Secret(_))));
        assert!(matches!(store.rotate(b"short-but-real").await, Err(LedgerError::Secret(_))));
        assert_eq!(store.latest_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_fails_closed() {
        let db = Database::new_in_memory().await.unwrap();
        let store = SecretStore::new(db.pool().clone());

        assert!(matches!(store.get(Some(1)).await, Err(LedgerError::Secret(_))));
        assert!(matches!(store.latest().await, Err(LedgerError::Secret(_))));

        // A placeholder planted directly in storage is never used.
        sqlx::query("INSERT INTO ledger_secrets (version, secret, created_at) VALUES (1, ?, ?)")
            .bind(b"changeme".to_vec())
            .bind(Utc::now().to_rfc3339())
            .execute(db.pool())
            .await
            .unwrap();
        assert!(matches!(store.get(Some(1)).await, Err(LedgerError::Secret(_))));
    }

    #[tokio::test]
    async fn test_bootstrap() {
        let db = Database::new_in_memory().await.unwrap();
        let store = SecretStore::new(db.pool().clone());

        assert!(store.bootstrap(None).await.is_err());
        assert!(store.bootstrap(Some("changeme")).await.is_err());

        let seed = std::str::from_utf8(GOOD).unwrap();
        assert_eq!(store.bootstrap(Some(seed)).await.unwrap(), 1);
        // Already seeded: configuration is ignored and nothing new is registered.
        assert_eq!(store.bootstrap(None).await.unwrap(), 1);
        assert_eq!(store.versions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_rejects_secret_modification() {
        let db = Database::new_in_memory().await.unwrap();
        let store = SecretStore::new(db.pool().clone());
        store.rotate(GOOD).await.unwrap();

        let result: LedgerResult<_> = sqlx::query("UPDATE ledger_secrets SET secret = ? WHERE version = 1")
            .bind(OTHER.to_vec())
            .execute(db.pool())
            .await
            .map_err(LedgerError::from);
        assert!(matches!(result, Err(LedgerError::ImmutabilityViolation(_))));
    }
}
