use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        // Storage triggers abort with an "immutable:" prefix; surface those as their own kind.
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message();
            if let Some(reason) = message.strip_prefix(IMMUTABLE_TRIGGER_PREFIX) {
                return Self::ImmutabilityViolation(reason.trim().to_string());
            }
        }
        Self::Database(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("Migration error: {}", err))
    }
}

/// Prefix used by the `RAISE(ABORT, ...)` messages in the migrations.
pub const IMMUTABLE_TRIGGER_PREFIX: &str = "immutable:";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Secret error: {0}")]
    Secret(String),

    #[error("Immutability violation: {0}")]
    ImmutabilityViolation(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("{} must not be empty", field))
    }

    pub fn metadata_not_object(kind: &str) -> Self {
        Self::Validation(format!("metadata must be a JSON object, got {}", kind))
    }

    pub fn missing_secret_version(version: i64) -> Self {
        Self::Secret(format!("secret version {} is not registered", version))
    }

    pub fn insecure_secret(version: i64) -> Self {
        Self::Secret(format!(
            "secret version {} resolves to an empty or placeholder value",
            version
        ))
    }

    pub fn verification_in_progress(partition_key: &str) -> Self {
        Self::ConcurrencyConflict(format!(
            "incremental verification already running for partition {}",
            partition_key
        ))
    }
}
