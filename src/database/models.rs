//! Row types as stored in SQLite, and their conversions into domain types.

use chrono::{DateTime, Utc};

use crate::audit::entry::AuditEntry;
use crate::audit::hasher::EncodingVersion;
use crate::audit::verify::{VerificationCursor, VerificationKind, VerificationRun};
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, sqlx::FromRow)]
pub struct AuditEntryRow {
    pub id: i64,
    pub partition_key: String,
    pub timestamp_micros: i64,
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: String,
    pub prev_hash: String,
    pub hash: String,
    pub secret_version: i64,
    pub encoding_version: Option<i64>,
}

pub const AUDIT_ENTRY_COLUMNS: &str = "id, partition_key, timestamp_micros, actor_id, action, \
     resource_type, resource_id, metadata, prev_hash, hash, secret_version, encoding_version";

impl TryFrom<AuditEntryRow> for AuditEntry {
    type Error = LedgerError;

    fn try_from(row: AuditEntryRow) -> LedgerResult<Self> {
        Ok(AuditEntry {
            id: row.id,
            partition_key: row.partition_key,
            timestamp: micros_to_datetime(row.timestamp_micros)?,
            actor_id: row.actor_id,
            action: row.action,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            // Unparseable metadata keeps its raw text, so verification reports a hash
            // mismatch for the row instead of aborting the scan.
            metadata: serde_json::from_str(&row.metadata)
                .unwrap_or(serde_json::Value::String(row.metadata)),
            prev_hash: row.prev_hash,
            hash: row.hash,
            secret_version: row.secret_version,
            encoding_version: row.encoding_version.map(EncodingVersion::from_stored),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct SecretRow {
    pub version: i64,
    pub secret: Vec<u8>,
    pub created_at: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct PartitionRow {
    pub partition_key: String,
    pub appended_count: i64,
    pub pruned_count: i64,
    pub prune_anchor_id: Option<i64>,
    pub prune_anchor_hash: Option<String>,
    pub prune_anchor_micros: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct CursorRow {
    pub partition_key: String,
    pub last_verified_id: i64,
    pub last_hash: String,
    pub last_timestamp_micros: i64,
    pub verified_at: String,
}

impl TryFrom<CursorRow> for VerificationCursor {
    type Error = LedgerError;

    fn try_from(row: CursorRow) -> LedgerResult<Self> {
        Ok(VerificationCursor {
            partition_key: row.partition_key,
            last_verified_id: row.last_verified_id,
            last_hash: row.last_hash,
            last_timestamp: micros_to_datetime(row.last_timestamp_micros)?,
            verified_at: parse_rfc3339(&row.verified_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RunRow {
    pub id: i64,
    pub kind: String,
    pub partition_key: Option<String>,
    pub intact: bool,
    pub total_entries: i64,
    pub verified_entries: i64,
    pub broken_at_id: Option<i64>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub error: Option<String>,
    pub run_at: String,
}

impl TryFrom<RunRow> for VerificationRun {
    type Error = LedgerError;

    fn try_from(row: RunRow) -> LedgerResult<Self> {
        Ok(VerificationRun {
            id: Some(row.id),
            kind: row.kind.parse::<VerificationKind>()?,
            partition_key: row.partition_key,
            intact: row.intact,
            total_entries: row.total_entries as u64,
            verified_entries: row.verified_entries as u64,
            broken_at_id: row.broken_at_id,
            expected: row.expected,
            actual: row.actual,
            error: row.error,
            run_at: parse_rfc3339(&row.run_at)?,
        })
    }
}

pub fn micros_to_datetime(micros: i64) -> LedgerResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| LedgerError::Database(format!("timestamp out of range: {}", micros)))
}

pub fn parse_rfc3339(value: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Database(format!("invalid timestamp {:?}: {}", value, e)))
}
