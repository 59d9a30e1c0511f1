//! Audit Ledger
//!
//! Append-only, per-partition hash-chained entry store. Reading the chain head,
//! sealing the new entry and writing it happen as one serialized unit per partition.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::audit::entry::{AuditEntry, NewAuditEntry};
use crate::audit::guard::ConcurrencyGuard;
use crate::audit::hasher::{ChainHasher, EntryFields, CURRENT_ENCODING};
use crate::config::MIN_RETENTION_DAYS;
use crate::database::models::{micros_to_datetime, AuditEntryRow, PartitionRow, AUDIT_ENTRY_COLUMNS};
use crate::database::Database;
use crate::error::{LedgerError, LedgerResult};

/// Position of an entry in chain order within its partition. Orders as chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainPosition {
    pub timestamp_micros: i64,
    pub id: i64,
}

impl AuditEntry {
    pub fn position(&self) -> ChainPosition {
        ChainPosition {
            timestamp_micros: self.timestamp.timestamp_micros(),
            id: self.id,
        }
    }
}

impl AuditEntryRow {
    pub fn position(&self) -> ChainPosition {
        ChainPosition {
            timestamp_micros: self.timestamp_micros,
            id: self.id,
        }
    }
}

/// Where a partition's surviving chain starts after retention pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneAnchor {
    pub entry_id: i64,
    pub hash: String,
    pub timestamp_micros: i64,
}

impl PruneAnchor {
    pub fn position(&self) -> ChainPosition {
        ChainPosition {
            timestamp_micros: self.timestamp_micros,
            id: self.entry_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionPrune {
    pub partition_key: String,
    pub pruned: u64,
    pub anchor_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReport {
    pub cutoff: DateTime<Utc>,
    pub partitions: Vec<PartitionPrune>,
    pub total_pruned: u64,
}

#[derive(Clone)]
pub struct AuditLedger {
    pool: SqlitePool,
    hasher: ChainHasher,
    guard: ConcurrencyGuard,
}

impl AuditLedger {
    pub fn new(database: &Database, hasher: ChainHasher, guard: ConcurrencyGuard) -> Self {
        Self {
            pool: database.pool().clone(),
            hasher,
            guard,
        }
    }

    pub fn hasher(&self) -> &ChainHasher {
        &self.hasher
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Seal and persist a new entry at the head of its partition's chain.
    pub async fn append(&self, new: NewAuditEntry) -> LedgerResult<AuditEntry> {
        let metadata = Value::Object(new.validate()?);
        let secret = self.hasher.secrets().latest().await?;

        let _partition = self.guard.lock_append(&new.partition_key).await;
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // Writing first takes SQLite's write lock before the chain head is read, so no
        // other connection can slip an entry in between the read and the insert.
        sqlx::query(
            "INSERT INTO ledger_partitions (partition_key, appended_count, created_at, last_append_at) \
             VALUES (?, 1, ?, ?) \
             ON CONFLICT(partition_key) DO UPDATE SET \
                 appended_count = appended_count + 1, \
                 last_append_at = excluded.last_append_at",
        )
        .bind(&new.partition_key)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let head: Option<(String, i64)> = sqlx::query_as(
            "SELECT hash, timestamp_micros FROM audit_entries \
             WHERE partition_key = ? \
             ORDER BY timestamp_micros DESC, id DESC LIMIT 1",
        )
        .bind(&new.partition_key)
        .fetch_optional(&mut *tx)
        .await?;

        let (prev_hash, floor_micros) = match head {
            Some(head) => head,
            None => {
                let anchor: Option<(Option<String>, Option<i64>)> = sqlx::query_as(
                    "SELECT prune_anchor_hash, prune_anchor_micros FROM ledger_partitions \
                     WHERE partition_key = ?",
                )
                .bind(&new.partition_key)
                .fetch_optional(&mut *tx)
                .await?;
                match anchor {
                    Some((Some(hash), micros)) => (hash, micros.unwrap_or(i64::MIN)),
                    _ => (String::new(), i64::MIN),
                }
            }
        };

        // Chain order must equal sort order even if the wall clock steps backwards.
        let timestamp_micros = now.timestamp_micros().max(floor_micros);
        let timestamp = micros_to_datetime(timestamp_micros)?;

        let fields = EntryFields {
            actor_id: &new.actor_id,
            action: &new.action,
            resource_type: &new.resource_type,
            resource_id: new.resource_id.as_deref(),
            metadata: &metadata,
            timestamp,
        };
        let hash = self
            .hasher
            .compute_with(&secret, &prev_hash, &fields, CURRENT_ENCODING)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO audit_entries (
                partition_key, timestamp_micros, actor_id, action, resource_type,
                resource_id, metadata, prev_hash, hash, secret_version, encoding_version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&new.partition_key)
        .bind(timestamp_micros)
        .bind(&new.actor_id)
        .bind(&new.action)
        .bind(&new.resource_type)
        .bind(&new.resource_id)
        .bind(serde_json::to_string(&metadata)?)
        .bind(&prev_hash)
        .bind(&hash)
        .bind(secret.version())
        .bind(CURRENT_ENCODING.as_i64())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return LedgerError::ConcurrencyConflict(format!(
                        "chain head of partition {} moved during append",
                        new.partition_key
                    ));
                }
            }
            LedgerError::from(e)
        })?;

        tx.commit().await?;

        let entry = AuditEntry {
            id,
            partition_key: new.partition_key,
            timestamp,
            actor_id: new.actor_id,
            action: new.action,
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            metadata,
            prev_hash,
            hash,
            secret_version: secret.version(),
            encoding_version: Some(CURRENT_ENCODING),
        };

        debug!("Appended audit entry: {}", entry.summary());
        Ok(entry)
    }

    /// Application-facing append: the partition is the acting principal.
    pub async fn add_entry(
        &self,
        actor_id: &str,
        action: &str,
        resource_type: &str,
        resource_id: Option<&str>,
        metadata: Option<Value>,
    ) -> LedgerResult<i64> {
        let mut new = NewAuditEntry::new(actor_id, actor_id, action, resource_type);
        new.resource_id = resource_id.map(str::to_string);
        new.metadata = metadata;
        Ok(self.append(new).await?.id)
    }

    /// Sealed entries cannot be changed, whoever asks.
    pub async fn update_entry(&self, id: i64, _replacement: &NewAuditEntry) -> LedgerResult<()> {
        Err(LedgerError::ImmutabilityViolation(format!(
            "audit entry {} is sealed and cannot be updated",
            id
        )))
    }

    /// Sealed entries cannot be deleted; expiry goes through [`AuditLedger::prune_expired`].
    pub async fn delete_entry(&self, id: i64) -> LedgerResult<()> {
        Err(LedgerError::ImmutabilityViolation(format!(
            "audit entry {} is sealed and cannot be deleted",
            id
        )))
    }

    pub async fn get(&self, id: i64) -> LedgerResult<Option<AuditEntry>> {
        let sql = format!("SELECT {} FROM audit_entries WHERE id = ?", AUDIT_ENTRY_COLUMNS);
        let row = sqlx::query_as::<_, AuditEntryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AuditEntry::try_from).transpose()
    }

    pub async fn last_entry(&self, partition_key: &str) -> LedgerResult<Option<AuditEntry>> {
        let sql = format!(
            "SELECT {} FROM audit_entries WHERE partition_key = ? \
             ORDER BY timestamp_micros DESC, id DESC LIMIT 1",
            AUDIT_ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, AuditEntryRow>(&sql)
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AuditEntry::try_from).transpose()
    }

    /// Up to `limit` entries of one partition strictly after `after`, in chain order.
    pub async fn entries_after(
        &self,
        partition_key: &str,
        after: Option<ChainPosition>,
        limit: i64,
    ) -> LedgerResult<Vec<AuditEntry>> {
        self.rows_after(partition_key, after, limit)
            .await?
            .into_iter()
            .map(AuditEntry::try_from)
            .collect()
    }

    /// Stored rows behind [`AuditLedger::entries_after`], before decoding.
    pub(crate) async fn rows_after(
        &self,
        partition_key: &str,
        after: Option<ChainPosition>,
        limit: i64,
    ) -> LedgerResult<Vec<AuditEntryRow>> {
        let after = after.unwrap_or(ChainPosition {
            timestamp_micros: i64::MIN,
            id: i64::MIN,
        });
        let sql = format!(
            "SELECT {} FROM audit_entries \
             WHERE partition_key = ? AND (timestamp_micros, id) > (?, ?) \
             ORDER BY timestamp_micros ASC, id ASC LIMIT ?",
            AUDIT_ENTRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, AuditEntryRow>(&sql)
            .bind(partition_key)
            .bind(after.timestamp_micros)
            .bind(after.id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Up to `limit` entries across all partitions ordered by `(partition_key, timestamp, id)`,
    /// strictly after `after`.
    pub async fn scan(
        &self,
        after: Option<(&str, ChainPosition)>,
        limit: i64,
    ) -> LedgerResult<Vec<AuditEntry>> {
        self.scan_rows(after, limit)
            .await?
            .into_iter()
            .map(AuditEntry::try_from)
            .collect()
    }

    pub(crate) async fn scan_rows(
        &self,
        after: Option<(&str, ChainPosition)>,
        limit: i64,
    ) -> LedgerResult<Vec<AuditEntryRow>> {
        let rows = match after {
            Some((partition_key, position)) => {
                let sql = format!(
                    "SELECT {} FROM audit_entries \
                     WHERE (partition_key, timestamp_micros, id) > (?, ?, ?) \
                     ORDER BY partition_key ASC, timestamp_micros ASC, id ASC LIMIT ?",
                    AUDIT_ENTRY_COLUMNS
                );
                sqlx::query_as::<_, AuditEntryRow>(&sql)
                    .bind(partition_key)
                    .bind(position.timestamp_micros)
                    .bind(position.id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM audit_entries \
                     ORDER BY partition_key ASC, timestamp_micros ASC, id ASC LIMIT ?",
                    AUDIT_ENTRY_COLUMNS
                );
                sqlx::query_as::<_, AuditEntryRow>(&sql)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    /// Every partition known to the ledger, sorted.
    pub async fn partitions(&self) -> LedgerResult<Vec<String>> {
        let partitions: Vec<String> = sqlx::query_scalar(
            "SELECT partition_key FROM ledger_partitions \
             UNION SELECT DISTINCT partition_key FROM audit_entries \
             ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(partitions)
    }

    pub async fn count(&self, partition_key: Option<&str>) -> LedgerResult<i64> {
        let count: i64 = match partition_key {
            Some(key) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM audit_entries WHERE partition_key = ?")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM audit_entries")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    pub async fn prune_anchor(&self, partition_key: &str) -> LedgerResult<Option<PruneAnchor>> {
        Ok(self.prune_anchors().await?.remove(partition_key))
    }

    /// Whether any entry of `partition_key` at or before `position` is still stored.
    pub(crate) async fn has_entries_through(
        &self,
        partition_key: &str,
        position: ChainPosition,
    ) -> LedgerResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM audit_entries \
             WHERE partition_key = ? AND (timestamp_micros, id) <= (?, ?) LIMIT 1",
        )
        .bind(partition_key)
        .bind(position.timestamp_micros)
        .bind(position.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Prune anchors for every partition that has had entries expired.
    pub async fn prune_anchors(&self) -> LedgerResult<HashMap<String, PruneAnchor>> {
        let rows = sqlx::query_as::<_, PartitionRow>(
            "SELECT partition_key, appended_count, pruned_count, prune_anchor_id, \
             prune_anchor_hash, prune_anchor_micros \
             FROM ledger_partitions WHERE prune_anchor_hash IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some((
                    row.partition_key,
                    PruneAnchor {
                        entry_id: row.prune_anchor_id?,
                        hash: row.prune_anchor_hash?,
                        timestamp_micros: row.prune_anchor_micros?,
                    },
                ))
            })
            .collect())
    }

    /// Delete entries older than `retention` relative to `now`.
    ///
    /// This is the only deletion path. Each partition is pruned in its own transaction
    /// under the partition's append lock; the hash of the newest pruned entry becomes
    /// the partition's anchor so the surviving chain still verifies.
    pub async fn prune_expired(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> LedgerResult<PruneReport> {
        if retention < Duration::days(MIN_RETENTION_DAYS) {
            return Err(LedgerError::Validation(format!(
                "retention of {} days is below the minimum of {} days",
                retention.num_days(),
                MIN_RETENTION_DAYS
            )));
        }

        let cutoff = now - retention;
        let cutoff_micros = cutoff.timestamp_micros();
        let mut report = PruneReport {
            cutoff,
            partitions: Vec::new(),
            total_pruned: 0,
        };

        for partition_key in self.partitions().await? {
            let _partition = self.guard.lock_append(&partition_key).await;
            let mut tx = self.pool.begin().await?;

            sqlx::query("UPDATE ledger_maintenance SET prune_active = 1 WHERE id = 1")
                .execute(&mut *tx)
                .await?;

            let newest_expired: Option<(i64, String, i64)> = sqlx::query_as(
                "SELECT id, hash, timestamp_micros FROM audit_entries \
                 WHERE partition_key = ? AND timestamp_micros < ? \
                 ORDER BY timestamp_micros DESC, id DESC LIMIT 1",
            )
            .bind(&partition_key)
            .bind(cutoff_micros)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((anchor_id, anchor_hash, anchor_micros)) = newest_expired else {
                tx.rollback().await?;
                continue;
            };

            let deleted = sqlx::query(
                "DELETE FROM audit_entries \
                 WHERE partition_key = ? AND (timestamp_micros, id) <= (?, ?)",
            )
            .bind(&partition_key)
            .bind(anchor_micros)
            .bind(anchor_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            sqlx::query(
                "INSERT INTO ledger_partitions (partition_key, appended_count, created_at, last_append_at) \
                 VALUES (?, 0, ?, ?) ON CONFLICT(partition_key) DO NOTHING",
            )
            .bind(&partition_key)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE ledger_partitions SET pruned_count = pruned_count + ?, \
                 prune_anchor_id = ?, prune_anchor_hash = ?, prune_anchor_micros = ? \
                 WHERE partition_key = ?",
            )
            .bind(deleted as i64)
            .bind(anchor_id)
            .bind(&anchor_hash)
            .bind(anchor_micros)
            .bind(&partition_key)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE ledger_maintenance SET prune_active = 0 WHERE id = 1")
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            info!(
                partition = %partition_key,
                pruned = deleted,
                anchor_id,
                "Pruned expired audit entries"
            );
            report.total_pruned += deleted;
            report.partitions.push(PartitionPrune {
                partition_key,
                pruned: deleted,
                anchor_id,
            });
        }

        Ok(report)
    }
}
