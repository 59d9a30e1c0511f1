use sqlx::SqlitePool;

use crate::audit::verify::{VerificationCursor, VerificationRun};
use crate::database::models::{CursorRow, RunRow};
use crate::error::LedgerResult;

pub struct Queries;

impl Queries {
    pub async fn load_cursor(
        pool: &SqlitePool,
        partition_key: &str,
    ) -> LedgerResult<Option<VerificationCursor>> {
        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT partition_key, last_verified_id, last_hash, last_timestamp_micros, verified_at
            FROM verification_cursors
            WHERE partition_key = ?
            "#,
        )
        .bind(partition_key)
        .fetch_optional(pool)
        .await?;

        row.map(VerificationCursor::try_from).transpose()
    }

    pub async fn upsert_cursor(pool: &SqlitePool, cursor: &VerificationCursor) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_cursors
                (partition_key, last_verified_id, last_hash, last_timestamp_micros, verified_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(partition_key) DO UPDATE SET
                last_verified_id = excluded.last_verified_id,
                last_hash = excluded.last_hash,
                last_timestamp_micros = excluded.last_timestamp_micros,
                verified_at = excluded.verified_at
            "#,
        )
        .bind(&cursor.partition_key)
        .bind(cursor.last_verified_id)
        .bind(&cursor.last_hash)
        .bind(cursor.last_timestamp.timestamp_micros())
        .bind(cursor.verified_at.to_rfc3339())
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn delete_cursor(pool: &SqlitePool, partition_key: &str) -> LedgerResult<()> {
        sqlx::query("DELETE FROM verification_cursors WHERE partition_key = ?")
            .bind(partition_key)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn insert_run(pool: &SqlitePool, run: &VerificationRun) -> LedgerResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO verification_runs
                (kind, partition_key, intact, total_entries, verified_entries,
                 broken_at_id, expected, actual, error, run_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(run.kind.as_str())
        .bind(&run.partition_key)
        .bind(run.intact)
        .bind(run.total_entries as i64)
        .bind(run.verified_entries as i64)
        .bind(run.broken_at_id)
        .bind(&run.expected)
        .bind(&run.actual)
        .bind(&run.error)
        .bind(run.run_at.to_rfc3339())
        .fetch_one(pool)
        .await?;

        Ok(id)
    }

    /// Most recent runs first.
    pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> LedgerResult<Vec<VerificationRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, kind, partition_key, intact, total_entries, verified_entries,
                   broken_at_id, expected, actual, error, run_at
            FROM verification_runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(VerificationRun::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::verify::VerificationKind;
    use crate::database::Database;
    use chrono::{DateTime, Utc};

    #[tokio::test]
    async fn test_cursor_lifecycle() {
        let db = Database::new_in_memory().await.unwrap();
        let pool = db.pool();
        assert!(Queries::load_cursor(pool, "user-A").await.unwrap().is_none());

        let mut cursor = VerificationCursor {
            partition_key: "user-A".to_string(),
            last_verified_id: 3,
            last_hash: "ab".to_string(),
            last_timestamp: DateTime::from_timestamp_micros(1_700_000_000_000_001).unwrap(),
            verified_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        Queries::upsert_cursor(pool, &cursor).await.unwrap();
        assert_eq!(Queries::load_cursor(pool, "user-A").await.unwrap(), Some(cursor.clone()));

        cursor.last_verified_id = 9;
        Queries::upsert_cursor(pool, &cursor).await.unwrap();
        let loaded = Queries::load_cursor(pool, "user-A").await.unwrap().unwrap();
        assert_eq!(loaded.last_verified_id, 9);

        Queries::delete_cursor(pool, "user-A").await.unwrap();
        assert!(Queries::load_cursor(pool, "user-A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runs_are_append_only() {
        let db = Database::new_in_memory().await.unwrap();
        let pool = db.pool();
        for partition in ["user-A", "user-B"] {
            let run = VerificationRun {
                id: None,
                kind: VerificationKind::Incremental,
                partition_key: Some(partition.to_string()),
                intact: true,
                total_entries: 4,
                verified_entries: 4,
                broken_at_id: None,
                expected: None,
                actual: None,
                error: None,
                run_at: Utc::now(),
            };
            Queries::insert_run(pool, &run).await.unwrap();
        }

        let runs = Queries::recent_runs(pool, 1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].partition_key.as_deref(), Some("user-B"));

        let update = sqlx::query("UPDATE verification_runs SET intact = 0")
            .execute(pool)
            .await;
        assert!(update.is_err());
    }
}
