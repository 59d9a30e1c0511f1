use audit_ledger::audit::{ConcurrencyGuard, NewAuditEntry, Scheduler, SchedulerConfig};
use audit_ledger::config::MIN_RETENTION_DAYS;
use audit_ledger::database::Database;
use audit_ledger::error::LedgerError;
use chrono::Duration;

mod common;
use common::*;

async fn file_database(dir: &tempfile::TempDir) -> Database {
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let db = Database::new(&url).await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appenders_do_not_fork() {
    let dir = tempfile::tempdir().unwrap();
    let t = ledger_on(file_database(&dir).await, ConcurrencyGuard::new()).await;

    let a = t.ledger.clone();
    let b = t.ledger.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.add_entry("user-A", "login", "session", None, None).await }),
        tokio::spawn(async move { b.add_entry("user-A", "view", "record", None, None).await }),
    );
    first.unwrap().unwrap();
    second.unwrap().unwrap();

    let result = t.verifier.verify_full(Some("user-A")).await.unwrap();
    assert!(result.intact);
    assert_eq!(result.total_entries, 2);

    let entries = t.ledger.entries_after("user-A", None, 10).await.unwrap();
    assert_eq!(entries[0].prev_hash, "");
    assert_eq!(entries[1].prev_hash, entries[0].hash);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_storage_serializes_appenders_without_shared_locks() {
    // Two ledgers with independent in-process guards, as two processes would have.
    let dir = tempfile::tempdir().unwrap();
    let db = file_database(&dir).await;
    let one = ledger_on(db.clone(), ConcurrencyGuard::new()).await;
    let two = ledger_on(db, ConcurrencyGuard::new()).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let ledger = if i % 2 == 0 { one.ledger.clone() } else { two.ledger.clone() };
        handles.push(tokio::spawn(async move {
            ledger
                .append(NewAuditEntry::new("shared", format!("writer-{}", i), "append", "record"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let result = one.verifier.verify_full(Some("shared")).await.unwrap();
    assert!(result.intact);
    assert_eq!(result.total_entries, 16);
    assert_eq!(result.verified_entries, 16);
}

#[tokio::test]
async fn test_prune_keeps_remaining_chain_verifiable() {
    let t = setup_ledger().await;
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            t.ledger
                .add_entry("user-A", &format!("action-{}", i), "record", None, None)
                .await
                .unwrap(),
        );
        // Distinct microsecond timestamps so the cutoff lands between entries.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    t.verifier.verify_incremental("user-A").await.unwrap();

    let second = t.ledger.get(ids[1]).await.unwrap().unwrap();
    let retention = Duration::days(MIN_RETENTION_DAYS);
    let now = second.timestamp + retention + Duration::microseconds(1);

    let report = t.ledger.prune_expired(retention, now).await.unwrap();
    assert_eq!(report.total_pruned, 2);
    assert!(t.ledger.get(ids[0]).await.unwrap().is_none());
    assert_eq!(t.ledger.count(Some("user-A")).await.unwrap(), 2);

    let result = t.verifier.verify_full(Some("user-A")).await.unwrap();
    assert!(result.intact);
    assert_eq!(result.total_entries, 2);

    // The incremental cursor points past the pruned history and keeps working.
    t.ledger.add_entry("user-A", "after-prune", "record", None, None).await.unwrap();
    let inc = t.verifier.verify_incremental("user-A").await.unwrap();
    assert!(inc.intact);
    assert_eq!(inc.verified_entries, 1);

    // Deletion outside the prune path is still refused.
    let delete = sqlx::query("DELETE FROM audit_entries WHERE id = ?")
        .bind(ids[2])
        .execute(t.db.pool())
        .await
        .map_err(LedgerError::from);
    assert!(matches!(delete, Err(LedgerError::ImmutabilityViolation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_scan_concurrent_with_prune_stays_intact() {
    let dir = tempfile::tempdir().unwrap();
    let t = ledger_on(file_database(&dir).await, ConcurrencyGuard::new()).await;
    let mut ids = Vec::new();
    for i in 0..200 {
        ids.push(
            t.ledger
                .add_entry("user-A", &format!("action-{}", i), "record", None, None)
                .await
                .unwrap(),
        );
    }

    let cut = t.ledger.get(ids[149]).await.unwrap().unwrap();
    let retention = Duration::days(MIN_RETENTION_DAYS);
    let now = cut.timestamp + retention + Duration::microseconds(1);

    let (scan, prune) = tokio::join!(
        t.verifier.verify_full(Some("user-A")),
        t.ledger.prune_expired(retention, now)
    );
    let scan = scan.unwrap();
    let pruned = prune.unwrap().total_pruned;
    assert!(pruned >= 150);
    assert!(scan.intact, "prune reported as tampering: {:?}", scan.chain_break);

    let after = t.verifier.verify_full(Some("user-A")).await.unwrap();
    assert!(after.intact);
    assert_eq!(after.total_entries, 200 - pruned);
}

#[tokio::test]
async fn test_fully_pruned_partition_chains_from_anchor() {
    let t = setup_ledger().await;
    let last = t.ledger.add_entry("user-A", "login", "session", None, None).await.unwrap();
    let last = t.ledger.get(last).await.unwrap().unwrap();

    let retention = Duration::days(MIN_RETENTION_DAYS);
    let now = last.timestamp + retention + Duration::seconds(1);
    assert_eq!(t.ledger.prune_expired(retention, now).await.unwrap().total_pruned, 1);
    assert_eq!(t.ledger.count(None).await.unwrap(), 0);

    let next = t.ledger.add_entry("user-A", "view", "record", None, None).await.unwrap();
    let next = t.ledger.get(next).await.unwrap().unwrap();
    assert_eq!(next.prev_hash, last.hash);
    assert!(next.timestamp >= last.timestamp);

    let result = t.verifier.verify_full(None).await.unwrap();
    assert!(result.intact);
    assert_eq!(result.total_entries, 1);

    // Without a cursor the incremental run also starts from the anchor.
    let inc = t.verifier.verify_incremental("user-A").await.unwrap();
    assert!(inc.intact);
    assert_eq!(inc.verified_entries, 1);
}

#[tokio::test]
async fn test_scheduler_isolates_broken_partitions() {
    let t = setup_ledger().await;
    let broken = t.ledger.add_entry("user-A", "login", "session", None, None).await.unwrap();
    t.ledger.add_entry("user-B", "login", "session", None, None).await.unwrap();
    t.ledger.add_entry("user-C", "login", "session", None, None).await.unwrap();

    let scheduler = Scheduler::new(t.verifier.clone(), SchedulerConfig::default());
    let first = scheduler.run_incremental_pass().await.unwrap();
    assert_eq!(first.partitions, 3);
    assert_eq!(first.broken, 0);

    tamper(&t.db, "UPDATE audit_entries SET action = 'logout' WHERE id = ?", broken).await;

    let full = scheduler.run_full_pass().await.unwrap();
    assert_eq!(full.partitions, 3);
    assert_eq!(full.broken, 1);
    assert_eq!(full.verified_entries, 2);
    assert_eq!(full.failed, 0);

    // The broken partition lost its cursor; the others kept theirs.
    assert!(t.verifier.cursor("user-A").await.unwrap().is_none());
    assert!(t.verifier.cursor("user-B").await.unwrap().is_some());

    let runs = t.verifier.recent_runs(100).await.unwrap();
    assert_eq!(runs.len(), 6);
    let failed: Vec<_> = runs.iter().filter(|r| !r.intact).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].partition_key.as_deref(), Some("user-A"));
    assert_eq!(failed[0].broken_at_id, Some(broken));
}
