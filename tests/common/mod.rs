#![allow(dead_code)]

use audit_ledger::audit::{AuditLedger, ChainHasher, ConcurrencyGuard, SecretStore, Verifier};
use audit_ledger::database::Database;

pub const TEST_SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const ROTATED_SECRET: &str = "fedcba9876543210fedcba9876543210";

pub struct TestLedger {
    pub db: Database,
    pub ledger: AuditLedger,
    pub verifier: Verifier,
}

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// In-memory ledger with one registered secret version
pub async fn setup_ledger() -> TestLedger {
    ledger_on(setup_test_db().await, ConcurrencyGuard::new()).await
}

/// Ledger over an existing database. Seeds the first secret version if none exists.
pub async fn ledger_on(db: Database, guard: ConcurrencyGuard) -> TestLedger {
    let secrets = SecretStore::new(db.pool().clone());
    secrets
        .bootstrap(Some(TEST_SECRET))
        .await
        .expect("Failed to seed secret");
    let ledger = AuditLedger::new(&db, ChainHasher::new(secrets), guard);
    let verifier = Verifier::new(db.pool().clone(), ledger.clone(), 3);
    TestLedger {
        db,
        ledger,
        verifier,
    }
}

/// Run `sql` (binding `id`) against storage with the immutability trigger removed,
/// the way an attacker with direct database access would.
pub async fn tamper(db: &Database, sql: &str, id: i64) {
    sqlx::query("DROP TRIGGER IF EXISTS audit_entries_no_update")
        .execute(db.pool())
        .await
        .expect("Failed to drop trigger");
    sqlx::query(sql)
        .bind(id)
        .execute(db.pool())
        .await
        .expect("Failed to tamper with entry");
}
