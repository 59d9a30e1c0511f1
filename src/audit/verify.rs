//! Audit Ledger Verification
//!
//! Full-scan and resumable incremental verification of partition hash chains.
//! Both stop at the first break. A break is a reportable outcome, never an error:
//! only infrastructure failures come back as `Err`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::audit::entry::AuditEntry;
use crate::audit::hasher::{hashes_equal, HashCheck};
use crate::audit::ledger::{AuditLedger, ChainPosition, PruneAnchor};
use crate::database::models::AuditEntryRow;
use crate::database::queries::Queries;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationKind {
    Full,
    Incremental,
}

impl VerificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for VerificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> LedgerResult<Self> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(LedgerError::Database(format!(
                "unknown verification kind: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// `prev_hash` does not link to the preceding entry.
    PrevHashMismatch,
    /// Recomputed hash differs from the stored one.
    HashMismatch,
    /// The entry's pinned secret version could not be resolved.
    SecretUnavailable,
    /// The entry records an encoding this build does not know.
    UnknownEncoding,
    /// A stored field could not be decoded.
    MalformedEntry,
}

/// First point at which a chain failed to verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub entry_id: i64,
    pub partition_key: String,
    pub kind: BreakKind,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub intact: bool,
    pub total_entries: u64,
    pub verified_entries: u64,
    pub chain_break: Option<ChainBreak>,
    /// Set when the chain could not be checked, as opposed to checked and found broken.
    pub error: Option<String>,
    /// Entries matched per encoding through the fallback search, keyed by label.
    pub encoding_matches: BTreeMap<String, u64>,
    /// Another incremental run held the partition; nothing was checked.
    pub skipped: bool,
}

impl VerificationResult {
    fn new() -> Self {
        Self {
            intact: true,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            intact: true,
            skipped: true,
            ..Default::default()
        }
    }

    /// A check that could not complete. Never counts as intact.
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            intact: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn broken_at_id(&self) -> Option<i64> {
        self.chain_break.as_ref().map(|b| b.entry_id)
    }

    fn record_break(&mut self, chain_break: ChainBreak) {
        warn!(
            partition = %chain_break.partition_key,
            entry_id = chain_break.entry_id,
            kind = ?chain_break.kind,
            expected = chain_break.expected.as_deref().unwrap_or(""),
            actual = chain_break.actual.as_deref().unwrap_or(""),
            "Audit chain break detected"
        );
        self.intact = false;
        self.chain_break = Some(chain_break);
    }
}

/// JSON shape returned by the admin verification endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub intact: bool,
    pub total_entries: u64,
    pub verified_entries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_entry: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BreakDetails>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakDetails {
    pub expected: String,
    pub actual: String,
}

impl From<&VerificationResult> for VerificationReport {
    fn from(result: &VerificationResult) -> Self {
        let chain_break = result.chain_break.as_ref();
        let error = result.error.clone().or_else(|| {
            chain_break.map(|b| match b.kind {
                BreakKind::PrevHashMismatch => "previous hash link mismatch".to_string(),
                BreakKind::HashMismatch => "entry hash mismatch".to_string(),
                BreakKind::SecretUnavailable => "secret unavailable".to_string(),
                BreakKind::UnknownEncoding => "unknown canonical encoding".to_string(),
                BreakKind::MalformedEntry => "malformed entry".to_string(),
            })
        });
        Self {
            intact: result.intact,
            total_entries: result.total_entries,
            verified_entries: result.verified_entries,
            error,
            broken_at_entry: chain_break.map(|b| b.entry_id),
            details: chain_break.and_then(|b| {
                Some(BreakDetails {
                    expected: b.expected.clone()?,
                    actual: b.actual.clone()?,
                })
            }),
            skipped: result.skipped,
        }
    }
}

/// Resumable checkpoint for one partition's incremental verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCursor {
    pub partition_key: String,
    pub last_verified_id: i64,
    pub last_hash: String,
    pub last_timestamp: DateTime<Utc>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationCursor {
    pub fn position(&self) -> ChainPosition {
        ChainPosition {
            timestamp_micros: self.last_timestamp.timestamp_micros(),
            id: self.last_verified_id,
        }
    }
}

/// Persisted outcome of one completed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRun {
    pub id: Option<i64>,
    pub kind: VerificationKind,
    pub partition_key: Option<String>,
    pub intact: bool,
    pub total_entries: u64,
    pub verified_entries: u64,
    pub broken_at_id: Option<i64>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub error: Option<String>,
    pub run_at: DateTime<Utc>,
}

impl VerificationRun {
    pub fn from_result(
        kind: VerificationKind,
        partition_key: Option<&str>,
        result: &VerificationResult,
        run_at: DateTime<Utc>,
    ) -> Self {
        let chain_break = result.chain_break.as_ref();
        Self {
            id: None,
            kind,
            partition_key: partition_key.map(str::to_string),
            intact: result.intact,
            total_entries: result.total_entries,
            verified_entries: result.verified_entries,
            broken_at_id: chain_break.map(|b| b.entry_id),
            expected: chain_break.and_then(|b| b.expected.clone()),
            actual: chain_break.and_then(|b| b.actual.clone()),
            error: result.error.clone(),
            run_at,
        }
    }
}

#[derive(Clone)]
pub struct Verifier {
    pool: SqlitePool,
    ledger: AuditLedger,
    page_size: i64,
}

impl Verifier {
    pub fn new(pool: SqlitePool, ledger: AuditLedger, page_size: i64) -> Self {
        Self {
            pool,
            ledger,
            page_size: page_size.max(1),
        }
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Walk every chain (or one, with `partition_filter`) from its start.
    ///
    /// Read-only; entries appended while the scan runs may or may not be observed.
    pub async fn verify_full(&self, partition_filter: Option<&str>) -> LedgerResult<VerificationResult> {
        let mut walk = ChainWalk::new(self.ledger.prune_anchors().await?);

        match partition_filter {
            Some(partition_key) => {
                let mut after = None;
                loop {
                    let page = self
                        .ledger
                        .rows_after(partition_key, after, self.page_size)
                        .await?;
                    let Some(last) = page.last() else { break };
                    after = Some(last.position());
                    if !walk.check_page(self, page).await? {
                        break;
                    }
                }
            }
            None => {
                let mut after: Option<(String, ChainPosition)> = None;
                loop {
                    let page = self
                        .ledger
                        .scan_rows(
                            after.as_ref().map(|(p, pos)| (p.as_str(), *pos)),
                            self.page_size,
                        )
                        .await?;
                    let Some(last) = page.last() else { break };
                    after = Some((last.partition_key.clone(), last.position()));
                    if !walk.check_page(self, page).await? {
                        break;
                    }
                }
            }
        }

        let result = walk.finish();
        info!(
            partition = partition_filter.unwrap_or("*"),
            intact = result.intact,
            total = result.total_entries,
            verified = result.verified_entries,
            "Full audit verification finished"
        );
        Ok(result)
    }

    /// Verify only what was appended to `partition_key` since the last successful run.
    ///
    /// Returns a skipped result if another incremental run holds the partition.
    pub async fn verify_incremental(&self, partition_key: &str) -> LedgerResult<VerificationResult> {
        let _lock = match self.ledger.guard().try_lock_verify(partition_key) {
            Ok(lock) => lock,
            Err(LedgerError::ConcurrencyConflict(_)) => {
                debug!(partition = partition_key, "Skipping incremental verification");
                return Ok(VerificationResult::skipped());
            }
            Err(e) => return Err(e),
        };

        let cursor = Queries::load_cursor(&self.pool, partition_key).await?;
        let mut anchors = HashMap::new();
        if let Some(anchor) = self.ledger.prune_anchor(partition_key).await? {
            anchors.insert(partition_key.to_string(), anchor);
        }

        let mut walk = ChainWalk::new(anchors);
        let mut after = None;
        if let Some(cursor) = &cursor {
            walk.resume(partition_key, cursor.last_hash.clone(), cursor.position());
            after = Some(cursor.position());
        }

        loop {
            let page = self
                .ledger
                .rows_after(partition_key, after, self.page_size)
                .await?;
            let Some(last) = page.last() else { break };
            after = Some(last.position());
            if !walk.check_page(self, page).await? {
                break;
            }
        }

        let last_verified = walk.last_verified.take();
        let result = walk.finish();
        if !result.intact {
            // Never resume past a known-bad point: the next run starts over.
            Queries::delete_cursor(&self.pool, partition_key).await?;
            return Ok(result);
        }

        if let Some(last) = last_verified {
            let cursor = VerificationCursor {
                partition_key: partition_key.to_string(),
                last_verified_id: last.id,
                last_hash: last.hash,
                last_timestamp: last.timestamp,
                verified_at: Utc::now(),
            };
            Queries::upsert_cursor(&self.pool, &cursor).await?;
        }

        debug!(
            partition = partition_key,
            verified = result.verified_entries,
            "Incremental audit verification finished"
        );
        Ok(result)
    }

    pub async fn cursor(&self, partition_key: &str) -> LedgerResult<Option<VerificationCursor>> {
        Queries::load_cursor(&self.pool, partition_key).await
    }

    /// Drop the partition's cursor so the next incremental run starts from the chain start.
    ///
    /// Waits for a running incremental verification of the partition, which would
    /// otherwise save its cursor again after the delete.
    pub async fn reset_cursor(&self, partition_key: &str) -> LedgerResult<()> {
        let _lock = self.ledger.guard().lock_verify(partition_key).await;
        Queries::delete_cursor(&self.pool, partition_key).await
    }

    /// Append the outcome of a completed verification to the run log.
    pub async fn record_run(
        &self,
        kind: VerificationKind,
        partition_key: Option<&str>,
        result: &VerificationResult,
    ) -> LedgerResult<VerificationRun> {
        let mut run = VerificationRun::from_result(kind, partition_key, result, Utc::now());
        run.id = Some(Queries::insert_run(&self.pool, &run).await?);
        Ok(run)
    }

    pub async fn recent_runs(&self, limit: i64) -> LedgerResult<Vec<VerificationRun>> {
        Queries::recent_runs(&self.pool, limit).await
    }
}

/// Running state of a chain walk across pages and partition boundaries.
struct ChainWalk {
    anchors: HashMap<String, PruneAnchor>,
    partition: Option<String>,
    expected_prev: String,
    /// Where `expected_prev` sits in the current partition; `None` at a bare chain start.
    last_position: Option<ChainPosition>,
    last_verified: Option<AuditEntry>,
    result: VerificationResult,
}

impl ChainWalk {
    fn new(anchors: HashMap<String, PruneAnchor>) -> Self {
        Self {
            anchors,
            partition: None,
            expected_prev: String::new(),
            last_position: None,
            last_verified: None,
            result: VerificationResult::new(),
        }
    }

    fn resume(&mut self, partition_key: &str, last_hash: String, position: ChainPosition) {
        self.partition = Some(partition_key.to_string());
        self.expected_prev = last_hash;
        self.last_position = Some(position);
    }

    /// Returns `false` once a break has been recorded.
    async fn check_page(&mut self, verifier: &Verifier, page: Vec<AuditEntryRow>) -> LedgerResult<bool> {
        for row in page {
            if !self.check(verifier, row).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn check(&mut self, verifier: &Verifier, row: AuditEntryRow) -> LedgerResult<bool> {
        if self.partition.as_deref() != Some(row.partition_key.as_str()) {
            let anchor = self.anchors.get(&row.partition_key);
            self.expected_prev = anchor.map(|a| a.hash.clone()).unwrap_or_default();
            self.last_position = anchor.map(PruneAnchor::position);
            self.last_verified = None;
            self.partition = Some(row.partition_key.clone());
        }

        self.result.total_entries += 1;

        if !hashes_equal(&row.prev_hash, &self.expected_prev)
            && !self.resume_after_prune(verifier, &row).await?
        {
            self.result.record_break(ChainBreak {
                entry_id: row.id,
                partition_key: row.partition_key.clone(),
                kind: BreakKind::PrevHashMismatch,
                expected: Some(self.expected_prev.clone()),
                actual: Some(row.prev_hash.clone()),
            });
            return Ok(false);
        }

        let (entry_id, partition_key) = (row.id, row.partition_key.clone());
        let entry = match AuditEntry::try_from(row) {
            Ok(entry) => entry,
            Err(e) => {
                self.result.error = Some(format!("entry {} cannot be decoded: {}", entry_id, e));
                self.result.record_break(ChainBreak {
                    entry_id,
                    partition_key,
                    kind: BreakKind::MalformedEntry,
                    expected: None,
                    actual: None,
                });
                return Ok(false);
            }
        };

        let check = match verifier.ledger.hasher().check_entry(&entry).await {
            Ok(check) => check,
            Err(LedgerError::Secret(message)) => {
                self.result.error = Some(message);
                self.result.record_break(ChainBreak {
                    entry_id,
                    partition_key,
                    kind: BreakKind::SecretUnavailable,
                    expected: None,
                    actual: None,
                });
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match check {
            HashCheck::Match {
                encoding,
                via_fallback,
            } => {
                if via_fallback {
                    *self.result.encoding_matches.entry(encoding.label()).or_insert(0) += 1;
                }
                self.result.verified_entries += 1;
                self.expected_prev = entry.hash.clone();
                self.last_position = Some(entry.position());
                self.last_verified = Some(entry);
                Ok(true)
            }
            HashCheck::Mismatch { expected, actual } => {
                self.result.record_break(ChainBreak {
                    entry_id,
                    partition_key,
                    kind: BreakKind::HashMismatch,
                    expected: Some(expected),
                    actual: Some(actual),
                });
                Ok(false)
            }
            HashCheck::UnknownEncoding(version) => {
                self.result.error = Some(format!("unknown canonical encoding version {}", version));
                self.result.record_break(ChainBreak {
                    entry_id,
                    partition_key,
                    kind: BreakKind::UnknownEncoding,
                    expected: None,
                    actual: None,
                });
                Ok(false)
            }
        }
    }

    /// A walk that overlaps a retention prune sees its partition jump from the last entry
    /// it checked to the first survivor. The jump is accepted only when the partition's
    /// current anchor lies between the two, `row` links to it, and nothing at or before
    /// the anchor is still stored.
    async fn resume_after_prune(&mut self, verifier: &Verifier, row: &AuditEntryRow) -> LedgerResult<bool> {
        let Some(anchor) = verifier.ledger.prune_anchor(&row.partition_key).await? else {
            return Ok(false);
        };
        let position = anchor.position();
        let ahead_of_walk = self.last_position.map_or(true, |last| position > last);
        if !ahead_of_walk || position >= row.position() || !hashes_equal(&anchor.hash, &row.prev_hash) {
            return Ok(false);
        }
        if verifier
            .ledger
            .has_entries_through(&row.partition_key, position)
            .await?
        {
            return Ok(false);
        }

        debug!(
            partition = %row.partition_key,
            anchor_id = anchor.entry_id,
            "Chain walk continued from a newer prune anchor"
        );
        self.expected_prev = anchor.hash.clone();
        self.last_position = Some(position);
        self.anchors.insert(row.partition_key.clone(), anchor);
        Ok(true)
    }

    fn finish(self) -> VerificationResult {
        self.result
    }
}
