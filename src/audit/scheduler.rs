//! Verification Scheduler
//!
//! Periodic incremental verification of every partition, a slower full rescan, and
//! the retention prune. Each job records when it last started, succeeded and failed
//! so a missed cadence can be detected and reported.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::verify::{VerificationKind, VerificationResult, Verifier};
use crate::error::LedgerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    IncrementalVerify,
    FullVerify,
    RetentionPrune,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncrementalVerify => "incremental_verify",
            Self::FullVerify => "full_verify",
            Self::RetentionPrune => "retention_prune",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub incremental_interval: Duration,
    pub full_scan_interval: Duration,
    /// How many cadences may pass without a success before a job counts as overdue.
    pub missed_run_grace: u32,
    /// `None` disables the retention job.
    pub retention: Option<chrono::Duration>,
    pub prune_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            incremental_interval: Duration::from_secs(60 * 60),
            full_scan_interval: Duration::from_secs(7 * 24 * 60 * 60),
            missed_run_grace: 2,
            retention: None,
            prune_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct JobState {
    last_started: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    runs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHealth {
    pub job: Job,
    pub cadence_secs: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub runs: u64,
    pub overdue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerHealth {
    pub started_at: DateTime<Utc>,
    pub jobs: Vec<JobHealth>,
}

impl SchedulerHealth {
    pub fn is_healthy(&self) -> bool {
        self.jobs.iter().all(|job| !job.overdue)
    }
}

/// Outcome counts for one pass over all partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub partitions: u64,
    pub verified_entries: u64,
    pub broken: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub kicked: bool,
}

#[derive(Clone)]
pub struct Scheduler {
    verifier: Verifier,
    config: SchedulerConfig,
    started_at: DateTime<Utc>,
    jobs: Arc<RwLock<BTreeMap<Job, JobState>>>,
}

impl Scheduler {
    pub fn new(verifier: Verifier, config: SchedulerConfig) -> Self {
        Self {
            verifier,
            config,
            started_at: Utc::now(),
            jobs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Spawn the periodic jobs. Each loop runs until the runtime shuts down.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.incremental_interval);
            loop {
                interval.tick().await;
                scheduler.warn_overdue(Utc::now()).await;
                if let Err(e) = scheduler.run_incremental_pass().await {
                    error!("Scheduled incremental verification failed: {}", e);
                }
            }
        }));

        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.full_scan_interval);
            // The first tick completes immediately; leave startup to the incremental pass.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = scheduler.run_full_pass().await {
                    error!("Scheduled full verification failed: {}", e);
                }
            }
        }));

        if let Some(retention) = self.config.retention {
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(scheduler.config.prune_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = scheduler.run_retention_pass(retention).await {
                        error!("Scheduled retention prune failed: {}", e);
                    }
                }
            }));
        }

        info!(
            incremental_secs = self.config.incremental_interval.as_secs(),
            full_secs = self.config.full_scan_interval.as_secs(),
            "Verification scheduler started"
        );
        handles
    }

    /// Kick off one incremental pass over every partition without waiting for it.
    pub fn trigger_all_partitions(&self) -> TriggerAck {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_incremental_pass().await {
                error!("Triggered incremental verification failed: {}", e);
            }
        });
        TriggerAck { kicked: true }
    }

    /// Incrementally verify every known partition, persisting one run per partition checked.
    /// A partition whose check fails outright is recorded with the error.
    pub async fn run_incremental_pass(&self) -> LedgerResult<PassSummary> {
        self.mark_started(Job::IncrementalVerify).await;

        let partitions = match self.verifier.ledger().partitions().await {
            Ok(partitions) => partitions,
            Err(e) => {
                error!("Incremental verification could not list partitions: {}", e);
                self.mark_failed(Job::IncrementalVerify, e.to_string()).await;
                return Err(e);
            }
        };

        let mut summary = PassSummary::default();
        for partition_key in partitions {
            summary.partitions += 1;
            let result = match self.verifier.verify_incremental(&partition_key).await {
                Ok(result) => result,
                Err(e) => {
                    error!(partition = %partition_key, "Incremental verification failed: {}", e);
                    summary.failed += 1;
                    VerificationResult::errored(e.to_string())
                }
            };

            if result.skipped {
                summary.skipped += 1;
                continue;
            }

            summary.verified_entries += result.verified_entries;
            if result.chain_break.is_some() {
                summary.broken += 1;
            }
            if let Err(e) = self
                .verifier
                .record_run(VerificationKind::Incremental, Some(&partition_key), &result)
                .await
            {
                error!(partition = %partition_key, "Failed to record verification run: {}", e);
                summary.failed += 1;
            }
        }

        self.finish_pass(Job::IncrementalVerify, &summary).await;
        Ok(summary)
    }

    /// Rescan every partition from the start. A broken partition loses its cursor.
    pub async fn run_full_pass(&self) -> LedgerResult<PassSummary> {
        self.mark_started(Job::FullVerify).await;

        let partitions = match self.verifier.ledger().partitions().await {
            Ok(partitions) => partitions,
            Err(e) => {
                error!("Full verification could not list partitions: {}", e);
                self.mark_failed(Job::FullVerify, e.to_string()).await;
                return Err(e);
            }
        };

        let mut summary = PassSummary::default();
        for partition_key in partitions {
            summary.partitions += 1;
            let result = match self.verifier.verify_full(Some(&partition_key)).await {
                Ok(result) => result,
                Err(e) => {
                    error!(partition = %partition_key, "Full verification failed: {}", e);
                    summary.failed += 1;
                    VerificationResult::errored(e.to_string())
                }
            };

            summary.verified_entries += result.verified_entries;
            if result.chain_break.is_some() {
                summary.broken += 1;
                if let Err(e) = self.verifier.reset_cursor(&partition_key).await {
                    error!(partition = %partition_key, "Failed to reset verification cursor: {}", e);
                    summary.failed += 1;
                }
            }
            if let Err(e) = self
                .verifier
                .record_run(VerificationKind::Full, Some(&partition_key), &result)
                .await
            {
                error!(partition = %partition_key, "Failed to record verification run: {}", e);
                summary.failed += 1;
            }
        }

        self.finish_pass(Job::FullVerify, &summary).await;
        Ok(summary)
    }

    pub async fn run_retention_pass(&self, retention: chrono::Duration) -> LedgerResult<u64> {
        self.mark_started(Job::RetentionPrune).await;
        match self.verifier.ledger().prune_expired(retention, Utc::now()).await {
            Ok(report) => {
                self.mark_succeeded(Job::RetentionPrune).await;
                Ok(report.total_pruned)
            }
            Err(e) => {
                error!("Retention prune failed: {}", e);
                self.mark_failed(Job::RetentionPrune, e.to_string()).await;
                Err(e)
            }
        }
    }

    pub async fn health(&self, now: DateTime<Utc>) -> SchedulerHealth {
        let states = self.jobs.read().await;
        let mut scheduled = vec![
            (Job::IncrementalVerify, self.config.incremental_interval),
            (Job::FullVerify, self.config.full_scan_interval),
        ];
        if self.config.retention.is_some() {
            scheduled.push((Job::RetentionPrune, self.config.prune_interval));
        }

        let jobs = scheduled
            .into_iter()
            .map(|(job, cadence)| {
                let state = states.get(&job).cloned().unwrap_or_default();
                let overdue = self.is_overdue(&state, cadence, now);
                JobHealth {
                    job,
                    cadence_secs: cadence.as_secs(),
                    last_started: state.last_started,
                    last_success: state.last_success,
                    last_failure: state.last_failure,
                    last_error: state.last_error,
                    consecutive_failures: state.consecutive_failures,
                    runs: state.runs,
                    overdue,
                }
            })
            .collect();

        SchedulerHealth {
            started_at: self.started_at,
            jobs,
        }
    }

    /// Log every overdue job. Returns how many there were.
    pub async fn warn_overdue(&self, now: DateTime<Utc>) -> usize {
        let health = self.health(now).await;
        let mut overdue = 0;
        for job in health.jobs.iter().filter(|job| job.overdue) {
            overdue += 1;
            warn!(
                job = job.job.as_str(),
                last_success = ?job.last_success,
                consecutive_failures = job.consecutive_failures,
                "Scheduled job missed its cadence"
            );
        }
        overdue
    }

    fn is_overdue(&self, state: &JobState, cadence: Duration, now: DateTime<Utc>) -> bool {
        let allowance = cadence.saturating_mul(self.config.missed_run_grace.max(1));
        let Ok(allowance) = chrono::Duration::from_std(allowance) else {
            return false;
        };
        let reference = state.last_success.unwrap_or(self.started_at);
        now - reference > allowance
    }

    async fn finish_pass(&self, job: Job, summary: &PassSummary) {
        if summary.failed == 0 {
            self.mark_succeeded(job).await;
        } else {
            self.mark_failed(
                job,
                format!("{} of {} partitions failed", summary.failed, summary.partitions),
            )
            .await;
        }
        info!(
            job = job.as_str(),
            partitions = summary.partitions,
            verified = summary.verified_entries,
            broken = summary.broken,
            skipped = summary.skipped,
            failed = summary.failed,
            "Verification pass finished"
        );
    }

    async fn mark_started(&self, job: Job) {
        let mut jobs = self.jobs.write().await;
        let state = jobs.entry(job).or_default();
        state.last_started = Some(Utc::now());
        state.runs += 1;
    }

    async fn mark_succeeded(&self, job: Job) {
        let mut jobs = self.jobs.write().await;
        let state = jobs.entry(job).or_default();
        state.last_success = Some(Utc::now());
        state.consecutive_failures = 0;
    }

    async fn mark_failed(&self, job: Job, message: String) {
        let mut jobs = self.jobs.write().await;
        let state = jobs.entry(job).or_default();
        state.last_failure = Some(Utc::now());
        state.last_error = Some(message);
        state.consecutive_failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::guard::ConcurrencyGuard;
    use crate::audit::hasher::ChainHasher;
    use crate::audit::ledger::AuditLedger;
    use crate::audit::secrets::SecretStore;
    use crate::database::Database;

    async fn scheduler() -> (Database, Scheduler) {
        let db = Database::new_in_memory().await.unwrap();
        let secrets = SecretStore::new(db.pool().clone());
        secrets
            .rotate(b"0123456789abcdef0123456789abcdef")
            .await
            .unwrap();
        let ledger = AuditLedger::new(&db, ChainHasher::new(secrets), ConcurrencyGuard::new());
        let verifier = Verifier::new(db.pool().clone(), ledger, 100);
        (db, Scheduler::new(verifier, SchedulerConfig::default()))
    }

    #[tokio::test]
    async fn test_incremental_pass_records_one_run_per_partition() {
        let (_db, scheduler) = scheduler().await;
        let ledger = scheduler.verifier().ledger();
        ledger.add_entry("user-A", "login", "session", None, None).await.unwrap();
        ledger.add_entry("user-B", "login", "session", None, None).await.unwrap();

        let summary = scheduler.run_incremental_pass().await.unwrap();
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.verified_entries, 2);
        assert_eq!(summary.failed, 0);

        let runs = scheduler.verifier().recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.kind == VerificationKind::Incremental && r.intact));

        let health = scheduler.health(Utc::now()).await;
        let job = &health.jobs[0];
        assert_eq!(job.job, Job::IncrementalVerify);
        assert_eq!(job.runs, 1);
        assert!(job.last_success.is_some());
        assert!(!job.overdue);
    }

    #[tokio::test]
    async fn test_skipped_partitions_are_not_recorded() {
        let (_db, scheduler) = scheduler().await;
        let ledger = scheduler.verifier().ledger();
        ledger.add_entry("user-A", "login", "session", None, None).await.unwrap();

        let _held = ledger.guard().try_lock_verify("user-A").unwrap();
        let summary = scheduler.run_incremental_pass().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(scheduler.verifier().recent_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overdue_detection() {
        let (_db, scheduler) = scheduler().await;
        let now = Utc::now();
        assert_eq!(scheduler.warn_overdue(now).await, 0);

        // Two hourly cadences without a success is the grace limit.
        let later = now + chrono::Duration::hours(3);
        let health = scheduler.health(later).await;
        assert!(health.jobs[0].overdue);
        assert!(!health.jobs[1].overdue);
        assert!(!health.is_healthy());

        scheduler.run_incremental_pass().await.unwrap();
        let health = scheduler.health(Utc::now()).await;
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn test_trigger_runs_a_pass_in_the_background() {
        let (_db, scheduler) = scheduler().await;
        let ledger = scheduler.verifier().ledger();
        ledger.add_entry("user-A", "login", "session", None, None).await.unwrap();
        ledger.add_entry("user-B", "login", "session", None, None).await.unwrap();

        assert_eq!(scheduler.trigger_all_partitions(), TriggerAck { kicked: true });

        let runs = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let runs = scheduler.verifier().recent_runs(10).await.unwrap();
                if runs.len() == 2 {
                    return runs;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("triggered pass should record its runs");
        assert!(runs.iter().all(|r| r.kind == VerificationKind::Incremental && r.intact));
        assert!(scheduler.verifier().cursor("user-B").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_pass_reports_malformed_entry_as_broken() {
        let (db, scheduler) = scheduler().await;
        let ledger = scheduler.verifier().ledger();
        ledger.add_entry("user-A", "login", "session", None, None).await.unwrap();
        let head = ledger.add_entry("user-A", "view", "record", None, None).await.unwrap();

        sqlx::query("DROP TRIGGER audit_entries_no_update")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE audit_entries SET timestamp_micros = 9223372036854775807 WHERE id = ?")
            .bind(head)
            .execute(db.pool())
            .await
            .unwrap();

        let summary = scheduler.run_full_pass().await.unwrap();
        assert_eq!(summary.broken, 1);
        assert_eq!(summary.failed, 0);

        let runs = scheduler.verifier().recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].intact);
        assert_eq!(runs[0].broken_at_id, Some(head));
    }

    #[tokio::test]
    async fn test_failed_checks_are_still_recorded() {
        let (db, scheduler) = scheduler().await;
        scheduler
            .verifier()
            .ledger()
            .add_entry("user-A", "login", "session", None, None)
            .await
            .unwrap();

        // Anchor lookups now fail for every partition.
        sqlx::query("ALTER TABLE ledger_partitions DROP COLUMN prune_anchor_micros")
            .execute(db.pool())
            .await
            .unwrap();

        let full = scheduler.run_full_pass().await.unwrap();
        assert_eq!(full.failed, 1);
        assert_eq!(full.broken, 0);
        let incremental = scheduler.run_incremental_pass().await.unwrap();
        assert_eq!(incremental.failed, 1);

        let runs = scheduler.verifier().recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| !r.intact && r.error.is_some() && r.broken_at_id.is_none()));
        assert_eq!(runs[0].kind, VerificationKind::Incremental);

        let health = scheduler.health(Utc::now()).await;
        assert_eq!(health.jobs[1].consecutive_failures, 1);
        assert!(health.jobs[1].last_error.is_some());
    }
}
