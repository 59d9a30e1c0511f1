//! Audit Ledger
//!
//! Tamper-evident, append-only audit trail: every entry is sealed with HMAC-SHA256
//! over its fields and its predecessor's hash, per partition.

pub mod entry;
pub mod guard;
pub mod hasher;
pub mod ledger;
pub mod scheduler;
pub mod secrets;
pub mod verify;

pub use entry::{AuditEntry, NewAuditEntry};
pub use guard::ConcurrencyGuard;
pub use hasher::{ChainHasher, EncodingVersion, CURRENT_ENCODING, ENCODING_STRATEGIES};
pub use ledger::{AuditLedger, ChainPosition, PruneReport};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHealth, TriggerAck};
pub use secrets::{SecretStore, SecretVersionInfo};
pub use verify::{
    BreakKind, ChainBreak, VerificationCursor, VerificationKind, VerificationReport,
    VerificationResult, VerificationRun, Verifier,
};
