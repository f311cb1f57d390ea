mod engine;
mod normalize;
mod resolve;
mod retry;
mod upsert;

pub use engine::SyncEngine;
pub use normalize::{
    normalize_account, normalize_transaction, NormalizedAccount, NormalizedTransaction, Rejection,
};
pub use resolve::{AccountIndex, AccountRef, Resolution};
pub use retry::with_retry;
pub use upsert::{upsert_account, upsert_transaction, TransactionUpsertError, UpsertOutcome};

use serde::Serialize;

use crate::provider::ProviderError;

/// Why an individual record was not persisted.
///
/// The serialized form is the stable wire code reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Transaction date was missing or not a parseable calendar date.
    InvalidDate,
    /// Transaction amount was missing or not a finite number.
    InvalidAmount,
    /// The record carries no provider identifier and could never be
    /// re-resolved on a later run.
    MissingExternalId,
    /// The transaction references an account that does not exist.
    OrphanReference,
    /// The storage layer rejected the write.
    Storage,
    /// Provider retries were exhausted for this item's page or account.
    Provider,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDate => "INVALID_DATE",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::MissingExternalId => "MISSING_EXTERNAL_ID",
            Self::OrphanReference => "ORPHAN_REFERENCE",
            Self::Storage => "STORAGE",
            Self::Provider => "PROVIDER",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Transaction,
}

/// One skipped record in a run report.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub kind: EntityKind,
    /// The provider's identifier for the failing record, when it had one.
    pub external_id: Option<String>,
    pub reason: FailureReason,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl EntityCounts {
    pub fn processed(&self) -> usize {
        self.created + self.updated + self.skipped
    }
}

/// Overall outcome of a run, derived from the counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

/// Structured summary of one sync execution.
///
/// A run never fails outright merely because some items failed; callers
/// inspect `status()` to decide whether to surface a warning.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub accounts: EntityCounts,
    pub transactions: EntityCounts,
    pub failures: Vec<ItemFailure>,
}

impl SyncReport {
    pub fn status(&self) -> SyncStatus {
        let processed = self.accounts.processed() + self.transactions.processed();
        if self.failures.is_empty() {
            SyncStatus::Success
        } else if processed > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        }
    }

    pub fn record_failure(&mut self, failure: ItemFailure) {
        match failure.kind {
            EntityKind::Account => self.accounts.failed += 1,
            EntityKind::Transaction => self.transactions.failed += 1,
        }
        self.failures.push(failure);
    }

    /// Fold a per-account sub-report into the run report.
    ///
    /// Overlapping page ranges can surface the same orphaned transaction to
    /// several workers; duplicate failures (same external id and reason) are
    /// collapsed.
    pub fn absorb(&mut self, other: SyncReport) {
        self.accounts.created += other.accounts.created;
        self.accounts.updated += other.accounts.updated;
        self.accounts.skipped += other.accounts.skipped;
        self.transactions.created += other.transactions.created;
        self.transactions.updated += other.transactions.updated;
        self.transactions.skipped += other.transactions.skipped;

        for failure in other.failures {
            let duplicate = failure.external_id.is_some()
                && self.failures.iter().any(|f| {
                    f.external_id == failure.external_id && f.reason == failure.reason
                });
            if !duplicate {
                self.record_failure(failure);
            }
        }
    }
}

/// Fatal, run-level errors. Item- and batch-level problems never surface
/// here; they are recorded in the report instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("user id is required")]
    MissingUser,
    #[error("provider item token is required")]
    MissingItemToken,
    #[error("failed to fetch accounts from provider: {source}")]
    AccountFetch { source: ProviderError },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
