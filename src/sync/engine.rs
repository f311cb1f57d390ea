//! Drives a full sync run for one user: accounts first, then each account's
//! transaction pages. One bad record never aborts the batch; provider
//! failures retry with bounded backoff and degrade to skipping the affected
//! account.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::models::Id;
use crate::provider::{DateRange, ProviderClient, ProviderError, RawTransaction};
use crate::storage::Storage;

use super::resolve::{AccountIndex, AccountRef};
use super::upsert::TransactionUpsertError;
use super::{
    normalize_account, normalize_transaction, upsert_account, upsert_transaction, with_retry,
    EntityKind, FailureReason, ItemFailure, SyncError, SyncReport, UpsertOutcome,
};

/// The synchronization engine exposed to the API layer.
pub struct SyncEngine {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn ProviderClient>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
}

/// One account that survived the account phase and is eligible for a
/// transaction pass.
#[derive(Debug, Clone)]
struct TransactionTarget {
    account_id: Id,
    external_account_id: String,
}

impl SyncEngine {
    pub fn new(storage: Arc<dyn Storage>, provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            storage,
            provider,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run a full sync for one user.
    ///
    /// Returns a report even when individual items or whole accounts failed;
    /// only structural problems (missing user/token) and an unreachable
    /// provider account listing fail the run itself.
    pub async fn run_sync(
        &self,
        user_id: &str,
        item_token: &SecretString,
    ) -> Result<SyncReport, SyncError> {
        if user_id.trim().is_empty() {
            return Err(SyncError::MissingUser);
        }
        if item_token.expose_secret().trim().is_empty() {
            return Err(SyncError::MissingItemToken);
        }

        tracing::info!(user_id, "Starting sync run");

        let raw_accounts = with_retry(&self.config.retry, "fetch accounts", || {
            call_with_timeout(&self.config, self.provider.fetch_accounts(item_token))
        })
        .await
        .map_err(|source| SyncError::AccountFetch { source })?;

        let mut index = AccountIndex::load(self.storage.as_ref(), user_id).await?;
        let mut report = SyncReport::default();
        let mut targets = Vec::new();

        for raw in &raw_accounts {
            let record = normalize_account(raw);
            match upsert_account(
                self.storage.as_ref(),
                &mut index,
                self.clock.as_ref(),
                &record,
            )
            .await
            {
                Ok(outcome) => {
                    match &outcome {
                        UpsertOutcome::Created(_) => report.accounts.created += 1,
                        UpsertOutcome::Updated(_) => report.accounts.updated += 1,
                        UpsertOutcome::Unchanged(_) => report.accounts.skipped += 1,
                    }
                    // Accounts the provider cannot address by id never
                    // receive transactions; skip their transaction pass.
                    if let Some(external) = record.external_account_id.clone() {
                        targets.push(TransactionTarget {
                            account_id: outcome.id().clone(),
                            external_account_id: external,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Account upsert failed");
                    report.record_failure(ItemFailure {
                        kind: EntityKind::Account,
                        external_id: raw.account_id.clone(),
                        reason: FailureReason::Storage,
                        detail: format!("{err:#}"),
                    });
                }
            }
        }

        let routes = Arc::new(index.external_routes());
        let semaphore = Arc::new(Semaphore::new(self.config.worker_limit.max(1)));
        let shared_token = Arc::new(SecretString::from(item_token.expose_secret().to_string()));
        let mut workers: JoinSet<SyncReport> = JoinSet::new();

        for target in targets {
            let storage = self.storage.clone();
            let provider = self.provider.clone();
            let clock = self.clock.clone();
            let config = self.config.clone();
            let token = shared_token.clone();
            let routes = routes.clone();
            let semaphore = semaphore.clone();
            let user_id = user_id.to_string();

            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return SyncReport::default();
                };
                sync_account_transactions(
                    storage, provider, clock, config, token, user_id, target, routes,
                )
                .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(sub_report) => report.absorb(sub_report),
                Err(err) => {
                    // A panicked worker loses its account's page, nothing else.
                    tracing::error!(error = %err, "Transaction worker failed");
                }
            }
        }

        tracing::info!(
            user_id,
            accounts_created = report.accounts.created,
            accounts_updated = report.accounts.updated,
            transactions_created = report.transactions.created,
            transactions_updated = report.transactions.updated,
            failed = report.failures.len(),
            "Sync run completed"
        );

        Ok(report)
    }
}

async fn call_with_timeout<T>(
    config: &SyncConfig,
    fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match tokio::time::timeout(config.provider_timeout(), fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout),
    }
}

#[allow(clippy::too_many_arguments)]
async fn sync_account_transactions(
    storage: Arc<dyn Storage>,
    provider: Arc<dyn ProviderClient>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    token: Arc<SecretString>,
    user_id: String,
    target: TransactionTarget,
    routes: Arc<HashMap<String, AccountRef>>,
) -> SyncReport {
    let mut report = SyncReport::default();

    let range = match date_range_for(storage.as_ref(), clock.as_ref(), &config, &target).await {
        Ok(range) => range,
        Err(err) => {
            tracing::warn!(error = %err, account_id = %target.account_id, "Could not compute sync range");
            report.record_failure(ItemFailure {
                kind: EntityKind::Transaction,
                external_id: Some(target.external_account_id.clone()),
                reason: FailureReason::Storage,
                detail: format!("{err:#}"),
            });
            return report;
        }
    };

    tracing::debug!(
        account_id = %target.account_id,
        start = %range.start,
        end = %range.end,
        "Syncing transactions"
    );

    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        if pages >= config.max_transaction_pages {
            tracing::warn!(
                account_id = %target.account_id,
                pages,
                "Transaction page cap reached; remaining pages deferred to the next run"
            );
            return report;
        }

        let page = with_retry(&config.retry, "fetch transactions", || {
            call_with_timeout(
                &config,
                provider.fetch_transactions(&token, &range, cursor.as_deref()),
            )
        })
        .await;

        let page = match page {
            Ok(page) => page,
            Err(err) => {
                // Retries exhausted: skip the rest of this account's pages,
                // leave last_synced_at untouched so the next run refetches.
                tracing::warn!(
                    error = %err,
                    account_id = %target.account_id,
                    "Skipping account after transaction fetch failures"
                );
                report.record_failure(ItemFailure {
                    kind: EntityKind::Transaction,
                    external_id: Some(target.external_account_id.clone()),
                    reason: FailureReason::Provider,
                    detail: format!("transaction pages skipped: {err}"),
                });
                return report;
            }
        };
        pages += 1;

        for raw in &page.transactions {
            process_transaction(
                storage.as_ref(),
                clock.as_ref(),
                &user_id,
                &target,
                &routes,
                raw,
                &mut report,
            )
            .await;
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    if let Err(err) = advance_last_synced(storage.as_ref(), clock.as_ref(), &target).await {
        tracing::warn!(error = %err, account_id = %target.account_id, "Failed to record sync time");
    }

    report
}

async fn process_transaction(
    storage: &dyn Storage,
    clock: &dyn Clock,
    user_id: &str,
    target: &TransactionTarget,
    routes: &HashMap<String, AccountRef>,
    raw: &RawTransaction,
    report: &mut SyncReport,
) {
    // Route before anything else: each worker handles its own account's
    // records, and records addressed to a known sibling account are that
    // worker's job.
    match raw.account_id.as_deref().map(str::trim) {
        Some(external) if external == target.external_account_id => {}
        Some(external) if routes.contains_key(external) => return,
        _ => {
            report.record_failure(ItemFailure {
                kind: EntityKind::Transaction,
                external_id: raw.transaction_id.clone(),
                reason: FailureReason::OrphanReference,
                detail: format!(
                    "transaction references unknown account {:?}",
                    raw.account_id
                ),
            });
            return;
        }
    }

    let record = match normalize_transaction(raw) {
        Ok(record) => record,
        Err(rejection) => {
            tracing::debug!(
                external_id = ?raw.transaction_id,
                reason = %rejection.reason,
                "Rejected transaction"
            );
            report.record_failure(ItemFailure {
                kind: EntityKind::Transaction,
                external_id: raw.transaction_id.clone(),
                reason: rejection.reason,
                detail: rejection.detail,
            });
            return;
        }
    };

    match upsert_transaction(storage, clock, user_id, routes, &record).await {
        Ok(UpsertOutcome::Created(_)) => report.transactions.created += 1,
        Ok(UpsertOutcome::Updated(_)) => report.transactions.updated += 1,
        Ok(UpsertOutcome::Unchanged(_)) => report.transactions.skipped += 1,
        Err(TransactionUpsertError::OrphanReference) => {
            report.record_failure(ItemFailure {
                kind: EntityKind::Transaction,
                external_id: Some(record.external_transaction_id.clone()),
                reason: FailureReason::OrphanReference,
                detail: "owning account not found".to_string(),
            });
        }
        Err(TransactionUpsertError::Storage(err)) => {
            tracing::warn!(error = %err, "Transaction upsert failed");
            report.record_failure(ItemFailure {
                kind: EntityKind::Transaction,
                external_id: Some(record.external_transaction_id.clone()),
                reason: FailureReason::Storage,
                detail: format!("{err:#}"),
            });
        }
    }
}

/// First sync fetches the configured lookback window; later syncs resume
/// from the last successful pass. The provider accepts dates only, so the
/// resume point is the calendar date of the last pass.
async fn date_range_for(
    storage: &dyn Storage,
    clock: &dyn Clock,
    config: &SyncConfig,
    target: &TransactionTarget,
) -> anyhow::Result<DateRange> {
    let end = clock.today();
    let account = storage.get_account(&target.account_id).await?;
    let start = match account.and_then(|a| a.last_synced_at) {
        Some(last) => last.date_naive(),
        None => end - Duration::days(config.first_sync_lookback_days),
    };
    Ok(DateRange { start, end })
}

async fn advance_last_synced(
    storage: &dyn Storage,
    clock: &dyn Clock,
    target: &TransactionTarget,
) -> anyhow::Result<()> {
    if let Some(mut account) = storage.get_account(&target.account_id).await? {
        let now = clock.now();
        account.last_synced_at = Some(now);
        account.updated_at = now;
        storage.put_account(&account).await?;
    }
    Ok(())
}
