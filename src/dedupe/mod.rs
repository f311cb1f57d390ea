//! Out-of-band duplicate detection and repair.
//!
//! Sync-time defenses narrow the duplicate-creation window but cannot close
//! it; this auditor is the corrective half. It groups a user's accounts that
//! plausibly describe the same real-world account, keeps the oldest member
//! of each group, re-points dependent transactions at it, and deletes the
//! rest. Merges are destructive, so dry-run is the default posture and
//! callers must opt in to mutation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::{Account, Id};
use crate::storage::Storage;

/// One set of accounts judged to be the same real-world account.
#[derive(Debug, Clone, Serialize)]
pub struct MergeGroup {
    /// Which key matched, for operator review.
    pub matched_on: String,
    pub survivor_id: Id,
    pub removed_ids: Vec<Id>,
    /// Transactions that point (or would point) at the survivor afterwards.
    pub repointed_transactions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeFailure {
    pub survivor_id: Id,
    pub detail: String,
}

/// The action plan for one audit, executed unless `dry_run` was set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergePlan {
    pub groups: Vec<MergeGroup>,
    pub failures: Vec<MergeFailure>,
}

pub struct DuplicateAuditor {
    storage: Arc<dyn Storage>,
}

impl DuplicateAuditor {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Audit one user's accounts and, unless `dry_run`, collapse each
    /// duplicate group to its survivor. A failure merging one group is
    /// reported and does not stop the others.
    pub async fn run(&self, user_id: &str, dry_run: bool) -> Result<MergePlan> {
        let accounts = self.storage.accounts_for_user(user_id).await?;
        tracing::info!(user_id, total = accounts.len(), dry_run, "Duplicate audit started");

        let mut plan = MergePlan::default();

        for (matched_on, mut members) in group_duplicates(&accounts) {
            // Oldest member survives; ties broken by id so reruns agree.
            members.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.account_id.cmp(&b.account_id))
            });
            let survivor = members[0].clone();
            let removed: Vec<Account> = members[1..].to_vec();

            match self.merge_group(&survivor, &removed, dry_run).await {
                Ok(repointed_transactions) => {
                    tracing::info!(
                        survivor = %survivor.account_id,
                        removed = removed.len(),
                        repointed_transactions,
                        dry_run,
                        "Merged duplicate group"
                    );
                    plan.groups.push(MergeGroup {
                        matched_on,
                        survivor_id: survivor.account_id,
                        removed_ids: removed.into_iter().map(|a| a.account_id).collect(),
                        repointed_transactions,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        survivor = %survivor.account_id,
                        error = %err,
                        "Failed to merge duplicate group"
                    );
                    plan.failures.push(MergeFailure {
                        survivor_id: survivor.account_id,
                        detail: format!("{err:#}"),
                    });
                }
            }
        }

        Ok(plan)
    }

    /// Re-point every transaction of every removed member to the survivor,
    /// then delete the members. Counts affected transactions in both modes.
    async fn merge_group(
        &self,
        survivor: &Account,
        removed: &[Account],
        dry_run: bool,
    ) -> Result<usize> {
        let mut repointed = 0;

        for account in removed {
            let transactions = self
                .storage
                .transactions_for_account(&account.account_id)
                .await
                .with_context(|| {
                    format!("listing transactions of {}", account.account_id)
                })?;
            repointed += transactions.len();

            if dry_run {
                continue;
            }

            for mut transaction in transactions {
                transaction.account_id = survivor.account_id.clone();
                self.storage
                    .put_transaction(&transaction)
                    .await
                    .with_context(|| {
                        format!("re-pointing transaction {}", transaction.transaction_id)
                    })?;
            }

            self.storage
                .delete_account(&account.account_id)
                .await
                .with_context(|| format!("deleting duplicate {}", account.account_id))?;
        }

        Ok(repointed)
    }
}

/// Group accounts that describe the same real-world account: first by
/// provider id collision, then by the fuzzy key (institution + trailing
/// digits) over the rest. Each account lands in at most one group; groups of
/// one are not duplicates.
fn group_duplicates(accounts: &[Account]) -> Vec<(String, Vec<Account>)> {
    let mut groups: Vec<(String, Vec<Account>)> = Vec::new();
    let mut claimed: HashSet<Id> = HashSet::new();

    // BTreeMap keeps group order deterministic across runs.
    let mut by_external: BTreeMap<String, Vec<Account>> = BTreeMap::new();
    for account in accounts {
        if let Some(external) = account.external_account_id.as_deref().map(str::trim) {
            if !external.is_empty() {
                by_external
                    .entry(external.to_string())
                    .or_default()
                    .push(account.clone());
            }
        }
    }
    for (external, members) in by_external {
        if members.len() > 1 {
            claimed.extend(members.iter().map(|a| a.account_id.clone()));
            groups.push((format!("external_account_id={external}"), members));
        }
    }

    let mut by_fuzzy: BTreeMap<(String, String), Vec<Account>> = BTreeMap::new();
    for account in accounts {
        if claimed.contains(&account.account_id) {
            continue;
        }
        let Some(institution) = account.institution_name.as_deref() else {
            continue;
        };
        let Some(last4) = account.last_four() else {
            continue;
        };
        by_fuzzy
            .entry((institution.trim().to_lowercase(), last4))
            .or_default()
            .push(account.clone());
    }
    for ((institution, last4), members) in by_fuzzy {
        if members.len() > 1 {
            groups.push((format!("institution={institution} number=*{last4}"), members));
        }
    }

    groups
}
