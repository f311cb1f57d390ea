//! Create-or-update semantics for normalized records.
//!
//! Merges are field-level: an incoming value wins only when present, so a
//! partial fetch never erases previously known good data. Creates go through
//! a conditional insert; losing the insert degrades to fetch-and-merge, which
//! is how two concurrent creators of the same entity converge on one record.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::clock::Clock;
use crate::models::{derive_account_id, derive_transaction_id, Account, Id, Transaction};
use crate::storage::Storage;

use super::resolve::{AccountIndex, AccountRef, Resolution};
use super::{NormalizedAccount, NormalizedTransaction};

/// What an upsert did to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Id),
    Updated(Id),
    /// Resolved to an existing entity and changed no stored field.
    Unchanged(Id),
}

impl UpsertOutcome {
    pub fn id(&self) -> &Id {
        match self {
            Self::Created(id) | Self::Updated(id) | Self::Unchanged(id) => id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionUpsertError {
    #[error("transaction references an unknown account")]
    OrphanReference,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

fn apply_account_fields(account: &mut Account, record: &NormalizedAccount) {
    account.account_name = record.account_name.clone();
    if record.external_account_id.is_some() {
        account.external_account_id = record.external_account_id.clone();
    }
    if record.account_number.is_some() {
        account.account_number = record.account_number.clone();
    }
    if record.institution_name.is_some() {
        account.institution_name = record.institution_name.clone();
    }
    if let Some(balance) = record.balance {
        account.balance = balance;
    }
    if let Some(currency) = &record.currency_code {
        account.currency_code = currency.clone();
    }
    // The provider is still reporting this account, so it is active.
    account.active = Some(true);
    // Identity is settled once both backfillable attributes are on file.
    if account.external_account_id.is_some() && account.institution_name.is_some() {
        account.unstable_identity = false;
    }
}

fn apply_transaction_fields(transaction: &mut Transaction, record: &NormalizedTransaction) {
    transaction.amount = record.amount;
    transaction.transaction_date = record.transaction_date;
    transaction.category = record.category.clone();
    if record.merchant_name.is_some() {
        transaction.merchant_name = record.merchant_name.clone();
    }
    transaction.description = record.description.clone();
    transaction.pending = record.pending;
}

/// Merge `record` into `stored` and persist. The write happens even when
/// nothing changed so `updated_at` always reflects the latest touch; the
/// outcome still distinguishes the two for reporting.
async fn merge_account(
    storage: &dyn Storage,
    index: &mut AccountIndex,
    clock: &dyn Clock,
    stored: Account,
    record: &NormalizedAccount,
) -> Result<UpsertOutcome> {
    let mut updated = stored.clone();
    apply_account_fields(&mut updated, record);

    let changed = {
        let mut probe = updated.clone();
        probe.updated_at = stored.updated_at;
        probe != stored
    };
    updated.updated_at = clock.now();

    storage.put_account(&updated).await?;
    let id = updated.account_id.clone();
    index.insert(updated);

    Ok(if changed {
        UpsertOutcome::Updated(id)
    } else {
        UpsertOutcome::Unchanged(id)
    })
}

/// Upsert one normalized account for the index's user.
pub async fn upsert_account(
    storage: &dyn Storage,
    index: &mut AccountIndex,
    clock: &dyn Clock,
    record: &NormalizedAccount,
) -> Result<UpsertOutcome> {
    if let Resolution::Existing(id) = index.resolve(record) {
        let stored = match storage.get_account(&id).await? {
            Some(stored) => stored,
            // The index can only know about accounts it has seen.
            None => index.get(&id).cloned().context("resolved account vanished")?,
        };
        return merge_account(storage, index, clock, stored, record).await;
    }

    // Final re-check immediately before insertion. Two concurrent runs can
    // still both land here and both insert; the duplicate auditor repairs
    // that case after the fact.
    if let Some(id) = index.final_recheck(record) {
        tracing::debug!(account_id = %id, "Pre-insert re-check matched an existing account");
        let stored = index.get(&id).cloned().context("resolved account vanished")?;
        return merge_account(storage, index, clock, stored, record).await;
    }

    let derived = derive_account_id(
        record.institution_name.as_deref(),
        record.external_account_id.as_deref(),
    );
    let now = clock.now();
    let mut account = Account {
        account_id: derived.id().clone(),
        user_id: index.user_id().to_string(),
        external_account_id: record.external_account_id.clone(),
        account_number: record.account_number.clone(),
        institution_name: record.institution_name.clone(),
        account_name: record.account_name.clone(),
        balance: record.balance.unwrap_or_default(),
        currency_code: record
            .currency_code
            .clone()
            .unwrap_or_else(|| "USD".to_string()),
        active: Some(true),
        unstable_identity: !derived.is_stable(),
        last_synced_at: None,
        created_at: now,
        updated_at: now,
    };

    if storage.put_account_if_absent(&account).await? {
        tracing::debug!(
            account_id = %account.account_id,
            stable = derived.is_stable(),
            "Created account"
        );
        let id = account.account_id.clone();
        index.insert(account);
        return Ok(UpsertOutcome::Created(id));
    }

    // Lost the conditional insert: a concurrent run created this id between
    // our resolution and the write. Merge into the winner instead.
    match storage.get_account(&account.account_id).await? {
        Some(stored) => merge_account(storage, index, clock, stored, record).await,
        None => {
            // Insert said "exists" but the read missed it; write our copy.
            account.updated_at = clock.now();
            storage.put_account(&account).await?;
            let id = account.account_id.clone();
            index.insert(account);
            Ok(UpsertOutcome::Updated(id))
        }
    }
}

/// Upsert one normalized transaction.
///
/// `accounts_by_external` maps provider account ids to owning accounts; a
/// transaction whose owner is absent from it is an orphan and is rejected,
/// not created.
pub async fn upsert_transaction(
    storage: &dyn Storage,
    clock: &dyn Clock,
    user_id: &str,
    accounts_by_external: &HashMap<String, AccountRef>,
    record: &NormalizedTransaction,
) -> Result<UpsertOutcome, TransactionUpsertError> {
    let existing = storage
        .find_transaction_by_external_id(user_id, &record.external_transaction_id)
        .await?;

    if let Some(stored) = existing {
        let mut updated = stored.clone();
        apply_transaction_fields(&mut updated, record);

        let changed = {
            let mut probe = updated.clone();
            probe.updated_at = stored.updated_at;
            probe != stored
        };
        updated.updated_at = clock.now();
        storage.put_transaction(&updated).await?;

        return Ok(if changed {
            UpsertOutcome::Updated(updated.transaction_id)
        } else {
            UpsertOutcome::Unchanged(updated.transaction_id)
        });
    }

    let owner = record
        .external_account_id
        .as_deref()
        .map(str::trim)
        .and_then(|external| accounts_by_external.get(external))
        .ok_or(TransactionUpsertError::OrphanReference)?;

    let transaction_id = derive_transaction_id(
        owner.institution_name.as_deref(),
        &owner.account_id,
        &record.external_transaction_id,
    );
    let now = clock.now();
    let transaction = Transaction {
        transaction_id: transaction_id.clone(),
        account_id: owner.account_id.clone(),
        user_id: user_id.to_string(),
        external_transaction_id: Some(record.external_transaction_id.clone()),
        amount: record.amount,
        transaction_date: record.transaction_date,
        category: record.category.clone(),
        merchant_name: record.merchant_name.clone(),
        description: record.description.clone(),
        pending: record.pending,
        created_at: now,
        updated_at: now,
    };

    if storage.put_transaction_if_absent(&transaction).await? {
        return Ok(UpsertOutcome::Created(transaction_id));
    }

    // Lost the conditional insert to a concurrent run; update the winner.
    match storage.get_transaction(&transaction_id).await? {
        Some(stored) => {
            let mut updated = stored;
            apply_transaction_fields(&mut updated, record);
            updated.updated_at = clock.now();
            storage.put_transaction(&updated).await?;
            Ok(UpsertOutcome::Updated(transaction_id))
        }
        None => {
            storage.put_transaction(&transaction).await?;
            Ok(UpsertOutcome::Updated(transaction_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::storage::MemoryStorage;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn clock() -> FixedClock {
        FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap())
    }

    fn record() -> NormalizedAccount {
        NormalizedAccount {
            external_account_id: Some("ext-1".to_string()),
            account_number: Some("1234".to_string()),
            institution_name: Some("First Federal".to_string()),
            account_name: "Checking".to_string(),
            balance: Some(Decimal::from_str("100.50").unwrap()),
            currency_code: Some("USD".to_string()),
            unstable_identity: false,
        }
    }

    fn tx_record() -> NormalizedTransaction {
        NormalizedTransaction {
            external_transaction_id: "ext-tx-1".to_string(),
            external_account_id: Some("ext-1".to_string()),
            amount: Decimal::from_str("-12.34").unwrap(),
            transaction_date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
            category: "Other".to_string(),
            merchant_name: None,
            description: "Coffee".to_string(),
            pending: false,
        }
    }

    async fn fresh_index(storage: &MemoryStorage) -> AccountIndex {
        AccountIndex::load(storage, "user-1").await.unwrap()
    }

    #[tokio::test]
    async fn create_then_identical_upsert_is_unchanged() -> Result<()> {
        let storage = MemoryStorage::new();
        let clock = clock();
        let mut index = fresh_index(&storage).await;

        let first = upsert_account(&storage, &mut index, &clock, &record()).await?;
        assert!(matches!(first, UpsertOutcome::Created(_)));

        let second = upsert_account(&storage, &mut index, &clock, &record()).await?;
        assert_eq!(second, UpsertOutcome::Unchanged(first.id().clone()));

        Ok(())
    }

    #[tokio::test]
    async fn partial_record_does_not_erase_known_fields() -> Result<()> {
        let storage = MemoryStorage::new();
        let clock = clock();
        let mut index = fresh_index(&storage).await;

        upsert_account(&storage, &mut index, &clock, &record()).await?;

        // A later page lacks the number and institution.
        let partial = NormalizedAccount {
            account_number: None,
            institution_name: None,
            balance: Some(Decimal::from_str("90.00").unwrap()),
            ..record()
        };
        let outcome = upsert_account(&storage, &mut index, &clock, &partial).await?;
        assert!(matches!(outcome, UpsertOutcome::Updated(_)));

        let stored = storage.get_account(outcome.id()).await?.unwrap();
        assert_eq!(stored.account_number.as_deref(), Some("1234"));
        assert_eq!(stored.institution_name.as_deref(), Some("First Federal"));
        assert_eq!(stored.balance, Decimal::from_str("90.00").unwrap());

        Ok(())
    }

    #[tokio::test]
    async fn merge_reactivates_and_backfills_unstable_accounts() -> Result<()> {
        let storage = MemoryStorage::new();
        let clock = clock();
        let mut index = fresh_index(&storage).await;

        // First observation has no provider id: random id, flagged unstable.
        let unstable = NormalizedAccount {
            external_account_id: None,
            unstable_identity: true,
            ..record()
        };
        let created = upsert_account(&storage, &mut index, &clock, &unstable).await?;
        let stored = storage.get_account(created.id()).await?.unwrap();
        assert!(stored.unstable_identity);
        assert!(stored.external_account_id.is_none());

        // Later the provider supplies the id; the entity is backfilled in
        // place and keeps its original internal id.
        let outcome = upsert_account(&storage, &mut index, &clock, &record()).await?;
        assert_eq!(outcome.id(), created.id());

        let backfilled = storage.get_account(created.id()).await?.unwrap();
        assert_eq!(backfilled.external_account_id.as_deref(), Some("ext-1"));
        assert!(!backfilled.unstable_identity);

        Ok(())
    }

    #[tokio::test]
    async fn lost_conditional_insert_degrades_to_merge() -> Result<()> {
        let storage = MemoryStorage::new();
        let clock = clock();

        // A "concurrent run" already created the account this record derives.
        let mut other_run_index = fresh_index(&storage).await;
        upsert_account(&storage, &mut other_run_index, &clock, &record()).await?;

        // This run resolved against an empty snapshot, so it goes straight
        // to the create path and loses the conditional insert.
        let mut stale_index = AccountIndex::load(&MemoryStorage::new(), "user-1").await?;
        let outcome = upsert_account(&storage, &mut stale_index, &clock, &record()).await?;
        assert!(matches!(outcome, UpsertOutcome::Unchanged(_) | UpsertOutcome::Updated(_)));

        assert_eq!(storage.accounts_for_user("user-1").await?.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn transaction_upsert_rejects_orphans() {
        let storage = MemoryStorage::new();
        let clock = clock();
        let routes = HashMap::new();

        let err = upsert_transaction(&storage, &clock, "user-1", &routes, &tx_record())
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionUpsertError::OrphanReference));
    }

    #[tokio::test]
    async fn transaction_upsert_is_idempotent() -> Result<()> {
        let storage = MemoryStorage::new();
        let clock = clock();
        let mut index = fresh_index(&storage).await;
        upsert_account(&storage, &mut index, &clock, &record()).await?;
        let routes = index.external_routes();

        let first = upsert_transaction(&storage, &clock, "user-1", &routes, &tx_record())
            .await
            .unwrap();
        assert!(matches!(first, UpsertOutcome::Created(_)));

        let second = upsert_transaction(&storage, &clock, "user-1", &routes, &tx_record())
            .await
            .unwrap();
        assert_eq!(second, UpsertOutcome::Unchanged(first.id().clone()));

        Ok(())
    }
}
