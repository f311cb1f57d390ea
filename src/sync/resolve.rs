//! Maps normalized provider records to existing internal accounts.
//!
//! The index is a per-run read-through cache over one user's accounts,
//! loaded with a single scan and kept fresh as upserts land. Lookups stay
//! point reads; the exhaustive fuzzy pass only runs for records whose
//! identity cannot be trusted.

use std::collections::HashMap;

use anyhow::Result;

use crate::models::{last_four_digits, Account, Id};
use crate::storage::Storage;

use super::NormalizedAccount;

/// Verdict of identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Existing(Id),
    NotFound,
}

/// What the transaction path needs to know about an owning account.
#[derive(Debug, Clone)]
pub struct AccountRef {
    pub account_id: Id,
    pub institution_name: Option<String>,
}

/// Per-run cache of one user's accounts with the secondary keys resolution
/// needs.
pub struct AccountIndex {
    user_id: String,
    accounts: HashMap<Id, Account>,
    by_external_id: HashMap<String, Id>,
    by_number_and_institution: HashMap<(String, String), Id>,
    /// Any unstable-identity account on file widens resolution: a stable
    /// incoming record may be the missing half of one of them.
    unstable_on_file: usize,
}

fn institution_key(institution: &str) -> String {
    institution.trim().to_lowercase()
}

impl AccountIndex {
    /// Load the index with one scan of the user's accounts.
    pub async fn load(storage: &dyn Storage, user_id: &str) -> Result<Self> {
        let accounts = storage.accounts_for_user(user_id).await?;
        let mut index = Self {
            user_id: user_id.to_string(),
            accounts: HashMap::new(),
            by_external_id: HashMap::new(),
            by_number_and_institution: HashMap::new(),
            unstable_on_file: 0,
        };
        for account in accounts {
            index.insert(account);
        }
        Ok(index)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn get(&self, id: &Id) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Add or refresh an account in the cache, updating secondary keys.
    pub fn insert(&mut self, account: Account) {
        if let Some(previous) = self.accounts.get(&account.account_id) {
            if previous.unstable_identity {
                self.unstable_on_file -= 1;
            }
            if let Some(external) = &previous.external_account_id {
                self.by_external_id.remove(external.trim());
            }
            if let (Some(number), Some(institution)) =
                (&previous.account_number, &previous.institution_name)
            {
                self.by_number_and_institution
                    .remove(&(number.trim().to_string(), institution_key(institution)));
            }
        }

        if account.unstable_identity {
            self.unstable_on_file += 1;
        }
        if let Some(external) = &account.external_account_id {
            self.by_external_id
                .insert(external.trim().to_string(), account.account_id.clone());
        }
        if let (Some(number), Some(institution)) =
            (&account.account_number, &account.institution_name)
        {
            self.by_number_and_institution.insert(
                (number.trim().to_string(), institution_key(institution)),
                account.account_id.clone(),
            );
        }
        self.accounts.insert(account.account_id.clone(), account);
    }

    /// Tiered resolution; first match wins.
    pub fn resolve(&self, record: &NormalizedAccount) -> Resolution {
        // 1. The provider's identifier: cheapest and most authoritative once
        //    the entity has been synced even once.
        if let Some(external) = &record.external_account_id {
            if let Some(id) = self.by_external_id.get(external.trim()) {
                return Resolution::Existing(id.clone());
            }
        }

        // 2. The natural key, for entities whose external id was never
        //    recorded or changed upstream.
        if let (Some(number), Some(institution)) =
            (&record.account_number, &record.institution_name)
        {
            if let Some(id) = self
                .by_number_and_institution
                .get(&(number.trim().to_string(), institution_key(institution)))
            {
                return Resolution::Existing(id.clone());
            }
        }

        // 3. Exhaustive fallback, only when identity is in doubt on either
        //    side of the match.
        if record.unstable_identity || self.unstable_on_file > 0 {
            if let Some(id) = self.fuzzy_match(record) {
                return Resolution::Existing(id);
            }
        }

        Resolution::NotFound
    }

    /// Same-user scan for a plausible identity match: identical masked
    /// number, or matching trailing digits, with institutions that agree
    /// (a missing institution on either side does not disqualify).
    pub fn fuzzy_match(&self, record: &NormalizedAccount) -> Option<Id> {
        let number = record.account_number.as_deref()?.trim();
        if number.is_empty() {
            return None;
        }
        let last4 = last_four_digits(number);

        let mut candidates: Vec<&Account> = self
            .accounts
            .values()
            .filter(|account| {
                let institutions_agree = match (&record.institution_name, &account.institution_name)
                {
                    (Some(incoming), Some(stored)) => {
                        institution_key(incoming) == institution_key(stored)
                    }
                    _ => true,
                };
                if !institutions_agree {
                    return false;
                }
                let Some(stored_number) = account.account_number.as_deref().map(str::trim) else {
                    return false;
                };
                stored_number == number
                    || (last4.is_some() && last_four_digits(stored_number) == last4)
            })
            .collect();

        // Deterministic pick if several candidates qualify.
        candidates.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        candidates.first().map(|a| a.account_id.clone())
    }

    /// The re-check run immediately before an insert: the same exhaustive
    /// pass as resolution tier 3, under the same identity-in-doubt gate.
    /// Narrows, but does not close, the window between two concurrent
    /// creators of the same account.
    pub fn final_recheck(&self, record: &NormalizedAccount) -> Option<Id> {
        if record.unstable_identity || self.unstable_on_file > 0 {
            self.fuzzy_match(record)
        } else {
            None
        }
    }

    /// Routing table for the transaction phase: provider account id to
    /// owning account.
    pub fn external_routes(&self) -> HashMap<String, AccountRef> {
        self.accounts
            .values()
            .filter_map(|account| {
                let external = account.external_account_id.as_deref()?.trim().to_string();
                Some((
                    external,
                    AccountRef {
                        account_id: account.account_id.clone(),
                        institution_name: account.institution_name.clone(),
                    },
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn stored_account(id: &str) -> Account {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        Account {
            account_id: Id::from_string(id),
            user_id: "user-1".to_string(),
            external_account_id: Some("ext-1".to_string()),
            account_number: Some("****1234".to_string()),
            institution_name: Some("First Federal".to_string()),
            account_name: "Checking".to_string(),
            balance: Decimal::ZERO,
            currency_code: "USD".to_string(),
            active: Some(true),
            unstable_identity: false,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn record() -> NormalizedAccount {
        NormalizedAccount {
            external_account_id: Some("ext-1".to_string()),
            account_number: Some("****1234".to_string()),
            institution_name: Some("First Federal".to_string()),
            account_name: "Checking".to_string(),
            balance: None,
            currency_code: None,
            unstable_identity: false,
        }
    }

    async fn index_with(accounts: Vec<Account>) -> AccountIndex {
        let storage = MemoryStorage::new();
        for account in &accounts {
            storage.put_account(account).await.unwrap();
        }
        AccountIndex::load(&storage, "user-1").await.unwrap()
    }

    #[tokio::test]
    async fn resolves_by_external_id_first() {
        let index = index_with(vec![stored_account("account-1")]).await;
        assert_eq!(
            index.resolve(&record()),
            Resolution::Existing(Id::from_string("account-1"))
        );
    }

    #[tokio::test]
    async fn falls_back_to_number_and_institution() {
        let mut stored = stored_account("account-1");
        stored.external_account_id = None;
        let index = index_with(vec![stored]).await;

        // Incoming record has a fresh external id the store has never seen.
        let mut incoming = record();
        incoming.external_account_id = Some("ext-renumbered".to_string());
        assert_eq!(
            index.resolve(&incoming),
            Resolution::Existing(Id::from_string("account-1"))
        );
    }

    #[tokio::test]
    async fn fuzzy_match_requires_unstable_identity_somewhere() {
        let mut stored = stored_account("account-1");
        stored.external_account_id = None;
        stored.account_number = Some("xx1234".to_string());
        let index = index_with(vec![stored.clone()]).await;

        // Differently-masked number, stable incoming record, stable store:
        // the expensive pass must not run.
        let mut incoming = record();
        incoming.external_account_id = Some("ext-other".to_string());
        incoming.account_number = Some("****1234".to_string());
        assert_eq!(index.resolve(&incoming), Resolution::NotFound);

        // The same store with an unstable account on file widens resolution.
        stored.unstable_identity = true;
        let index = index_with(vec![stored]).await;
        assert_eq!(
            index.resolve(&incoming),
            Resolution::Existing(Id::from_string("account-1"))
        );
    }

    #[tokio::test]
    async fn fuzzy_match_compares_trailing_digits_across_masks() {
        let mut stored = stored_account("account-1");
        stored.account_number = Some("000998877661234".to_string());
        let index = index_with(vec![stored]).await;

        let mut incoming = record();
        incoming.external_account_id = None;
        incoming.unstable_identity = true;
        incoming.account_number = Some("****1234".to_string());
        assert_eq!(
            index.fuzzy_match(&incoming),
            Some(Id::from_string("account-1"))
        );
    }

    #[tokio::test]
    async fn fuzzy_match_rejects_differing_institutions() {
        let index = index_with(vec![stored_account("account-1")]).await;

        let mut incoming = record();
        incoming.external_account_id = None;
        incoming.unstable_identity = true;
        incoming.institution_name = Some("Other Bank".to_string());
        assert_eq!(index.fuzzy_match(&incoming), None);
    }

    #[tokio::test]
    async fn insert_refreshes_secondary_keys() {
        let mut index = index_with(vec![]).await;
        assert_eq!(index.resolve(&record()), Resolution::NotFound);

        index.insert(stored_account("account-1"));
        assert_eq!(
            index.resolve(&record()),
            Resolution::Existing(Id::from_string("account-1"))
        );

        // Re-inserting with a changed external id must drop the stale key.
        let mut renumbered = stored_account("account-1");
        renumbered.external_account_id = Some("ext-2".to_string());
        index.insert(renumbered);
        let mut incoming = record();
        incoming.account_number = None;
        assert_eq!(index.resolve(&incoming), Resolution::NotFound);
    }

    #[tokio::test]
    async fn index_is_scoped_to_one_user() {
        let storage = MemoryStorage::new();
        let mut other = stored_account("account-other");
        other.user_id = "user-2".to_string();
        storage.put_account(&other).await.unwrap();

        let index = AccountIndex::load(&storage, "user-1").await.unwrap();
        assert!(index.is_empty());
        assert_eq!(index.resolve(&record()), Resolution::NotFound);
    }
}
