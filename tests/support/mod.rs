#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::SecretString;

use ledgersync::config::{RetryPolicy, SyncConfig};
use ledgersync::provider::{
    DateRange, ProviderClient, ProviderError, RawAccount, RawTransaction, TransactionPage,
};

pub fn item_token() -> SecretString {
    SecretString::new("item-token-1".to_string().into())
}

/// Fast retry policy so failure tests don't sleep for real.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
        },
        ..SyncConfig::default()
    }
}

pub fn raw_account(external_id: &str, name: &str, institution: &str, mask: &str) -> RawAccount {
    RawAccount {
        account_id: Some(external_id.to_string()),
        name: Some(name.to_string()),
        official_name: None,
        mask: Some(mask.to_string()),
        institution_name: Some(institution.to_string()),
        balance: Some(1000.25),
        currency_code: Some("USD".to_string()),
    }
}

pub fn raw_transaction(
    external_id: &str,
    external_account_id: &str,
    amount: f64,
    date: &str,
) -> RawTransaction {
    RawTransaction {
        transaction_id: Some(external_id.to_string()),
        account_id: Some(external_account_id.to_string()),
        amount: Some(amount),
        date: Some(date.to_string()),
        name: Some(format!("Purchase {external_id}")),
        merchant_name: None,
        category: None,
        pending: Some(false),
    }
}

/// Provider stub serving canned payloads, with optional failure injection.
///
/// Transactions are served as pages in order; cursors are page indexes.
/// Every pagination walk (one per synced account) sees the same pages and
/// filters for its own account, as the engine expects.
pub struct ScriptedProvider {
    accounts: Mutex<Vec<RawAccount>>,
    pages: Mutex<Vec<Vec<RawTransaction>>>,
    /// Fail this many fetch_accounts calls before succeeding.
    account_failures: AtomicU32,
    /// Fail this many fetch_transactions calls before succeeding.
    transaction_failures: AtomicU32,
    /// Always fail transaction fetches whose range starts on this date.
    poisoned_range_start: Mutex<Option<NaiveDate>>,
    pub account_calls: AtomicU32,
    pub transaction_calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(Vec::new()),
            pages: Mutex::new(Vec::new()),
            account_failures: AtomicU32::new(0),
            transaction_failures: AtomicU32::new(0),
            poisoned_range_start: Mutex::new(None),
            account_calls: AtomicU32::new(0),
            transaction_calls: AtomicU32::new(0),
        }
    }

    pub fn with_accounts(self, accounts: Vec<RawAccount>) -> Self {
        *self.accounts.lock().unwrap() = accounts;
        self
    }

    /// Serve all transactions as a single page.
    pub fn with_transactions(self, transactions: Vec<RawTransaction>) -> Self {
        *self.pages.lock().unwrap() = vec![transactions];
        self
    }

    pub fn with_pages(self, pages: Vec<Vec<RawTransaction>>) -> Self {
        *self.pages.lock().unwrap() = pages;
        self
    }

    pub fn failing_account_fetches(self, failures: u32) -> Self {
        self.account_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn failing_transaction_fetches(self, failures: u32) -> Self {
        self.transaction_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn poisoning_range_start(self, start: NaiveDate) -> Self {
        *self.poisoned_range_start.lock().unwrap() = Some(start);
        self
    }

    pub fn replace_transactions(&self, transactions: Vec<RawTransaction>) {
        *self.pages.lock().unwrap() = vec![transactions];
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn fetch_accounts(
        &self,
        _item_token: &SecretString,
    ) -> Result<Vec<RawAccount>, ProviderError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.account_failures) {
            return Err(ProviderError::Transport("scripted failure".to_string()));
        }
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn fetch_transactions(
        &self,
        _item_token: &SecretString,
        range: &DateRange,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, ProviderError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        if *self.poisoned_range_start.lock().unwrap() == Some(range.start) {
            return Err(ProviderError::Transport("scripted failure".to_string()));
        }
        if Self::take_failure(&self.transaction_failures) {
            return Err(ProviderError::Transport("scripted failure".to_string()));
        }

        let pages = self.pages.lock().unwrap();
        let page_index: usize = cursor.map(|c| c.parse().unwrap_or(0)).unwrap_or(0);
        let transactions = pages.get(page_index).cloned().unwrap_or_default();
        let next_cursor = if page_index + 1 < pages.len() {
            Some((page_index + 1).to_string())
        } else {
            None
        };
        Ok(TransactionPage {
            transactions,
            next_cursor,
        })
    }
}

/// Scripted multi-response provider: each fetch_accounts call pops the next
/// scripted account payload, letting tests model provider drift across runs.
pub struct SequencedProvider {
    inner: ScriptedProvider,
    account_responses: Mutex<VecDeque<Vec<RawAccount>>>,
}

impl SequencedProvider {
    pub fn new(responses: Vec<Vec<RawAccount>>) -> Self {
        Self {
            inner: ScriptedProvider::new(),
            account_responses: Mutex::new(responses.into()),
        }
    }

    pub fn with_transactions(self, transactions: Vec<RawTransaction>) -> Self {
        Self {
            inner: self.inner.with_transactions(transactions),
            account_responses: self.account_responses,
        }
    }
}

#[async_trait]
impl ProviderClient for SequencedProvider {
    async fn fetch_accounts(
        &self,
        _item_token: &SecretString,
    ) -> Result<Vec<RawAccount>, ProviderError> {
        let mut responses = self.account_responses.lock().unwrap();
        match responses.len() {
            0 => Ok(Vec::new()),
            1 => Ok(responses[0].clone()),
            _ => Ok(responses.pop_front().unwrap()),
        }
    }

    async fn fetch_transactions(
        &self,
        item_token: &SecretString,
        range: &DateRange,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, ProviderError> {
        self.inner.fetch_transactions(item_token, range, cursor).await
    }
}
