//! Boundary to the external aggregation provider.
//!
//! The provider's HTTP client is a black box to this crate: implementations
//! of [`ProviderClient`] return raw payloads or a typed error. Raw payload
//! structs are deliberately lenient — every field the provider might omit is
//! optional, and the normalizer decides what is required.

use chrono::NaiveDate;
use secrecy::SecretString;
use serde::Deserialize;

/// Inclusive calendar-date range for transaction fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// An account record as delivered by the provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAccount {
    /// Provider's account identifier. Absent in pathological payloads.
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub official_name: Option<String>,
    /// Masked account number, typically the last four digits.
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub institution_name: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub currency_code: Option<String>,
}

/// A transaction record as delivered by the provider.
///
/// Amounts use the provider's convention: positive for money leaving the
/// account. The normalizer inverts to the internal convention.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTransaction {
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Provider id of the owning account.
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    /// Calendar date string, expected as YYYY-MM-DD.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    /// Category path segments, most general first.
    #[serde(default)]
    pub category: Option<Vec<String>>,
    #[serde(default)]
    pub pending: Option<bool>,
}

/// One page of transactions plus the cursor for the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct TransactionPage {
    pub transactions: Vec<RawTransaction>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider call timed out")]
    Timeout,
    #[error("provider rate limit hit")]
    RateLimited,
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

impl ProviderError {
    /// Whether a retry can plausibly succeed. Credential and protocol
    /// failures will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Auth(_) | Self::Protocol(_) => false,
        }
    }
}

/// Client for the aggregation provider. Implementations own all wire
/// concerns; the sync engine only sees payloads and typed errors.
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    async fn fetch_accounts(
        &self,
        item_token: &SecretString,
    ) -> Result<Vec<RawAccount>, ProviderError>;

    /// Fetch one page of transactions for the item within `range`.
    /// Pass the cursor from the previous page to continue; `None` starts over.
    async fn fetch_transactions(
        &self,
        item_token: &SecretString,
        range: &DateRange,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, ProviderError>;
}
