//! Converts raw provider payloads into canonical records.
//!
//! The core rule: missing optional data gets a policy default, missing
//! required data gets a rejection. Accounts have no required fields (a
//! missing provider id only marks the record unstable-identity); transactions
//! require a parseable date, an external id, and a finite amount.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::DEFAULT_CATEGORY;
use crate::provider::{RawAccount, RawTransaction};

use super::FailureReason;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Canonical account record, ready for resolution and upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAccount {
    pub external_account_id: Option<String>,
    pub account_number: Option<String>,
    pub institution_name: Option<String>,
    pub account_name: String,
    pub balance: Option<Decimal>,
    pub currency_code: Option<String>,
    /// No provider identifier: the resolver must use its exhaustive
    /// fallback for this record and the deriver cannot produce a stable id.
    pub unstable_identity: bool,
}

/// Canonical transaction record. `external_account_id` points at the owning
/// account in provider id space; resolution to an internal account happens
/// at upsert time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTransaction {
    pub external_transaction_id: String,
    pub external_account_id: Option<String>,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub category: String,
    pub merchant_name: Option<String>,
    pub description: String,
    pub pending: bool,
}

/// A per-item rejection, recorded in the run report.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct Rejection {
    pub reason: FailureReason,
    pub detail: String,
}

impl Rejection {
    fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Normalize a raw account. Never rejects: an account with no provider
/// identifier is still worth tracking, it just cannot be trusted to resolve
/// by external id.
pub fn normalize_account(raw: &RawAccount) -> NormalizedAccount {
    let external_account_id = non_blank(&raw.account_id);
    let mask = non_blank(&raw.mask);

    // Display name preference: official name, then name, then the mask.
    let account_name = non_blank(&raw.official_name)
        .or_else(|| non_blank(&raw.name))
        .or_else(|| mask.as_ref().map(|m| format!("Account {m}")))
        .unwrap_or_else(|| "Unknown Account".to_string());

    let balance = raw.balance.and_then(|b| Decimal::try_from(b).ok());

    NormalizedAccount {
        unstable_identity: external_account_id.is_none(),
        external_account_id,
        account_number: mask,
        institution_name: non_blank(&raw.institution_name),
        account_name,
        balance,
        currency_code: non_blank(&raw.currency_code),
    }
}

/// Normalize a raw transaction or reject it.
pub fn normalize_transaction(raw: &RawTransaction) -> Result<NormalizedTransaction, Rejection> {
    let external_transaction_id = non_blank(&raw.transaction_id).ok_or_else(|| {
        Rejection::new(
            FailureReason::MissingExternalId,
            "transaction has no provider identifier",
        )
    })?;

    let date_str = non_blank(&raw.date).ok_or_else(|| {
        Rejection::new(FailureReason::InvalidDate, "transaction date is missing")
    })?;
    let transaction_date = NaiveDate::parse_from_str(&date_str, DATE_FORMAT).map_err(|_| {
        Rejection::new(
            FailureReason::InvalidDate,
            format!("unparseable transaction date: {date_str:?}"),
        )
    })?;

    let raw_amount = raw.amount.ok_or_else(|| {
        Rejection::new(FailureReason::InvalidAmount, "transaction amount is missing")
    })?;
    let amount = Decimal::try_from(raw_amount).map_err(|_| {
        Rejection::new(
            FailureReason::InvalidAmount,
            format!("non-finite transaction amount: {raw_amount}"),
        )
    })?;

    let merchant_name = non_blank(&raw.merchant_name);
    let description = non_blank(&raw.name)
        .or_else(|| merchant_name.clone())
        .unwrap_or_else(|| "Transaction".to_string());

    let category = raw
        .category
        .as_ref()
        .map(|segments| {
            segments
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|joined| !joined.is_empty())
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

    Ok(NormalizedTransaction {
        external_transaction_id,
        external_account_id: non_blank(&raw.account_id),
        // The provider reports money leaving the account as positive;
        // internally expenses are negative.
        amount: -amount,
        transaction_date,
        category,
        merchant_name,
        description,
        pending: raw.pending.unwrap_or(false),
    })
}
