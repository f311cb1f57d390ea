use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Id;

/// Sentinel category for transactions the provider did not categorize.
pub const DEFAULT_CATEGORY: &str = "Other";

/// One ledger entry belonging to exactly one account.
///
/// Amounts follow the internal sign convention: expenses negative, income
/// positive. Normalization flips provider amounts into this convention before
/// a transaction is ever constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Id,
    pub account_id: Id,
    pub user_id: String,
    /// The provider's identifier, used for resolution on later runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_transaction_id: Option<String>,
    pub amount: Decimal,
    /// Canonical calendar date. No time component, no timezone.
    pub transaction_date: NaiveDate,
    /// Never empty once persisted; "Other" when the provider had nothing.
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_name: Option<String>,
    pub description: String,
    #[serde(default)]
    pub pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
