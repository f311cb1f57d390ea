use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Id;

/// One financial account at one institution, owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Id,
    /// Owner. Immutable after creation.
    pub user_id: String,
    /// The provider's identifier for this account. Absent only for
    /// unstable-identity records observed before the provider supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_account_id: Option<String>,
    /// Masked or partial account number, e.g. "1234" or "****1234".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution_name: Option<String>,
    pub account_name: String,
    /// Provider-reported balance as last observed; never computed locally.
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default = "default_currency")]
    pub currency_code: String,
    /// Absent is not the same as false: a missing flag never hides an
    /// account. Read through [`Account::is_active`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// Set when the internal id had to be generated without stable provider
    /// attributes. Cleared once identity fields are backfilled.
    #[serde(default)]
    pub unstable_identity: bool,
    /// Completion time of the last successful transaction pass. Drives
    /// incremental date ranges; None means no transactions fetched yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Set once, never updated.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.active.unwrap_or(true)
    }

    /// Trailing digits of the account number, up to four. Used as the fuzzy
    /// identity key alongside the institution.
    pub fn last_four(&self) -> Option<String> {
        self.account_number.as_deref().and_then(last_four_digits)
    }
}

/// Extract up to the last four digits of a possibly-masked number.
/// Returns None when the value contains no digits at all.
pub fn last_four_digits(number: &str) -> Option<String> {
    let digits: Vec<char> = number.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let start = digits.len().saturating_sub(4);
    Some(digits[start..].iter().collect())
}
