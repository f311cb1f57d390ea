mod account;
mod id;
mod transaction;

pub use account::{last_four_digits, Account};
pub use id::{derive_account_id, derive_transaction_id, DerivedId, Id, IdError};
pub use transaction::{Transaction, DEFAULT_CATEGORY};
