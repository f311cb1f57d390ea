mod json_file;
mod memory;

pub use json_file::JsonFileStorage;
pub use memory::MemoryStorage;

use anyhow::Result;

use crate::models::{Account, Id, Transaction};

/// Storage trait for persisted entities.
///
/// Models a table abstraction: point lookups by internal id, whole-entity
/// puts, conditional puts for the create path, and per-user scans. Secondary
/// lookups may be indexes or scans underneath; callers must not assume cost.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    // Accounts
    async fn get_account(&self, id: &Id) -> Result<Option<Account>>;
    async fn put_account(&self, account: &Account) -> Result<()>;
    /// Insert only if no account with this id exists.
    /// Returns false (and writes nothing) when the id is already taken.
    async fn put_account_if_absent(&self, account: &Account) -> Result<bool>;
    /// Remove an account record. Used only by the duplicate merger.
    async fn delete_account(&self, id: &Id) -> Result<bool>;
    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>>;

    // Transactions
    async fn get_transaction(&self, id: &Id) -> Result<Option<Transaction>>;
    async fn put_transaction(&self, transaction: &Transaction) -> Result<()>;
    async fn put_transaction_if_absent(&self, transaction: &Transaction) -> Result<bool>;
    async fn transactions_for_account(&self, account_id: &Id) -> Result<Vec<Transaction>>;
    async fn find_transaction_by_external_id(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<Transaction>>;
}

/// Accounts a user-facing listing would show: everything except records
/// explicitly marked inactive. A missing flag never hides an account.
pub async fn visible_accounts(storage: &dyn Storage, user_id: &str) -> Result<Vec<Account>> {
    let accounts = storage.accounts_for_user(user_id).await?;
    Ok(accounts.into_iter().filter(Account::is_active).collect())
}
