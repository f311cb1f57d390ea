//! In-memory storage implementation for testing.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::models::{Account, Id, Transaction};

use super::Storage;

/// In-memory storage for testing purposes.
///
/// Keeps a secondary index on (user id, external transaction id) so the
/// resolver's transaction lookup stays a point read, mirroring what a real
/// table would do with a secondary index.
pub struct MemoryStorage {
    accounts: Mutex<HashMap<Id, Account>>,
    transactions: Mutex<HashMap<Id, Transaction>>,
    transactions_by_external: Mutex<HashMap<(String, String), Id>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            transactions_by_external: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn get_account(&self, id: &Id) -> Result<Option<Account>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts.get(id).cloned())
    }

    async fn put_account(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        accounts.insert(account.account_id.clone(), account.clone());
        Ok(())
    }

    async fn put_account_if_absent(&self, account: &Account) -> Result<bool> {
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&account.account_id) {
            return Ok(false);
        }
        accounts.insert(account.account_id.clone(), account.clone());
        Ok(true)
    }

    async fn delete_account(&self, id: &Id) -> Result<bool> {
        let mut accounts = self.accounts.lock().await;
        Ok(accounts.remove(id).is_some())
    }

    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>> {
        let accounts = self.accounts.lock().await;
        let mut matching: Vec<Account> = accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(matching)
    }

    async fn get_transaction(&self, id: &Id) -> Result<Option<Transaction>> {
        let transactions = self.transactions.lock().await;
        Ok(transactions.get(id).cloned())
    }

    async fn put_transaction(&self, transaction: &Transaction) -> Result<()> {
        let mut transactions = self.transactions.lock().await;
        if let Some(external) = &transaction.external_transaction_id {
            let mut index = self.transactions_by_external.lock().await;
            index.insert(
                (transaction.user_id.clone(), external.clone()),
                transaction.transaction_id.clone(),
            );
        }
        transactions.insert(transaction.transaction_id.clone(), transaction.clone());
        Ok(())
    }

    async fn put_transaction_if_absent(&self, transaction: &Transaction) -> Result<bool> {
        {
            let transactions = self.transactions.lock().await;
            if transactions.contains_key(&transaction.transaction_id) {
                return Ok(false);
            }
        }
        self.put_transaction(transaction).await?;
        Ok(true)
    }

    async fn transactions_for_account(&self, account_id: &Id) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.lock().await;
        let mut matching: Vec<Transaction> = transactions
            .values()
            .filter(|t| &t.account_id == account_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        Ok(matching)
    }

    async fn find_transaction_by_external_id(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<Transaction>> {
        let id = {
            let index = self.transactions_by_external.lock().await;
            index
                .get(&(user_id.to_string(), external_id.to_string()))
                .cloned()
        };
        match id {
            Some(id) => self.get_transaction(&id).await,
            None => Ok(None),
        }
    }
}
