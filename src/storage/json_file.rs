use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::models::{Account, Id, Transaction};

use super::Storage;

/// JSON file-based storage implementation.
///
/// Directory structure:
/// ```text
/// data/
///   accounts/
///     {account_id}.json
///   transactions/
///     {transaction_id}.json
/// ```
///
/// Conditional inserts use `create_new`, so the filesystem itself arbitrates
/// between concurrent creators of the same id.
pub struct JsonFileStorage {
    base_path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn accounts_dir(&self) -> PathBuf {
        self.base_path.join("accounts")
    }

    fn transactions_dir(&self) -> PathBuf {
        self.base_path.join("transactions")
    }

    fn account_file(&self, id: &Id) -> PathBuf {
        self.accounts_dir().join(format!("{id}.json"))
    }

    fn transaction_file(&self, id: &Id) -> PathBuf {
        self.transactions_dir().join(format!("{id}.json"))
    }

    async fn ensure_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create directory")?;
        }
        Ok(())
    }

    async fn read_json<T: for<'de> serde::Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let value = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse JSON from {path:?}"))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read file"),
        }
    }

    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        Self::ensure_dir(path).await?;
        let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
        fs::write(path, content)
            .await
            .context("Failed to write file")?;
        Ok(())
    }

    /// Write only if the file does not exist yet. Returns false when another
    /// writer got there first.
    async fn write_json_if_absent<T: serde::Serialize>(path: &Path, value: &T) -> Result<bool> {
        Self::ensure_dir(path).await?;
        let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
        let mut open = fs::OpenOptions::new();
        open.write(true).create_new(true);
        match open.open(path).await {
            Ok(mut file) => {
                file.write_all(content.as_bytes())
                    .await
                    .context("Failed to write file")?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).context("Failed to create file"),
        }
    }

    async fn list_ids(path: &Path) -> Result<Vec<Id>> {
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(path).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e).context("Failed to read directory"),
        };

        while let Some(entry) = entries.next_entry().await.context("Failed to read entry")? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                if !stem.is_empty() {
                    ids.push(Id::from(stem));
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn scan_transactions(&self) -> Result<Vec<Transaction>> {
        let ids = Self::list_ids(&self.transactions_dir()).await?;
        let mut transactions = Vec::new();
        for id in ids {
            if let Some(tx) = Self::read_json(&self.transaction_file(&id)).await? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }
}

#[async_trait::async_trait]
impl Storage for JsonFileStorage {
    async fn get_account(&self, id: &Id) -> Result<Option<Account>> {
        Self::read_json(&self.account_file(id)).await
    }

    async fn put_account(&self, account: &Account) -> Result<()> {
        Self::write_json(&self.account_file(&account.account_id), account).await
    }

    async fn put_account_if_absent(&self, account: &Account) -> Result<bool> {
        Self::write_json_if_absent(&self.account_file(&account.account_id), account).await
    }

    async fn delete_account(&self, id: &Id) -> Result<bool> {
        match fs::remove_file(self.account_file(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to delete account file"),
        }
    }

    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>> {
        let ids = Self::list_ids(&self.accounts_dir()).await?;
        let mut accounts = Vec::new();
        for id in ids {
            if let Some(account) = self.get_account(&id).await? {
                if account.user_id == user_id {
                    accounts.push(account);
                }
            }
        }
        Ok(accounts)
    }

    async fn get_transaction(&self, id: &Id) -> Result<Option<Transaction>> {
        Self::read_json(&self.transaction_file(id)).await
    }

    async fn put_transaction(&self, transaction: &Transaction) -> Result<()> {
        Self::write_json(&self.transaction_file(&transaction.transaction_id), transaction).await
    }

    async fn put_transaction_if_absent(&self, transaction: &Transaction) -> Result<bool> {
        Self::write_json_if_absent(&self.transaction_file(&transaction.transaction_id), transaction)
            .await
    }

    async fn transactions_for_account(&self, account_id: &Id) -> Result<Vec<Transaction>> {
        Ok(self
            .scan_transactions()
            .await?
            .into_iter()
            .filter(|t| &t.account_id == account_id)
            .collect())
    }

    async fn find_transaction_by_external_id(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<Transaction>> {
        Ok(self.scan_transactions().await?.into_iter().find(|t| {
            t.user_id == user_id && t.external_transaction_id.as_deref() == Some(external_id)
        }))
    }
}
