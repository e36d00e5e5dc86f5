// ./infrastructure/src/persistence/in_memory_account_repository.rs
use application::{AccountRepository, RepositoryError, StoreError, require_non_empty};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use domain::{Account, AccountLink, AccountPatch};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Account repository kept in process memory.
///
/// Stored accounts are immutable: a change builds a new value with
/// [`Account::apply`] and swaps it in while the key's shard lock is held,
/// so changes to one username are applied one at a time.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccountRepository {
    // Username -> Account
    accounts: Arc<DashMap<String, Arc<Account>>>,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(DashMap::new()),
        }
    }

    /// Replaces the stored account with `change` applied and returns the
    /// value it replaced. `None` when the account does not exist.
    fn modify<F>(&self, username: &str, change: F) -> Option<Arc<Account>>
    where
        F: FnOnce(&Account) -> AccountPatch,
    {
        let mut entry = self.accounts.get_mut(username)?;
        let previous = Arc::clone(entry.value());
        let patch = change(previous.as_ref());
        if !patch.is_empty() {
            *entry = Arc::new(previous.apply(&patch));
        }
        Some(previous)
    }

    fn patch(&self, username: &str, patch: AccountPatch) -> Result<Arc<Account>, RepositoryError> {
        require_non_empty("username", username)?;
        self.modify(username, |_| patch)
            .ok_or_else(|| missing(username))
    }

    fn read(&self, username: &str) -> Result<Option<Arc<Account>>, RepositoryError> {
        require_non_empty("username", username)?;
        Ok(self
            .accounts
            .get(username)
            .map(|account_ref| Arc::clone(account_ref.value())))
    }

    fn require(&self, username: &str) -> Result<Arc<Account>, RepositoryError> {
        self.read(username)?
            .ok_or_else(|| RepositoryError::NotFound(format!("account '{}'", username)))
    }
}

fn missing(username: &str) -> RepositoryError {
    StoreError::DocumentMissing(username.to_string()).into()
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    #[instrument(skip(self))]
    async fn load_by_username(&self, username: &str) -> Result<Option<Account>, RepositoryError> {
        debug!(%username, "Getting account from in-memory store");
        Ok(self.read(username)?.map(|account| (*account).clone()))
    }

    #[instrument(skip(self))]
    async fn set_enabled(&self, username: &str) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::enabled(true))?;
        info!(%username, "Account enabled");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_disabled(&self, username: &str) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::enabled(false))?;
        info!(%username, "Account disabled");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn is_enabled(&self, username: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .read(username)?
            .is_some_and(|account| account.is_enabled()))
    }

    #[instrument(skip(self))]
    async fn decrement_attempts_left(&self, username: &str) -> Result<u32, RepositoryError> {
        require_non_empty("username", username)?;
        let previous = self
            .modify(username, |account| {
                AccountPatch::attempts_left(account.login_attempts_left().saturating_sub(1))
            })
            .ok_or_else(|| RepositoryError::NotFound(format!("account '{}'", username)))?;
        let remaining = previous.login_attempts_left().saturating_sub(1);
        debug!(%username, remaining, "Login attempts decremented");
        Ok(remaining)
    }

    #[instrument(skip(self))]
    async fn set_attempts_left(&self, username: &str, attempts: u32) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::attempts_left(attempts))?;
        Ok(())
    }

    #[instrument(skip(self, encoded_password))]
    async fn set_password(
        &self,
        username: &str,
        encoded_password: &str,
    ) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::password(encoded_password, Utc::now()))?;
        info!(%username, "Password changed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_encoded_password(&self, username: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .read(username)?
            .map(|account| account.encoded_password().to_string()))
    }

    #[instrument(skip(self))]
    async fn get_password_last_change_date(
        &self,
        username: &str,
    ) -> Result<DateTime<Utc>, RepositoryError> {
        Ok(self.require(username)?.password_last_change_date())
    }

    #[instrument(skip(self, account), fields(username = %account.username()))]
    async fn create_user(&self, account: &Account) -> Result<(), RepositoryError> {
        let username = account.username();
        require_non_empty("username", username)?;
        match self.accounts.entry(username.to_string()) {
            Entry::Occupied(_) => {
                warn!(%username, "Account already exists");
                Err(RepositoryError::AlreadyExists(format!("account '{}'", username)))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(account.registered(Utc::now())));
                info!(%username, "Account created");
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, username: &str) -> Result<(), RepositoryError> {
        require_non_empty("username", username)?;
        self.accounts
            .remove(username)
            .ok_or_else(|| missing(username))?;
        info!(%username, "Account deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_exists(&self, username: &str) -> Result<bool, RepositoryError> {
        require_non_empty("username", username)?;
        Ok(self.accounts.contains_key(username))
    }

    #[instrument(skip(self, link))]
    async fn add_link(&self, username: &str, link: &str) -> Result<(), RepositoryError> {
        require_non_empty("link", link)?;
        let link = AccountLink::new(link, Utc::now())?;
        self.patch(username, AccountPatch::link(link))?;
        debug!(%username, "Link stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_link(&self, username: &str) -> Result<bool, RepositoryError> {
        let previous = self.patch(username, AccountPatch::clear_link())?;
        let cleared = previous.link().is_some();
        debug!(%username, cleared, "Link removal");
        Ok(cleared)
    }

    #[instrument(skip(self))]
    async fn get_link(&self, username: &str) -> Result<Option<AccountLink>, RepositoryError> {
        Ok(self.require(username)?.link())
    }

    #[instrument(skip(self, link))]
    async fn get_username_by_link(&self, link: &str) -> Result<String, RepositoryError> {
        require_non_empty("link", link)?;
        // No secondary index: scan every account.
        self.accounts
            .iter()
            .find(|entry| entry.value().has_link(link))
            .map(|entry| entry.key().clone())
            .ok_or_else(|| RepositoryError::NotFound("no account holds this link".to_string()))
    }

    #[instrument(skip(self))]
    async fn all_accounts(&self) -> Result<Vec<Account>, RepositoryError> {
        let accounts: Vec<Account> = self
            .accounts
            .iter()
            .map(|entry| (**entry.value()).clone())
            .collect();
        debug!(count = accounts.len(), "Listing all accounts from in-memory store");
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_account(username: &str, attempts: u32) -> Account {
        Account::new(username, "hash", attempts).unwrap()
    }

    async fn seeded(username: &str, attempts: u32) -> InMemoryAccountRepository {
        let repo = InMemoryAccountRepository::new();
        repo.create_user(&create_test_account(username, attempts))
            .await
            .unwrap();
        repo
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_decrements_are_not_lost() {
        let repo = seeded("jane@example.com", 5).await;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.decrement_attempts_left("jane@example.com").await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        results.sort();

        assert_eq!(results, vec![3, 4]);
        let account = repo.load_by_username("jane@example.com").await.unwrap().unwrap();
        assert_eq!(account.login_attempts_left(), 3);
    }

    #[tokio::test]
    async fn update_keeps_unrelated_fields() {
        let repo = InMemoryAccountRepository::new();
        let account = create_test_account("jane@example.com", 3)
            .with_profile("Jane", "Doe")
            .with_authorities(["ROLE_ADMIN"]);
        repo.create_user(&account).await.unwrap();

        repo.set_enabled("jane@example.com").await.unwrap();
        let stored = repo.load_by_username("jane@example.com").await.unwrap().unwrap();
        assert!(stored.is_enabled());
        assert_eq!(stored.first_name(), "Jane");
        assert_eq!(stored.login_attempts_left(), 3);
        assert!(stored.authorities().contains("ROLE_ADMIN"));
    }

    #[tokio::test]
    async fn returned_accounts_are_snapshots() {
        let repo = seeded("jane@example.com", 3).await;
        let before = repo.load_by_username("jane@example.com").await.unwrap().unwrap();
        repo.set_attempts_left("jane@example.com", 0).await.unwrap();
        assert_eq!(before.login_attempts_left(), 3);
    }

    #[tokio::test]
    async fn changes_to_unknown_accounts_fail() {
        let repo = InMemoryAccountRepository::new();
        assert!(matches!(
            repo.set_enabled("ghost").await,
            Err(RepositoryError::Store(StoreError::DocumentMissing(_)))
        ));
        assert!(matches!(
            repo.delete_user("ghost").await,
            Err(RepositoryError::Store(StoreError::DocumentMissing(_)))
        ));
        assert!(matches!(
            repo.decrement_attempts_left("ghost").await,
            Err(RepositoryError::NotFound(_))
        ));
        assert!(!repo.is_enabled("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn link_lookup_scans_all_accounts() {
        let repo = seeded("a@example.com", 3).await;
        repo.create_user(&create_test_account("b@example.com", 3))
            .await
            .unwrap();
        repo.add_link("b@example.com", "link-b").await.unwrap();

        assert_eq!(repo.get_username_by_link("link-b").await.unwrap(), "b@example.com");
        assert!(matches!(
            repo.get_username_by_link("link-a").await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
