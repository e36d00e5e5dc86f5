// ./infrastructure/src/persistence/document_account_repository.rs
use application::{
    AccountRepository, DocumentRepository, DocumentStore, RepositoryError, StoreError, WriteResult,
    require_non_empty,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Account, AccountLink, AccountPatch, fields};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Index holding one document per account, keyed by username.
pub const ACCOUNT_INDEX: &str = "authentication-account";

/// Account repository persisted in a [`DocumentStore`].
#[derive(Clone)]
pub struct DocumentAccountRepository {
    accounts: DocumentRepository<Account>,
}

impl DocumentAccountRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_repository(DocumentRepository::new(store, ACCOUNT_INDEX))
    }

    /// Uses a preconfigured repository, e.g. one with custom scroll settings.
    pub fn with_repository(accounts: DocumentRepository<Account>) -> Self {
        Self { accounts }
    }

    async fn patch(&self, username: &str, patch: AccountPatch) -> Result<WriteResult, RepositoryError> {
        require_non_empty("username", username)?;
        self.accounts.update_item(username, patch.to_fields()).await
    }

    async fn require(&self, username: &str) -> Result<Account, RepositoryError> {
        require_non_empty("username", username)?;
        self.accounts
            .get_item(username)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("account '{}'", username)))
    }
}

fn missing(username: &str) -> RepositoryError {
    StoreError::DocumentMissing(username.to_string()).into()
}

fn term_query(field: &str, value: &str) -> Value {
    let mut term = Map::new();
    term.insert(field.to_string(), Value::String(value.to_string()));
    json!({ "query": { "term": term } })
}

#[async_trait]
impl AccountRepository for DocumentAccountRepository {
    #[instrument(skip(self))]
    async fn load_by_username(&self, username: &str) -> Result<Option<Account>, RepositoryError> {
        require_non_empty("username", username)?;
        self.accounts.get_item(username).await
    }

    #[instrument(skip(self))]
    async fn set_enabled(&self, username: &str) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::enabled(true)).await?;
        info!(%username, "Account enabled");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_disabled(&self, username: &str) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::enabled(false)).await?;
        info!(%username, "Account disabled");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn is_enabled(&self, username: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .load_by_username(username)
            .await?
            .is_some_and(|account| account.is_enabled()))
    }

    #[instrument(skip(self))]
    async fn decrement_attempts_left(&self, username: &str) -> Result<u32, RepositoryError> {
        require_non_empty("username", username)?;
        let (account, version) = self
            .accounts
            .get_versioned(username)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("account '{}'", username)))?;
        let remaining = account.login_attempts_left().saturating_sub(1);
        let partial = AccountPatch::attempts_left(remaining).to_fields();
        match version {
            Some(version) => {
                self.accounts
                    .update_item_if_unchanged(username, partial, version)
                    .await
                    .inspect_err(|e| {
                        if matches!(e, RepositoryError::Store(StoreError::VersionConflict(_))) {
                            warn!(%username, "Attempts counter changed concurrently");
                        }
                    })?;
            }
            None => {
                warn!(%username, "Store returned no version, decrementing unguarded");
                self.accounts.update_item(username, partial).await?;
            }
        }
        debug!(%username, remaining, "Login attempts decremented");
        Ok(remaining)
    }

    #[instrument(skip(self))]
    async fn set_attempts_left(&self, username: &str, attempts: u32) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::attempts_left(attempts)).await?;
        Ok(())
    }

    #[instrument(skip(self, encoded_password))]
    async fn set_password(
        &self,
        username: &str,
        encoded_password: &str,
    ) -> Result<(), RepositoryError> {
        self.patch(username, AccountPatch::password(encoded_password, Utc::now()))
            .await?;
        info!(%username, "Password changed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_encoded_password(&self, username: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .load_by_username(username)
            .await?
            .map(|account| account.encoded_password().to_string()))
    }

    #[instrument(skip(self))]
    async fn get_password_last_change_date(
        &self,
        username: &str,
    ) -> Result<DateTime<Utc>, RepositoryError> {
        Ok(self.require(username).await?.password_last_change_date())
    }

    #[instrument(skip(self, account), fields(username = %account.username()))]
    async fn create_user(&self, account: &Account) -> Result<(), RepositoryError> {
        let username = account.username();
        require_non_empty("username", username)?;
        match self
            .accounts
            .create_item(username, &account.registered(Utc::now()))
            .await
        {
            Ok(_) => {
                info!(%username, "Account created");
                Ok(())
            }
            Err(RepositoryError::Store(StoreError::DocumentExists(_))) => {
                warn!(%username, "Account already exists");
                Err(RepositoryError::AlreadyExists(format!("account '{}'", username)))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, username: &str) -> Result<(), RepositoryError> {
        require_non_empty("username", username)?;
        self.accounts.delete_item(username).await?;
        info!(%username, "Account deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_exists(&self, username: &str) -> Result<bool, RepositoryError> {
        require_non_empty("username", username)?;
        self.accounts.exists(username).await
    }

    #[instrument(skip(self, link))]
    async fn add_link(&self, username: &str, link: &str) -> Result<(), RepositoryError> {
        require_non_empty("link", link)?;
        let link = AccountLink::new(link, Utc::now())?;
        self.patch(username, AccountPatch::link(link)).await?;
        debug!(%username, "Link stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_link(&self, username: &str) -> Result<bool, RepositoryError> {
        require_non_empty("username", username)?;
        let Some((account, version)) = self.accounts.get_versioned(username).await? else {
            return Err(missing(username));
        };
        if account.link().is_none() {
            debug!(%username, "No link to remove");
            return Ok(false);
        }
        let partial = AccountPatch::clear_link().to_fields();
        match version {
            Some(version) => {
                self.accounts
                    .update_item_if_unchanged(username, partial, version)
                    .await?
            }
            None => self.accounts.update_item(username, partial).await?,
        };
        debug!(%username, "Link removed");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn get_link(&self, username: &str) -> Result<Option<AccountLink>, RepositoryError> {
        Ok(self.require(username).await?.link())
    }

    #[instrument(skip(self, link))]
    async fn get_username_by_link(&self, link: &str) -> Result<String, RepositoryError> {
        require_non_empty("link", link)?;
        // A hit holding the link without its issue date has no usable link.
        let matches: Vec<Account> = self
            .accounts
            .search(&term_query(fields::LINK, link))
            .await?
            .into_iter()
            .filter(|account| account.has_link(link))
            .collect();
        if matches.len() > 1 {
            warn!(count = matches.len(), "Link is assigned to several accounts");
        }
        matches
            .into_iter()
            .next()
            .map(|account| account.username().to_string())
            .ok_or_else(|| RepositoryError::NotFound("no account holds this link".to_string()))
    }

    #[instrument(skip(self))]
    async fn all_accounts(&self) -> Result<Vec<Account>, RepositoryError> {
        self.accounts.get_all_items().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;

    fn repository() -> (DocumentAccountRepository, InMemoryDocumentStore) {
        let store = InMemoryDocumentStore::new();
        (DocumentAccountRepository::new(Arc::new(store.clone())), store)
    }

    #[test]
    fn term_query_targets_stored_link_field() {
        assert_eq!(
            term_query(fields::LINK, "abc.def"),
            json!({ "query": { "term": { "token": "abc.def" } } })
        );
    }

    #[tokio::test]
    async fn accounts_live_in_the_account_index() {
        let (repo, store) = repository();
        let account = Account::new("jane@example.com", "hash", 3).unwrap();
        repo.create_user(&account).await.unwrap();
        assert_eq!(store.document_count(ACCOUNT_INDEX), 1);
    }

    #[tokio::test]
    async fn stale_version_surfaces_as_conflict() {
        let (repo, store) = repository();
        let account = Account::new("jane@example.com", "hash", 3).unwrap();
        repo.create_user(&account).await.unwrap();

        let (_, stale) = repo
            .accounts
            .get_versioned("jane@example.com")
            .await
            .unwrap()
            .unwrap();
        repo.set_attempts_left("jane@example.com", 1).await.unwrap();

        let result = store
            .update(
                ACCOUNT_INDEX,
                "jane@example.com",
                AccountPatch::attempts_left(0).to_fields(),
                stale,
            )
            .await;
        assert!(matches!(result, Err(StoreError::VersionConflict(_))));
        assert_eq!(
            repo.load_by_username("jane@example.com")
                .await
                .unwrap()
                .unwrap()
                .login_attempts_left(),
            1
        );
    }

    #[tokio::test]
    async fn remove_link_reports_whether_a_link_was_cleared() {
        let (repo, _) = repository();
        let account = Account::new("jane@example.com", "hash", 3).unwrap();
        repo.create_user(&account).await.unwrap();

        assert!(!repo.remove_link("jane@example.com").await.unwrap());
        repo.add_link("jane@example.com", "reset-1").await.unwrap();
        assert!(repo.remove_link("jane@example.com").await.unwrap());
        assert_eq!(repo.get_link("jane@example.com").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_admit_exactly_one() {
        let (repo, _) = repository();
        let handles: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|name| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    let account = Account::new("jane@example.com", "hash", 3)
                        .unwrap()
                        .with_profile(name, "Doe");
                    repo.create_user(&account).await
                })
            })
            .collect();

        let mut created = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => created += 1,
                Err(RepositoryError::AlreadyExists(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((created, rejected), (1, 1));
    }

    #[tokio::test]
    async fn empty_username_never_reaches_the_store() {
        let (repo, _) = repository();
        assert!(matches!(
            repo.set_enabled("").await,
            Err(RepositoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            repo.add_link("jane@example.com", "").await,
            Err(RepositoryError::InvalidArgument(_))
        ));
    }
}
