// Behaviour shared by every AccountRepository backend.
use application::{
    AccountRepository, DocumentRepository, RepositoryError, SCROLL_KEEP_ALIVE, StoreError,
};
use domain::{Account, AccountPatch};
use infrastructure::{
    ACCOUNT_INDEX, DocumentAccountRepository, InMemoryAccountRepository, InMemoryDocumentStore,
};
use std::collections::BTreeSet;
use std::sync::Arc;

const JANE: &str = "jane@example.com";

fn create_test_account(username: &str, attempts: u32) -> Account {
    Account::new(username, "$argon2id$initial", attempts)
        .unwrap()
        .with_profile("Jane", "Doe")
        .with_authorities(["ROLE_USER"])
}

fn document_backed() -> Arc<dyn AccountRepository> {
    // Two accounts per page so listing exercises several scroll pages.
    let accounts = DocumentRepository::new(Arc::new(InMemoryDocumentStore::new()), ACCOUNT_INDEX)
        .with_scroll_settings(2, SCROLL_KEEP_ALIVE);
    Arc::new(DocumentAccountRepository::with_repository(accounts))
}

fn map_backed() -> Arc<dyn AccountRepository> {
    Arc::new(InMemoryAccountRepository::new())
}

macro_rules! account_repository_contract {
    ($($backend:ident => $factory:expr),+ $(,)?) => {$(
        mod $backend {
            use super::*;

            async fn repository_with_jane(attempts: u32) -> Arc<dyn AccountRepository> {
                let repo = $factory;
                repo.create_user(&create_test_account(JANE, attempts)).await.unwrap();
                repo
            }

            #[tokio::test]
            async fn created_user_exists_and_starts_disabled() {
                let repo = $factory;
                assert!(!repo.user_exists(JANE).await.unwrap());

                let enabled = create_test_account(JANE, 3).apply(&AccountPatch::enabled(true));
                repo.create_user(&enabled).await.unwrap();

                assert!(repo.user_exists(JANE).await.unwrap());
                assert!(!repo.is_enabled(JANE).await.unwrap());
                let stored = repo.load_by_username(JANE).await.unwrap().unwrap();
                assert_eq!(stored.first_name(), "Jane");
                assert_eq!(stored.login_attempts_left(), 3);
                assert!(stored.authorities().contains("ROLE_USER"));
            }

            #[tokio::test]
            async fn second_create_is_rejected_and_keeps_record() {
                let repo = repository_with_jane(3).await;
                let impostor = Account::new(JANE, "other", 9).unwrap().with_profile("Eve", "X");

                let result = repo.create_user(&impostor).await;
                assert!(matches!(result, Err(RepositoryError::AlreadyExists(_))));

                let stored = repo.load_by_username(JANE).await.unwrap().unwrap();
                assert_eq!(stored.first_name(), "Jane");
                assert_eq!(stored.encoded_password(), "$argon2id$initial");
                assert_eq!(stored.login_attempts_left(), 3);
            }

            #[tokio::test]
            async fn enable_and_disable_toggle_only_the_flag() {
                let repo = repository_with_jane(3).await;

                repo.set_enabled(JANE).await.unwrap();
                assert!(repo.is_enabled(JANE).await.unwrap());
                repo.set_disabled(JANE).await.unwrap();
                assert!(!repo.is_enabled(JANE).await.unwrap());

                let stored = repo.load_by_username(JANE).await.unwrap().unwrap();
                assert_eq!(stored.last_name(), "Doe");
                assert!(!repo.is_enabled("nobody@example.com").await.unwrap());
            }

            #[tokio::test]
            async fn new_password_replaces_hash_and_clears_link() {
                let repo = repository_with_jane(3).await;
                let created_at = repo.get_password_last_change_date(JANE).await.unwrap();
                repo.add_link(JANE, "reset-abc").await.unwrap();

                repo.set_password(JANE, "$argon2id$rotated").await.unwrap();

                assert_eq!(
                    repo.get_encoded_password(JANE).await.unwrap().as_deref(),
                    Some("$argon2id$rotated")
                );
                assert_eq!(repo.get_link(JANE).await.unwrap(), None);
                assert!(repo.get_password_last_change_date(JANE).await.unwrap() >= created_at);
                assert!(matches!(
                    repo.get_username_by_link("reset-abc").await,
                    Err(RepositoryError::NotFound(_))
                ));
            }

            #[tokio::test]
            async fn link_resolves_back_to_its_account() {
                let repo = repository_with_jane(3).await;
                repo.create_user(&create_test_account("bob@example.com", 3)).await.unwrap();

                repo.add_link(JANE, "activate-123").await.unwrap();

                let link = repo.get_link(JANE).await.unwrap().unwrap();
                assert_eq!(link.link, "activate-123");
                assert_eq!(repo.get_username_by_link("activate-123").await.unwrap(), JANE);
                assert_eq!(repo.get_link("bob@example.com").await.unwrap(), None);
                assert!(matches!(
                    repo.get_username_by_link("never-issued").await,
                    Err(RepositoryError::NotFound(_))
                ));
            }

            #[tokio::test]
            async fn remove_link_reports_whether_one_was_cleared() {
                let repo = repository_with_jane(3).await;
                assert!(!repo.remove_link(JANE).await.unwrap());

                repo.add_link(JANE, "reset-1").await.unwrap();
                assert!(repo.remove_link(JANE).await.unwrap());
                assert_eq!(repo.get_link(JANE).await.unwrap(), None);
                assert!(!repo.remove_link(JANE).await.unwrap());
            }

            #[tokio::test]
            async fn empty_link_is_rejected() {
                let repo = repository_with_jane(3).await;
                assert!(matches!(
                    repo.add_link(JANE, "").await,
                    Err(RepositoryError::InvalidArgument(_))
                ));
            }

            #[tokio::test]
            async fn attempts_decrement_and_stop_at_zero() {
                let repo = repository_with_jane(3).await;
                assert_eq!(repo.decrement_attempts_left(JANE).await.unwrap(), 2);

                repo.set_attempts_left(JANE, 0).await.unwrap();
                assert_eq!(repo.decrement_attempts_left(JANE).await.unwrap(), 0);
                let stored = repo.load_by_username(JANE).await.unwrap().unwrap();
                assert_eq!(stored.login_attempts_left(), 0);
            }

            #[tokio::test]
            async fn deleted_user_is_gone() {
                let repo = repository_with_jane(3).await;
                repo.delete_user(JANE).await.unwrap();

                assert_eq!(repo.load_by_username(JANE).await.unwrap(), None);
                assert!(!repo.user_exists(JANE).await.unwrap());
                assert!(matches!(
                    repo.delete_user(JANE).await,
                    Err(RepositoryError::Store(StoreError::DocumentMissing(_)))
                ));
            }

            #[tokio::test]
            async fn unknown_accounts_are_reported() {
                let repo = $factory;
                assert_eq!(repo.load_by_username("ghost").await.unwrap(), None);
                assert_eq!(repo.get_encoded_password("ghost").await.unwrap(), None);
                assert!(matches!(
                    repo.get_link("ghost").await,
                    Err(RepositoryError::NotFound(_))
                ));
                assert!(matches!(
                    repo.get_password_last_change_date("ghost").await,
                    Err(RepositoryError::NotFound(_))
                ));
                assert!(matches!(
                    repo.decrement_attempts_left("ghost").await,
                    Err(RepositoryError::NotFound(_))
                ));
                assert!(matches!(
                    repo.set_password("ghost", "x").await,
                    Err(RepositoryError::Store(StoreError::DocumentMissing(_)))
                ));
            }

            #[tokio::test]
            async fn empty_username_is_an_invalid_argument() {
                let repo = $factory;
                assert!(matches!(
                    repo.load_by_username("").await,
                    Err(RepositoryError::InvalidArgument(_))
                ));
                assert!(matches!(
                    repo.user_exists("").await,
                    Err(RepositoryError::InvalidArgument(_))
                ));
            }

            #[tokio::test]
            async fn authorities_cannot_be_changed() {
                let repo = repository_with_jane(3).await;
                assert!(matches!(
                    repo.set_authority(JANE, "ROLE_ADMIN").await,
                    Err(RepositoryError::NotImplemented(_))
                ));
            }

            #[tokio::test]
            async fn all_accounts_lists_every_account_once() {
                let repo = $factory;
                let usernames: BTreeSet<String> =
                    (0..7).map(|i| format!("user{}@example.com", i)).collect();
                for username in &usernames {
                    repo.create_user(&create_test_account(username, 3)).await.unwrap();
                }

                let listed = repo.all_accounts().await.unwrap();
                assert_eq!(listed.len(), usernames.len());
                let listed: BTreeSet<String> =
                    listed.iter().map(|a| a.username().to_string()).collect();
                assert_eq!(listed, usernames);
            }
        }
    )+};
}

account_repository_contract! {
    document_store => document_backed(),
    in_memory => map_backed(),
}

// Documents written before the link fields existed, or with only one half of
// the link, must read the same way through the document-backed repository.
mod legacy_documents {
    use super::*;
    use application::DocumentStore;
    use serde_json::json;

    async fn store_with(source: serde_json::Value) -> (InMemoryDocumentStore, Arc<dyn AccountRepository>) {
        let store = InMemoryDocumentStore::new();
        store.index(ACCOUNT_INDEX, JANE, source).await.unwrap();
        let repo: Arc<dyn AccountRepository> =
            Arc::new(DocumentAccountRepository::new(Arc::new(store.clone())));
        (store, repo)
    }

    fn without_link_fields() -> serde_json::Value {
        json!({
            "email": JANE,
            "encodedPassword": "$argon2id$initial",
            "enabled": true,
            "loginAttemptsLeft": 3,
            "passwordLastChangeDate": "2024-03-01T12:00:00Z"
        })
    }

    #[tokio::test]
    async fn remove_link_without_stored_link_fields_clears_nothing() {
        let (store, repo) = store_with(without_link_fields()).await;
        assert_eq!(repo.get_link(JANE).await.unwrap(), None);

        assert!(!repo.remove_link(JANE).await.unwrap());

        let stored = store.get(ACCOUNT_INDEX, JANE).await.unwrap().unwrap();
        assert_eq!(stored.source, without_link_fields());
    }

    #[tokio::test]
    async fn remove_link_then_add_link_on_legacy_document() {
        let (_, repo) = store_with(without_link_fields()).await;
        repo.add_link(JANE, "reset-1").await.unwrap();

        assert!(repo.remove_link(JANE).await.unwrap());
        assert!(!repo.remove_link(JANE).await.unwrap());
    }

    #[tokio::test]
    async fn link_without_issue_date_is_not_resolvable() {
        let mut source = without_link_fields();
        source["token"] = json!("orphan");
        source["tokenDate"] = serde_json::Value::Null;
        let (_, repo) = store_with(source).await;

        assert_eq!(repo.get_link(JANE).await.unwrap(), None);
        assert!(matches!(
            repo.get_username_by_link("orphan").await,
            Err(RepositoryError::NotFound(_))
        ));
        assert!(!repo.remove_link(JANE).await.unwrap());
    }

    #[tokio::test]
    async fn remove_link_on_unknown_account_fails() {
        let (_, repo) = store_with(without_link_fields()).await;
        assert!(matches!(
            repo.remove_link("ghost@example.com").await,
            Err(RepositoryError::Store(StoreError::DocumentMissing(_)))
        ));
    }
}
