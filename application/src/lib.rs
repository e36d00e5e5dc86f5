use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Account, AccountLink, DomainError};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

pub mod repository;

pub use repository::{DocumentRepository, SCROLL_KEEP_ALIVE, SCROLL_PAGE_SIZE, SEARCH_PAGE_LIMIT};

// --- Errors ---

/// Failures reported by a document store backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Backend responded with status {status}: {reason}")]
    Backend { status: u16, reason: String },
    #[error("Document '{0}' not found")]
    DocumentMissing(String),
    #[error("Document '{0}' already exists")]
    DocumentExists(String),
    #[error("Version conflict on document '{0}'")]
    VersionConflict(String),
    #[error("Scroll context expired or unknown")]
    ScrollExpired,
    #[error("Malformed backend response: {0}")]
    Malformed(String),
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transport failures and server-side (5xx) errors; everything else is
    /// a definitive answer from the backend.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization(error.to_string())
    }
}

/// Errors surfaced by repositories to their callers.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Domain validation error: {0}")]
    Domain(#[from] DomainError),
}

// --- Document store seam ---

/// Optimistic concurrency token of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentVersion {
    pub seq_no: u64,
    pub primary_term: u64,
}

/// A raw document as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub source: Value,
    pub version: Option<DocumentVersion>,
}

/// Outcome of a write, named the way the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Created,
    Updated,
    Deleted,
    Noop,
    NotFound,
}

impl WriteResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteResult::Created => "created",
            WriteResult::Updated => "updated",
            WriteResult::Deleted => "deleted",
            WriteResult::Noop => "noop",
            WriteResult::NotFound => "not_found",
        }
    }

    pub fn parse(result: &str) -> Option<Self> {
        match result {
            "created" => Some(WriteResult::Created),
            "updated" => Some(WriteResult::Updated),
            "deleted" => Some(WriteResult::Deleted),
            "noop" => Some(WriteResult::Noop),
            "not_found" => Some(WriteResult::NotFound),
            _ => None,
        }
    }
}

/// One page of a scroll. An empty `hits` marks the end of the scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub hits: Vec<StoredDocument>,
}

/// Client to a document store holding named indices of JSON documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches a document; `None` when the store reports it missing.
    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, StoreError>;
    /// Existence check that does not transfer the body.
    async fn exists(&self, index: &str, id: &str) -> Result<bool, StoreError>;
    /// Replaces (or creates) the whole document at `id`.
    async fn index(&self, index: &str, id: &str, body: Value) -> Result<WriteResult, StoreError>;
    /// Writes the document only if `id` is free; otherwise [`StoreError::DocumentExists`].
    async fn create(&self, index: &str, id: &str, body: Value) -> Result<WriteResult, StoreError>;
    /// Merges `fields` into the stored document. With a `guard`, the write is
    /// rejected with [`StoreError::VersionConflict`] unless the stored version matches.
    async fn update(
        &self,
        index: &str,
        id: &str,
        fields: Map<String, Value>,
        guard: Option<DocumentVersion>,
    ) -> Result<WriteResult, StoreError>;
    async fn delete(&self, index: &str, id: &str) -> Result<WriteResult, StoreError>;
    /// Runs `query` and returns at most `size` hits in backend order.
    async fn search(
        &self,
        index: &str,
        query: &Value,
        size: usize,
    ) -> Result<Vec<StoredDocument>, StoreError>;
    /// Starts a scroll over the matches of `query`, returning the first page.
    async fn open_scroll(
        &self,
        index: &str,
        query: &Value,
        page_size: usize,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError>;
    /// Fetches the page after the one that returned `scroll_id`, re-arming the keep-alive.
    async fn next_scroll(&self, scroll_id: &str, keep_alive: Duration)
    -> Result<ScrollPage, StoreError>;
    /// Releases the server-side scroll context.
    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), StoreError>;
}

// --- Account repository contract ---

/// Account lifecycle operations consumed by the authentication flows.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn load_by_username(&self, username: &str) -> Result<Option<Account>, RepositoryError>;
    async fn set_enabled(&self, username: &str) -> Result<(), RepositoryError>;
    async fn set_disabled(&self, username: &str) -> Result<(), RepositoryError>;
    /// `false` for unknown accounts.
    async fn is_enabled(&self, username: &str) -> Result<bool, RepositoryError>;
    /// Lowers the remaining login attempts by one, never below zero, and
    /// returns the new value.
    async fn decrement_attempts_left(&self, username: &str) -> Result<u32, RepositoryError>;
    async fn set_attempts_left(&self, username: &str, attempts: u32) -> Result<(), RepositoryError>;
    /// Stores a new encoded password and invalidates any outstanding link.
    async fn set_password(&self, username: &str, encoded_password: &str)
    -> Result<(), RepositoryError>;
    async fn get_encoded_password(&self, username: &str) -> Result<Option<String>, RepositoryError>;
    async fn get_password_last_change_date(
        &self,
        username: &str,
    ) -> Result<DateTime<Utc>, RepositoryError>;
    async fn set_authority(&self, username: &str, authority: &str) -> Result<(), RepositoryError> {
        let _ = authority;
        Err(RepositoryError::NotImplemented(format!(
            "set_authority for '{}'",
            username
        )))
    }
    /// Registers `account` disabled, with the password change date set to now.
    async fn create_user(&self, account: &Account) -> Result<(), RepositoryError>;
    async fn delete_user(&self, username: &str) -> Result<(), RepositoryError>;
    async fn user_exists(&self, username: &str) -> Result<bool, RepositoryError>;
    async fn add_link(&self, username: &str, link: &str) -> Result<(), RepositoryError>;
    /// Clears the link; `true` when there was one to clear.
    async fn remove_link(&self, username: &str) -> Result<bool, RepositoryError>;
    async fn get_link(&self, username: &str) -> Result<Option<AccountLink>, RepositoryError>;
    async fn get_username_by_link(&self, link: &str) -> Result<String, RepositoryError>;
    /// Every stored account, in no particular order.
    async fn all_accounts(&self) -> Result<Vec<Account>, RepositoryError>;
}

/// Rejects an empty required parameter with [`RepositoryError::InvalidArgument`].
pub fn require_non_empty(name: &str, value: &str) -> Result<(), RepositoryError> {
    if value.is_empty() {
        return Err(RepositoryError::InvalidArgument(format!(
            "{} must not be empty",
            name
        )));
    }
    Ok(())
}
