// ./application/src/repository.rs
use crate::{
    DocumentStore, DocumentVersion, RepositoryError, StoreError, StoredDocument, WriteResult,
    require_non_empty,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Upper bound on hits returned by a single `search`.
pub const SEARCH_PAGE_LIMIT: usize = 5000;
/// Hits requested per scroll page in `get_all_items`.
pub const SCROLL_PAGE_SIZE: usize = 1000;
/// How long the store keeps a scroll context alive between two page requests.
pub const SCROLL_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// CRUD, search and full-scan primitives over one index of a [`DocumentStore`],
/// typed by the record stored in it.
pub struct DocumentRepository<T> {
    store: Arc<dyn DocumentStore>,
    index: String,
    scroll_page_size: usize,
    scroll_keep_alive: Duration,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for DocumentRepository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            index: self.index.clone(),
            scroll_page_size: self.scroll_page_size,
            scroll_keep_alive: self.scroll_keep_alive,
            _record: PhantomData,
        }
    }
}

impl<T> DocumentRepository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn DocumentStore>, index: impl Into<String>) -> Self {
        Self {
            store,
            index: index.into(),
            scroll_page_size: SCROLL_PAGE_SIZE,
            scroll_keep_alive: SCROLL_KEEP_ALIVE,
            _record: PhantomData,
        }
    }

    /// Overrides the page size and keep-alive used by [`Self::get_all_items`].
    pub fn with_scroll_settings(mut self, page_size: usize, keep_alive: Duration) -> Self {
        self.scroll_page_size = page_size.max(1);
        self.scroll_keep_alive = keep_alive;
        self
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// Full replace-or-create of the document at `id`. Every stored field is
    /// overwritten; use [`Self::update_item`] to touch only some of them.
    #[instrument(skip(self, body, index))]
    pub async fn index_item(
        &self,
        id: &str,
        body: &T,
        index: Option<&str>,
    ) -> Result<WriteResult, RepositoryError> {
        require_non_empty("id", id)?;
        let index = index.unwrap_or(&self.index);
        debug!(doc_id = %id, %index, "Indexing document");
        let body = serde_json::to_value(body).map_err(StoreError::from)?;
        let result = self.store.index(index, id, body).await?;
        debug!(doc_id = %id, result = result.as_str(), "Index response");
        Ok(result)
    }

    /// Writes `body` at `id` only if no document is stored there yet; an
    /// occupied id fails with [`StoreError::DocumentExists`].
    #[instrument(skip(self, body), fields(index = %self.index))]
    pub async fn create_item(&self, id: &str, body: &T) -> Result<WriteResult, RepositoryError> {
        require_non_empty("id", id)?;
        debug!(doc_id = %id, "Creating document");
        let body = serde_json::to_value(body).map_err(StoreError::from)?;
        let result = self.store.create(&self.index, id, body).await?;
        debug!(doc_id = %id, result = result.as_str(), "Create response");
        Ok(result)
    }

    #[instrument(skip(self), fields(index = %self.index))]
    pub async fn get_item(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        Ok(self.get_versioned(id).await?.map(|(item, _)| item))
    }

    /// Like [`Self::get_item`], also returning the version token for a guarded update.
    #[instrument(skip(self), fields(index = %self.index))]
    pub async fn get_versioned(
        &self,
        id: &str,
    ) -> Result<Option<(T, Option<DocumentVersion>)>, RepositoryError> {
        require_non_empty("id", id)?;
        match self.store.get(&self.index, id).await? {
            Some(document) => {
                debug!(doc_id = %id, "Successfully retrieved item");
                let version = document.version;
                Ok(Some((decode(document)?, version)))
            }
            None => {
                debug!(doc_id = %id, "Item was not found");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(index = %self.index))]
    pub async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        require_non_empty("id", id)?;
        Ok(self.store.exists(&self.index, id).await?)
    }

    /// Merges `fields` into the stored document, leaving unlisted fields untouched.
    #[instrument(skip(self, partial), fields(index = %self.index, field_count = partial.len()))]
    pub async fn update_item(
        &self,
        id: &str,
        partial: Map<String, Value>,
    ) -> Result<WriteResult, RepositoryError> {
        require_non_empty("id", id)?;
        let result = self.store.update(&self.index, id, partial, None).await?;
        debug!(doc_id = %id, result = result.as_str(), "Update response");
        Ok(result)
    }

    /// Partial update that only applies if the document is still at `version`.
    #[instrument(skip(self, partial, version), fields(index = %self.index, seq_no = version.seq_no))]
    pub async fn update_item_if_unchanged(
        &self,
        id: &str,
        partial: Map<String, Value>,
        version: DocumentVersion,
    ) -> Result<WriteResult, RepositoryError> {
        require_non_empty("id", id)?;
        let result = self
            .store
            .update(&self.index, id, partial, Some(version))
            .await?;
        debug!(doc_id = %id, result = result.as_str(), "Guarded update response");
        Ok(result)
    }

    #[instrument(skip(self), fields(index = %self.index))]
    pub async fn delete_item(&self, id: &str) -> Result<WriteResult, RepositoryError> {
        require_non_empty("id", id)?;
        debug!(doc_id = %id, "Deleting document");
        let result = self.store.delete(&self.index, id).await?;
        debug!(doc_id = %id, result = result.as_str(), "Delete response");
        Ok(result)
    }

    /// Returns up to [`SEARCH_PAGE_LIMIT`] records matching `query`, in backend order.
    #[instrument(skip(self, query), fields(index = %self.index))]
    pub async fn search(&self, query: &Value) -> Result<Vec<T>, RepositoryError> {
        if !query.is_object() {
            return Err(RepositoryError::InvalidArgument(
                "search query must be a JSON object".to_string(),
            ));
        }
        debug!(%query, "Searching");
        let hits = self
            .store
            .search(&self.index, query, SEARCH_PAGE_LIMIT)
            .await?;
        debug!(count = hits.len(), "Successfully retrieved items for query");
        hits.into_iter().map(decode).collect()
    }

    /// Reads the whole index through a scroll, page after page, until the
    /// store returns an empty page. Records keep the order the store returned them in.
    /// The scroll context is released whether the scan succeeds or not.
    #[instrument(skip(self), fields(index = %self.index))]
    pub async fn get_all_items(&self) -> Result<Vec<T>, RepositoryError> {
        let mut last_scroll_id = None;
        let result = self.scan(&mut last_scroll_id).await;

        if let Some(scroll_id) = last_scroll_id {
            if let Err(e) = self.store.clear_scroll(&scroll_id).await {
                warn!("Failed to release scroll context: {}", e);
            }
        }
        match &result {
            Ok(items) => debug!(total = items.len(), "Full scan complete"),
            Err(e) => warn!("Full scan aborted: {}", e),
        }
        result
    }

    async fn scan(&self, last_scroll_id: &mut Option<String>) -> Result<Vec<T>, RepositoryError> {
        let query = json!({ "query": { "match_all": {} } });
        let mut page = self
            .store
            .open_scroll(
                &self.index,
                &query,
                self.scroll_page_size,
                self.scroll_keep_alive,
            )
            .await?;

        let mut items = Vec::new();
        loop {
            if let Some(scroll_id) = page.scroll_id.take() {
                *last_scroll_id = Some(scroll_id);
            }
            debug!(found = page.hits.len(), "Scroll page received");
            if page.hits.is_empty() {
                return Ok(items);
            }
            for hit in page.hits {
                items.push(decode(hit)?);
            }
            let Some(scroll_id) = last_scroll_id.as_deref() else {
                return Err(StoreError::Malformed(
                    "non-empty scroll page without a scroll id".to_string(),
                )
                .into());
            };
            page = self
                .store
                .next_scroll(scroll_id, self.scroll_keep_alive)
                .await?;
        }
    }
}

fn decode<T: DeserializeOwned>(document: StoredDocument) -> Result<T, RepositoryError> {
    serde_json::from_value(document.source).map_err(|e| {
        StoreError::Malformed(format!("document '{}' does not decode: {}", document.id, e)).into()
    })
}
