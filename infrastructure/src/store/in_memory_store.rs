// ./infrastructure/src/store/in_memory_store.rs
use application::{DocumentStore, DocumentVersion, ScrollPage, StoreError, StoredDocument, WriteResult};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

// A single-node store never fails over, so the term stays fixed.
const PRIMARY_TERM: u64 = 1;

#[derive(Debug, Clone)]
struct StoredEntry {
    source: Arc<Value>,
    seq_no: u64,
}

/// Snapshot of the matches taken when the scroll was opened.
#[derive(Debug)]
struct ScrollCursor {
    hits: Vec<StoredDocument>,
    position: usize,
    page_size: usize,
    expires_at: Instant,
}

impl ScrollCursor {
    fn next_page(&mut self) -> Vec<StoredDocument> {
        let end = (self.position + self.page_size).min(self.hits.len());
        let page = self.hits[self.position..end].to_vec();
        self.position = end;
        page
    }
}

/// Query shapes understood by the in-memory store.
#[derive(Debug, PartialEq)]
enum Query {
    MatchAll,
    Term { field: String, value: Value },
}

/// Process-local document store with the same contract as the remote one:
/// sequence-numbered writes, merge updates with noop detection, term
/// queries and expiring scroll cursors.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    // Index Name -> (Document ID -> Entry)
    indices: Arc<DashMap<String, DashMap<String, StoredEntry>>>,
    // Scroll ID -> Cursor
    scrolls: Arc<DashMap<String, ScrollCursor>>,
    seq_no: Arc<AtomicU64>,
    scroll_counter: Arc<AtomicU64>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently stored in `index`.
    pub fn document_count(&self, index: &str) -> usize {
        self.indices.get(index).map_or(0, |docs| docs.len())
    }

    /// Number of scroll contexts that have not been cleared yet.
    pub fn open_scroll_count(&self) -> usize {
        self.scrolls.len()
    }

    /// Drops every cursor whose keep-alive has run out.
    fn purge_expired_scrolls(&self, now: Instant) {
        let before = self.scrolls.len();
        self.scrolls.retain(|_, cursor| cursor.expires_at >= now);
        let purged = before.saturating_sub(self.scrolls.len());
        if purged > 0 {
            debug!(purged, "Dropped expired scroll contexts");
        }
    }

    fn next_seq_no(&self) -> u64 {
        self.seq_no.fetch_add(1, Ordering::SeqCst)
    }

    /// Matching documents of `index`, ordered by id.
    fn matching(&self, index: &str, query: &Query) -> Vec<StoredDocument> {
        let Some(docs) = self.indices.get(index) else {
            return Vec::new();
        };
        let mut hits: Vec<StoredDocument> = docs
            .iter()
            .filter(|entry| query.matches(&entry.value().source))
            .map(|entry| to_document(entry.key(), entry.value()))
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    #[instrument(skip(self))]
    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let document = self
            .indices
            .get(index)
            .and_then(|docs| docs.get(id).map(|entry| to_document(id, entry.value())));
        Ok(document)
    }

    #[instrument(skip(self))]
    async fn exists(&self, index: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .indices
            .get(index)
            .is_some_and(|docs| docs.contains_key(id)))
    }

    #[instrument(skip(self, body))]
    async fn index(&self, index: &str, id: &str, body: Value) -> Result<WriteResult, StoreError> {
        if !body.is_object() {
            return Err(StoreError::Backend {
                status: 400,
                reason: "mapper_parsing_exception: document body must be an object".to_string(),
            });
        }
        let docs = self.indices.entry(index.to_string()).or_default();
        let entry = StoredEntry {
            source: Arc::new(body),
            seq_no: self.next_seq_no(),
        };
        let result = match docs.insert(id.to_string(), entry) {
            Some(_) => WriteResult::Updated,
            None => WriteResult::Created,
        };
        debug!(result = result.as_str(), "Document written to in-memory store");
        Ok(result)
    }

    #[instrument(skip(self, body))]
    async fn create(&self, index: &str, id: &str, body: Value) -> Result<WriteResult, StoreError> {
        if !body.is_object() {
            return Err(StoreError::Backend {
                status: 400,
                reason: "mapper_parsing_exception: document body must be an object".to_string(),
            });
        }
        let docs = self.indices.entry(index.to_string()).or_default();
        match docs.entry(id.to_string()) {
            Entry::Occupied(_) => {
                debug!("Create rejected, id already taken");
                Err(StoreError::DocumentExists(id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredEntry {
                    source: Arc::new(body),
                    seq_no: self.next_seq_no(),
                });
                Ok(WriteResult::Created)
            }
        }
    }

    #[instrument(skip(self, fields))]
    async fn update(
        &self,
        index: &str,
        id: &str,
        fields: Map<String, Value>,
        guard: Option<DocumentVersion>,
    ) -> Result<WriteResult, StoreError> {
        let missing = || StoreError::DocumentMissing(id.to_string());
        let docs = self.indices.get(index).ok_or_else(missing)?;
        let mut entry = docs.get_mut(id).ok_or_else(missing)?;

        if let Some(guard) = guard {
            if guard.seq_no != entry.seq_no || guard.primary_term != PRIMARY_TERM {
                warn!(
                    expected = guard.seq_no,
                    actual = entry.seq_no,
                    "Rejecting update against a stale version"
                );
                return Err(StoreError::VersionConflict(id.to_string()));
            }
        }

        let mut merged = (*entry.source).clone();
        merge(&mut merged, fields);
        if merged == *entry.source {
            trace!("Update changes nothing, reporting noop");
            return Ok(WriteResult::Noop);
        }
        *entry = StoredEntry {
            source: Arc::new(merged),
            seq_no: self.next_seq_no(),
        };
        Ok(WriteResult::Updated)
    }

    #[instrument(skip(self))]
    async fn delete(&self, index: &str, id: &str) -> Result<WriteResult, StoreError> {
        let removed = self
            .indices
            .get(index)
            .and_then(|docs| docs.remove(id));
        match removed {
            Some(_) => Ok(WriteResult::Deleted),
            None => Err(StoreError::DocumentMissing(id.to_string())),
        }
    }

    #[instrument(skip(self, query))]
    async fn search(
        &self,
        index: &str,
        query: &Value,
        size: usize,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let query = Query::parse(query)?;
        let mut hits = self.matching(index, &query);
        hits.truncate(size);
        debug!(count = hits.len(), "In-memory search complete");
        Ok(hits)
    }

    #[instrument(skip(self, query))]
    async fn open_scroll(
        &self,
        index: &str,
        query: &Value,
        page_size: usize,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let query = Query::parse(query)?;
        let now = Instant::now();
        self.purge_expired_scrolls(now);
        let mut cursor = ScrollCursor {
            hits: self.matching(index, &query),
            position: 0,
            page_size: page_size.max(1),
            expires_at: now + keep_alive,
        };
        let hits = cursor.next_page();
        let scroll_id = format!(
            "scroll-{}",
            self.scroll_counter.fetch_add(1, Ordering::SeqCst)
        );
        debug!(%scroll_id, total = cursor.hits.len(), "Opened scroll");
        self.scrolls.insert(scroll_id.clone(), cursor);
        Ok(ScrollPage {
            scroll_id: Some(scroll_id),
            hits,
        })
    }

    #[instrument(skip(self))]
    async fn next_scroll(
        &self,
        scroll_id: &str,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let now = Instant::now();
        self.purge_expired_scrolls(now);
        let mut cursor = self.scrolls.get_mut(scroll_id).ok_or_else(|| {
            debug!("Scroll context expired or unknown");
            StoreError::ScrollExpired
        })?;
        cursor.expires_at = now + keep_alive;
        let hits = cursor.next_page();
        Ok(ScrollPage {
            scroll_id: Some(scroll_id.to_string()),
            hits,
        })
    }

    #[instrument(skip(self))]
    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), StoreError> {
        if self.scrolls.remove(scroll_id).is_none() {
            debug!("Scroll context already gone");
        }
        Ok(())
    }
}

impl Query {
    fn parse(body: &Value) -> Result<Self, StoreError> {
        let Some(query) = body.get("query") else {
            return Ok(Query::MatchAll);
        };
        if query.get("match_all").is_some() {
            return Ok(Query::MatchAll);
        }
        if let Some(Value::Object(term)) = query.get("term") {
            if let (1, Some((field, value))) = (term.len(), term.iter().next()) {
                let value = match value {
                    Value::Object(options) => options.get("value").cloned().ok_or_else(|| {
                        unsupported(format!("term query on '{}' has no value", field))
                    })?,
                    other => other.clone(),
                };
                return Ok(Query::Term {
                    field: field.clone(),
                    value,
                });
            }
            return Err(unsupported("term query must name exactly one field".to_string()));
        }
        Err(unsupported(format!("unsupported query: {}", query)))
    }

    fn matches(&self, source: &Value) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => match source.get(field.as_str()) {
                Some(Value::Array(items)) => items.contains(value),
                Some(stored) => stored == value,
                None => false,
            },
        }
    }
}

fn unsupported(reason: String) -> StoreError {
    StoreError::Backend {
        status: 400,
        reason: format!("parsing_exception: {}", reason),
    }
}

fn to_document(id: &str, entry: &StoredEntry) -> StoredDocument {
    StoredDocument {
        id: id.to_string(),
        source: (*entry.source).clone(),
        version: Some(DocumentVersion {
            seq_no: entry.seq_no,
            primary_term: PRIMARY_TERM,
        }),
    }
}

/// Merges `fields` into `target`; nested objects are merged key by key.
fn merge(target: &mut Value, fields: Map<String, Value>) {
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in fields {
        match (target.get_mut(&key), value) {
            (Some(existing @ Value::Object(_)), Value::Object(nested)) => merge(existing, nested),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}
