// ./infrastructure/src/store/elasticsearch.rs
use crate::config::Credentials;
use application::{DocumentStore, DocumentVersion, ScrollPage, StoreError, StoredDocument, WriteResult};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

const SCROLL_MISSING: &str = "search_context_missing_exception";

/// When writes become visible to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Visible after the next periodic refresh.
    #[default]
    None,
    /// Force a refresh right after the write.
    Immediate,
    /// Hold the response until a refresh made the write visible.
    WaitFor,
}

impl RefreshPolicy {
    fn as_param(&self) -> Option<&'static str> {
        match self {
            RefreshPolicy::None => None,
            RefreshPolicy::Immediate => Some("true"),
            RefreshPolicy::WaitFor => Some("wait_for"),
        }
    }
}

impl FromStr for RefreshPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "false" | "none" => Ok(RefreshPolicy::None),
            "true" | "immediate" => Ok(RefreshPolicy::Immediate),
            "wait_for" => Ok(RefreshPolicy::WaitFor),
            other => Err(format!("unknown refresh policy '{}'", other)),
        }
    }
}

/// [`DocumentStore`] speaking the Elasticsearch REST protocol.
///
/// Holds one `reqwest::Client`, so clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    base: Url,
    credentials: Option<Credentials>,
    refresh: RefreshPolicy,
    client: reqwest::Client,
}

impl ElasticsearchClient {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            credentials: None,
            refresh: RefreshPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_refresh_policy(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn request<I>(&self, method: Method, path_segments: I) -> Result<RequestBuilder, StoreError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                StoreError::Transport(format!("'{}' cannot be used as a base URL", self.base))
            })?
            .pop_if_empty()
            .extend(path_segments);
        let mut builder = self.client.request(method, url);
        if let Some(credentials) = &self.credentials {
            builder = builder.basic_auth(credentials.username(), Some(credentials.password()));
        }
        Ok(builder)
    }

    fn write_request<I>(&self, method: Method, path_segments: I) -> Result<RequestBuilder, StoreError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let builder = self.request(method, path_segments)?;
        Ok(match self.refresh.as_param() {
            Some(refresh) => builder.query(&[("refresh", refresh)]),
            None => builder,
        })
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchClient {
    #[instrument(skip(self))]
    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let response = self
            .request(Method::GET, [index, "_doc", id])?
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Document not found");
            return Ok(None);
        }
        let body: GetResponse = response.parse().await?;
        if !body.found {
            return Ok(None);
        }
        let source = body.source.ok_or_else(|| {
            StoreError::Malformed(format!("document '{}' returned without _source", body.id))
        })?;
        Ok(Some(StoredDocument {
            id: body.id,
            source,
            version: version(body.seq_no, body.primary_term),
        }))
    }

    #[instrument(skip(self))]
    async fn exists(&self, index: &str, id: &str) -> Result<bool, StoreError> {
        let response = self
            .request(Method::HEAD, [index, "_doc", id])?
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(response.into_store_error().await),
        }
    }

    #[instrument(skip(self, body))]
    async fn index(&self, index: &str, id: &str, body: Value) -> Result<WriteResult, StoreError> {
        let response = self
            .write_request(Method::PUT, [index, "_doc", id])?
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let body: WriteResponse = response.parse().await?;
        body.into_result()
    }

    #[instrument(skip(self, body))]
    async fn create(&self, index: &str, id: &str, body: Value) -> Result<WriteResult, StoreError> {
        let response = self
            .write_request(Method::PUT, [index, "_create", id])?
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Create rejected, id already taken");
            return Err(StoreError::DocumentExists(id.to_string()));
        }
        response.parse::<WriteResponse>().await?.into_result()
    }

    #[instrument(skip(self, fields))]
    async fn update(
        &self,
        index: &str,
        id: &str,
        fields: Map<String, Value>,
        guard: Option<DocumentVersion>,
    ) -> Result<WriteResult, StoreError> {
        let mut builder = self.write_request(Method::POST, [index, "_update", id])?;
        if let Some(guard) = guard {
            builder = builder.query(&[
                ("if_seq_no", guard.seq_no),
                ("if_primary_term", guard.primary_term),
            ]);
        }
        let response = builder
            .json(&json!({ "doc": fields }))
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::DocumentMissing(id.to_string())),
            StatusCode::CONFLICT => {
                warn!("Update rejected by version check");
                Err(StoreError::VersionConflict(id.to_string()))
            }
            _ => response.parse::<WriteResponse>().await?.into_result(),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, index: &str, id: &str) -> Result<WriteResult, StoreError> {
        let response = self
            .write_request(Method::DELETE, [index, "_doc", id])?
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::DocumentMissing(id.to_string()));
        }
        response.parse::<WriteResponse>().await?.into_result()
    }

    #[instrument(skip(self, query))]
    async fn search(
        &self,
        index: &str,
        query: &Value,
        size: usize,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let response = self
            .request(Method::POST, [index, "_search"])?
            .query(&[("size", size)])
            .json(query)
            .send()
            .await
            .map_err(transport)?;
        let body: SearchResponse = response.parse().await?;
        debug!(count = body.hits.hits.len(), "Search response received");
        body.hits.hits.into_iter().map(Hit::into_document).collect()
    }

    #[instrument(skip(self, query))]
    async fn open_scroll(
        &self,
        index: &str,
        query: &Value,
        page_size: usize,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let response = self
            .request(Method::POST, [index, "_search"])?
            .query(&[
                ("scroll", keep_alive_param(keep_alive)),
                ("size", page_size.to_string()),
            ])
            .json(query)
            .send()
            .await
            .map_err(transport)?;
        response.parse::<SearchResponse>().await?.into_page()
    }

    #[instrument(skip(self))]
    async fn next_scroll(
        &self,
        scroll_id: &str,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let response = self
            .request(Method::POST, ["_search", "scroll"])?
            .json(&json!({
                "scroll": keep_alive_param(keep_alive),
                "scroll_id": scroll_id,
            }))
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Scroll context no longer exists");
            return Err(StoreError::ScrollExpired);
        }
        response.parse::<SearchResponse>().await?.into_page()
    }

    #[instrument(skip(self))]
    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::DELETE, ["_search", "scroll"])?
            .json(&json!({ "scroll_id": [scroll_id] }))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(response.into_store_error().await)
        }
    }
}

// --- Wire types ---

#[derive(Deserialize)]
struct GetResponse {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<Value>,
    #[serde(rename = "_seq_no")]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<u64>,
}

#[derive(Deserialize)]
struct WriteResponse {
    result: String,
}

impl WriteResponse {
    fn into_result(self) -> Result<WriteResult, StoreError> {
        WriteResult::parse(&self.result)
            .ok_or_else(|| StoreError::Malformed(format!("unknown write result '{}'", self.result)))
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

impl SearchResponse {
    fn into_page(self) -> Result<ScrollPage, StoreError> {
        let hits = self
            .hits
            .hits
            .into_iter()
            .map(Hit::into_document)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ScrollPage {
            scroll_id: self.scroll_id,
            hits,
        })
    }
}

#[derive(Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Option<Value>,
    #[serde(rename = "_seq_no")]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<u64>,
}

impl Hit {
    fn into_document(self) -> Result<StoredDocument, StoreError> {
        let source = self.source.ok_or_else(|| {
            StoreError::Malformed(format!("hit '{}' returned without _source", self.id))
        })?;
        Ok(StoredDocument {
            id: self.id,
            source,
            version: version(self.seq_no, self.primary_term),
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Structured {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Plain(String),
}

// --- Response handling ---

#[async_trait]
trait ResponseExt {
    async fn parse<T: DeserializeOwned>(self) -> Result<T, StoreError>;
    async fn into_store_error(self) -> StoreError;
}

#[async_trait]
impl ResponseExt for reqwest::Response {
    async fn parse<T: DeserializeOwned>(self) -> Result<T, StoreError> {
        if !self.status().is_success() {
            return Err(self.into_store_error().await);
        }
        let body = self.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    async fn into_store_error(self) -> StoreError {
        let status = self.status();
        let body = match self.bytes().await {
            Ok(body) => body,
            Err(e) => return transport(e),
        };
        let reason = match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(ErrorBody {
                error: ErrorDetail::Structured { kind, reason },
            }) => {
                if kind == SCROLL_MISSING {
                    return StoreError::ScrollExpired;
                }
                match reason {
                    Some(reason) => format!("{}: {}", kind, reason),
                    None => kind,
                }
            }
            Ok(ErrorBody {
                error: ErrorDetail::Plain(message),
            }) => message,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        warn!(status = status.as_u16(), %reason, "Backend returned an error");
        StoreError::Backend {
            status: status.as_u16(),
            reason,
        }
    }
}

fn transport(error: reqwest::Error) -> StoreError {
    StoreError::Transport(error.to_string())
}

fn version(seq_no: Option<u64>, primary_term: Option<u64>) -> Option<DocumentVersion> {
    Some(DocumentVersion {
        seq_no: seq_no?,
        primary_term: primary_term?,
    })
}

fn keep_alive_param(keep_alive: Duration) -> String {
    if keep_alive.subsec_millis() == 0 {
        format!("{}s", keep_alive.as_secs())
    } else {
        format!("{}ms", keep_alive.as_millis())
    }
}
