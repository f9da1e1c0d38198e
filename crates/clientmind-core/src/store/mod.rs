//! Document store seam.
//!
//! The pipeline only talks to [`DocumentStore`]: document CRUD plus a small typed query
//! union. Two backends implement it: [`ElasticStore`] (REST client for an Elasticsearch
//! cluster with ELSER) and [`LocalStore`] (embedded sled database for development and tests).

mod elastic;
mod local;

pub use elastic::ElasticStore;
pub use local::LocalStore;

use crate::config::{ClientMindConfig, StoreBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub const PERSONA_INDEX: &str = "clientmind_persona";
pub const KNOWLEDGE_INDEX: &str = "clientmind_knowledge";
pub const DRAFTS_INDEX: &str = "clientmind_drafts";
pub const EVENTS_INDEX: &str = "clientmind_events";

/// Ingest pipeline that computes `content_embedding` for knowledge chunks.
pub const CHUNK_PIPELINE: &str = "clientmind_chunk_processor";

pub const ALL_INDICES: [&str; 4] = [PERSONA_INDEX, KNOWLEDGE_INDEX, DRAFTS_INDEX, EVENTS_INDEX];

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document store not configured: {0}")]
    NotConfigured(String),

    #[error("document store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("document store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("document {id} not found in {index}")]
    NotFound { index: String, id: String },

    #[error("document serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("local store error: {0}")]
    Sled(#[from] sled::Error),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Query union understood by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    MatchAll,
    /// Exact match on a keyword field.
    Term { field: String, value: Value },
    /// Exact match against any of `values`.
    Terms { field: String, values: Vec<Value> },
    /// Learned sparse expansion of `text` scored against the token weights stored in `field`.
    SparseExpansion {
        field: String,
        model_id: String,
        text: String,
    },
    /// Lexical match across `fields` with automatic edit-distance tolerance.
    FuzzyMultiMatch { query: String, fields: Vec<String> },
}

impl SearchQuery {
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        SearchQuery::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn terms<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        SearchQuery::Terms {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub index: String,
    pub query: SearchQuery,
    pub size: usize,
    pub sort: Option<Sort>,
    /// Restrict `_source` to these fields. `None` returns the whole document.
    pub source_fields: Option<Vec<String>>,
    /// A missing index yields no hits instead of an error.
    pub ignore_unavailable: bool,
}

impl SearchRequest {
    pub fn new(index: &str, query: SearchQuery) -> Self {
        Self {
            index: index.to_string(),
            query,
            size: 10,
            sort: None,
            source_fields: None,
            ignore_unavailable: false,
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn sort_desc(mut self, field: &str) -> Self {
        self.sort = Some(Sort {
            field: field.to_string(),
            descending: true,
        });
        self
    }

    pub fn source_fields(mut self, fields: &[&str]) -> Self {
        self.source_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn ignore_unavailable(mut self) -> Self {
        self.ignore_unavailable = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub version: u64,
    pub source: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResult {
    pub id: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: String,
    pub cluster_name: String,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, index: &str, id: &str) -> StoreResult<Option<StoredDocument>>;

    /// Create or replace a document. `id = None` lets the store assign one.
    /// `pipeline` names an ingest pipeline applied before the document is stored.
    async fn index(
        &self,
        index: &str,
        id: Option<&str>,
        document: Value,
        pipeline: Option<&str>,
    ) -> StoreResult<IndexResult>;

    /// Shallow partial update. Fails with [`StoreError::NotFound`] when the document is missing.
    async fn update(&self, index: &str, id: &str, partial: Value) -> StoreResult<IndexResult>;

    async fn search(&self, request: &SearchRequest) -> StoreResult<Vec<SearchHit>>;

    async fn count(&self, index: &str) -> StoreResult<u64>;

    async fn health(&self) -> StoreResult<ClusterHealth>;

    /// Create indices and ingest pipelines that do not exist yet.
    async fn ensure_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

/// Build the configured backend.
pub fn open_store(cfg: &ClientMindConfig) -> StoreResult<Arc<dyn DocumentStore>> {
    match cfg.store_backend {
        StoreBackend::Elastic => {
            let url = cfg.elastic_url.as_deref().ok_or_else(|| {
                StoreError::NotConfigured("elastic_url (ELASTIC_CLOUD_URL) is not set".to_string())
            })?;
            let store = ElasticStore::new(url, cfg.elastic_api_key.clone(), &cfg.elser_model_id)?;
            Ok(Arc::new(store))
        }
        StoreBackend::Local => Ok(Arc::new(LocalStore::open(&cfg.storage_path)?)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub backend: String,
    pub health: ClusterHealth,
    pub indices: BTreeMap<String, u64>,
}

/// Cluster health plus per-index document counts. A failing count reports 0.
pub async fn store_status(store: &dyn DocumentStore) -> StoreResult<StoreStatus> {
    let health = store.health().await?;
    let mut indices = BTreeMap::new();
    for index in ALL_INDICES {
        let count = match store.count(index).await {
            Ok(n) => n,
            Err(e) => {
                warn!("count failed for {}: {}", index, e);
                0
            }
        };
        indices.insert(index.to_string(), count);
    }
    Ok(StoreStatus {
        backend: store.backend().to_string(),
        health,
        indices,
    })
}

/// Read a string field, treating empty strings as absent.
pub(crate) fn str_field<'a>(source: &'a Value, field: &str) -> Option<&'a str> {
    source
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
