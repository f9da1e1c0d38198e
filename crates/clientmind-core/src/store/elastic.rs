//! Elasticsearch REST backend.
//!
//! Talks to the cluster with `Authorization: ApiKey <key>`. Queries are translated to the
//! ES query DSL; sparse expansion uses `text_expansion` against the ELSER model.

use super::{
    ClusterHealth, DocumentStore, IndexResult, SearchHit, SearchQuery, SearchRequest, StoreError,
    StoreResult, StoredDocument, CHUNK_PIPELINE, DRAFTS_INDEX, EVENTS_INDEX, KNOWLEDGE_INDEX,
    PERSONA_INDEX,
};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, info};

pub struct ElasticStore {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    elser_model_id: String,
}

impl ElasticStore {
    pub fn new(base_url: &str, api_key: Option<String>, elser_model_id: &str) -> StoreResult<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| StoreError::NotConfigured(format!("invalid elastic_url {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::NotConfigured(format!(
                "elastic_url {} cannot be used as a base URL",
                base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            elser_model_id: elser_model_id.to_string(),
        })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("ApiKey {}", key)),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> StoreResult<(StatusCode, Value)> {
        let res = builder.send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok((status, body))
    }

    async fn exists(&self, url: Url) -> StoreResult<bool> {
        let res = self.request(Method::HEAD, url).send().await?;
        Ok(res.status().is_success())
    }
}

pub(crate) fn query_dsl(query: &SearchQuery) -> Value {
    match query {
        SearchQuery::MatchAll => json!({ "match_all": {} }),
        SearchQuery::Term { field, value } => json!({ "term": { field.as_str(): value } }),
        SearchQuery::Terms { field, values } => json!({ "terms": { field.as_str(): values } }),
        SearchQuery::SparseExpansion {
            field,
            model_id,
            text,
        } => json!({
            "text_expansion": {
                field.as_str(): { "model_id": model_id, "model_text": text }
            }
        }),
        SearchQuery::FuzzyMultiMatch { query, fields } => json!({
            "multi_match": { "query": query, "fields": fields, "fuzziness": "AUTO" }
        }),
    }
}

pub(crate) fn search_body(request: &SearchRequest) -> Value {
    let mut body = json!({
        "query": query_dsl(&request.query),
        "size": request.size,
    });
    if let Some(sort) = &request.sort {
        let order = if sort.descending { "desc" } else { "asc" };
        body["sort"] = json!([{ sort.field.as_str(): { "order": order } }]);
    }
    if let Some(fields) = &request.source_fields {
        body["_source"] = json!(fields);
    }
    body
}

fn version_of(body: &Value) -> u64 {
    body.get("_version").and_then(Value::as_u64).unwrap_or(0)
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn get(&self, index: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        let url = self.url(&[index, "_doc", id]);
        let (status, body) = self.send(self.request(Method::GET, url)).await?;
        if status == StatusCode::NOT_FOUND || body.get("found") == Some(&Value::Bool(false)) {
            return Ok(None);
        }
        Ok(Some(StoredDocument {
            id: id.to_string(),
            version: version_of(&body),
            source: body.get("_source").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn index(
        &self,
        index: &str,
        id: Option<&str>,
        document: Value,
        pipeline: Option<&str>,
    ) -> StoreResult<IndexResult> {
        let (method, url) = match id {
            Some(id) => (Method::PUT, self.url(&[index, "_doc", id])),
            None => (Method::POST, self.url(&[index, "_doc"])),
        };
        let mut builder = self
            .request(method, url)
            .query(&[("refresh", "wait_for")])
            .json(&document);
        if let Some(p) = pipeline {
            builder = builder.query(&[("pipeline", p)]);
        }
        let (status, body) = self.send(builder).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Ok(IndexResult {
            id: body
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            version: version_of(&body),
        })
    }

    async fn update(&self, index: &str, id: &str, partial: Value) -> StoreResult<IndexResult> {
        let url = self.url(&[index, "_update", id]);
        let builder = self
            .request(Method::POST, url)
            .query(&[("refresh", "wait_for")])
            .json(&json!({ "doc": partial }));
        let (status, body) = self.send(builder).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                index: index.to_string(),
                id: id.to_string(),
            });
        }
        Ok(IndexResult {
            id: id.to_string(),
            version: version_of(&body),
        })
    }

    async fn search(&self, request: &SearchRequest) -> StoreResult<Vec<SearchHit>> {
        let url = self.url(&[request.index.as_str(), "_search"]);
        let mut builder = self.request(Method::POST, url).json(&search_body(request));
        if request.ignore_unavailable {
            builder = builder.query(&[("ignore_unavailable", "true")]);
        }
        let (status, body) = self.send(builder).await?;
        if status == StatusCode::NOT_FOUND {
            if request.ignore_unavailable {
                return Ok(Vec::new());
            }
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        let hits = body["hits"]["hits"].as_array().cloned().unwrap_or_default();
        debug!("elastic search on {} returned {} hits", request.index, hits.len());
        Ok(hits
            .into_iter()
            .map(|h| SearchHit {
                id: h["_id"].as_str().unwrap_or_default().to_string(),
                score: h["_score"].as_f64().unwrap_or(0.0),
                source: h.get("_source").cloned().unwrap_or(Value::Null),
            })
            .collect())
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        let url = self.url(&[index, "_count"]);
        let (status, body) = self.send(self.request(Method::GET, url)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Ok(body["count"].as_u64().unwrap_or(0))
    }

    async fn health(&self) -> StoreResult<ClusterHealth> {
        let url = self.url(&["_cluster", "health"]);
        let (_, body) = self.send(self.request(Method::GET, url)).await?;
        Ok(ClusterHealth {
            status: body["status"].as_str().unwrap_or("unknown").to_string(),
            cluster_name: body["cluster_name"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let pipeline = json!({
            "description": "Generate ELSER embeddings for knowledge chunks",
            "processors": [
                {
                    "inference": {
                        "model_id": self.elser_model_id,
                        "target_field": "content_embedding",
                        "field_map": { "chunk_text": "text_field" },
                        "inference_config": {
                            "text_expansion": { "results_field": "predicted_value" }
                        }
                    }
                },
                {
                    "script": {
                        "source": "ctx.content_embedding = ctx.content_embedding.predicted_value"
                    }
                }
            ]
        });
        let url = self.url(&["_ingest", "pipeline", CHUNK_PIPELINE]);
        self.send(self.request(Method::PUT, url).json(&pipeline)).await?;
        info!("ingest pipeline {} installed", CHUNK_PIPELINE);

        for (index, mappings) in index_mappings() {
            let url = self.url(&[index]);
            if self.exists(url.clone()).await? {
                info!("index {} already exists", index);
                continue;
            }
            self.send(self.request(Method::PUT, url).json(&json!({ "mappings": mappings })))
                .await?;
            info!("index {} created", index);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "elastic"
    }
}

fn index_mappings() -> [(&'static str, Value); 4] {
    [
        (
            PERSONA_INDEX,
            json!({ "properties": {
                "customer_email": { "type": "keyword" },
                "created_at": { "type": "date" },
                "updated_at": { "type": "date" }
            }}),
        ),
        (
            KNOWLEDGE_INDEX,
            json!({ "properties": {
                "chunk_id": { "type": "keyword" },
                "source": { "type": "keyword" },
                "chunk_text": { "type": "text" },
                "content": { "type": "text" },
                "content_embedding": { "type": "rank_features" },
                "metadata": { "properties": {
                    "doc_type": { "type": "keyword" },
                    "uploaded_at": { "type": "date" },
                    "uploaded_by": { "type": "keyword" },
                    "file_size": { "type": "long" }
                }}
            }}),
        ),
        (
            DRAFTS_INDEX,
            json!({ "properties": {
                "draft_id": { "type": "keyword" },
                "email_id": { "type": "keyword" },
                "customer_email": { "type": "keyword" },
                "status": { "type": "keyword" },
                "created_at": { "type": "date" },
                "approved_at": { "type": "date" }
            }}),
        ),
        (
            EVENTS_INDEX,
            json!({ "properties": {
                "correlation_id": { "type": "keyword" },
                "draft_id": { "type": "keyword" },
                "customer_email": { "type": "keyword" },
                "status": { "type": "keyword" },
                "approved_at": { "type": "date" }
            }}),
        ),
    ]
}
