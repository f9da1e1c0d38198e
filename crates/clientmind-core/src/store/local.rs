//! Embedded document store on sled: one tree per index.
//!
//! Values are stored as `{"_version": n, "_source": {...}}`. Queries are evaluated by a
//! full scan of the index tree, which is fine for the document volumes a single operator
//! or a test works with. The chunk ingest pipeline is emulated by writing a token
//! frequency map into `content_embedding`, so sparse-expansion queries score real overlap.

use super::{
    ClusterHealth, DocumentStore, IndexResult, SearchHit, SearchQuery, SearchRequest, StoreError,
    StoreResult, StoredDocument, CHUNK_PIPELINE,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

const EMBEDDING_FIELD: &str = "content_embedding";

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_source")]
    source: Value,
}

pub struct LocalStore {
    db: sled::Db,
    /// Serializes read-modify-write cycles (version bump, partial update).
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn tree(&self, index: &str) -> StoreResult<sled::Tree> {
        Ok(self.db.open_tree(index)?)
    }

    fn read(tree: &sled::Tree, id: &str) -> StoreResult<Option<Envelope>> {
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(tree: &sled::Tree, id: &str, envelope: &Envelope) -> StoreResult<()> {
        tree.insert(id.as_bytes(), serde_json::to_vec(envelope)?)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    async fn get(&self, index: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        let tree = self.tree(index)?;
        Ok(Self::read(&tree, id)?.map(|env| StoredDocument {
            id: id.to_string(),
            version: env.version,
            source: env.source,
        }))
    }

    async fn index(
        &self,
        index: &str,
        id: Option<&str>,
        document: Value,
        pipeline: Option<&str>,
    ) -> StoreResult<IndexResult> {
        let mut source = document;
        match pipeline {
            None => {}
            Some(CHUNK_PIPELINE) => apply_chunk_pipeline(&mut source),
            Some(other) => {
                return Err(StoreError::InvalidQuery(format!(
                    "unknown ingest pipeline {}",
                    other
                )))
            }
        }

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let tree = self.tree(index)?;
        let _guard = self.write_lock.lock().await;
        let version = Self::read(&tree, &id)?.map(|e| e.version + 1).unwrap_or(1);
        Self::write(&tree, &id, &Envelope { version, source })?;
        Ok(IndexResult { id, version })
    }

    async fn update(&self, index: &str, id: &str, partial: Value) -> StoreResult<IndexResult> {
        let tree = self.tree(index)?;
        let _guard = self.write_lock.lock().await;
        let mut env = Self::read(&tree, id)?.ok_or_else(|| StoreError::NotFound {
            index: index.to_string(),
            id: id.to_string(),
        })?;
        match (env.source.as_object_mut(), partial) {
            (Some(existing), Value::Object(fields)) => {
                for (k, v) in fields {
                    existing.insert(k, v);
                }
            }
            _ => {
                return Err(StoreError::InvalidQuery(
                    "partial update must be a JSON object".to_string(),
                ))
            }
        }
        env.version += 1;
        Self::write(&tree, id, &env)?;
        Ok(IndexResult {
            id: id.to_string(),
            version: env.version,
        })
    }

    async fn search(&self, request: &SearchRequest) -> StoreResult<Vec<SearchHit>> {
        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == request.index.as_bytes());
        if !exists && request.ignore_unavailable {
            return Ok(Vec::new());
        }
        let tree = self.tree(&request.index)?;

        let mut hits = Vec::new();
        for entry in tree.iter() {
            let (key, bytes) = entry?;
            let env: Envelope = serde_json::from_slice(&bytes)?;
            if let Some(score) = score(&request.query, &env.source) {
                hits.push(SearchHit {
                    id: String::from_utf8_lossy(&key).into_owned(),
                    score,
                    source: env.source,
                });
            }
        }

        match &request.sort {
            Some(sort) => hits.sort_by(|a, b| {
                let ord = compare_values(
                    field_value(&a.source, &sort.field),
                    field_value(&b.source, &sort.field),
                );
                if sort.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }),
            None => hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)),
        }
        hits.truncate(request.size);

        if let Some(fields) = &request.source_fields {
            for hit in &mut hits {
                if let Value::Object(map) = &mut hit.source {
                    map.retain(|k, _| fields.iter().any(|f| f == k));
                }
            }
        }
        debug!("local search on {} returned {} hits", request.index, hits.len());
        Ok(hits)
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        Ok(self.tree(index)?.len() as u64)
    }

    async fn health(&self) -> StoreResult<ClusterHealth> {
        Ok(ClusterHealth {
            status: "green".to_string(),
            cluster_name: "local".to_string(),
        })
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

/// Lower-cased alphanumeric tokens.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn apply_chunk_pipeline(source: &mut Value) {
    let text = source
        .get("chunk_text")
        .or_else(|| source.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut weights: HashMap<String, f64> = HashMap::new();
    for token in tokenize(&text) {
        *weights.entry(token).or_insert(0.0) += 1.0;
    }
    let embedding: Map<String, Value> = weights
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect();
    if let Value::Object(map) = source {
        map.insert(EMBEDDING_FIELD.to_string(), Value::Object(embedding));
    }
}

/// Look up a dotted path; a trailing `.keyword` sub-field resolves to the field itself.
fn field_value<'a>(source: &'a Value, field: &str) -> Option<&'a Value> {
    let field = field.strip_suffix(".keyword").unwrap_or(field);
    field
        .split('.')
        .try_fold(source, |v, part| v.get(part))
        .filter(|v| !v.is_null())
}

fn value_matches(doc: Option<&Value>, wanted: &Value) -> bool {
    match doc {
        Some(Value::Array(items)) => items.iter().any(|v| v == wanted),
        Some(v) => v == wanted,
        None => false,
    }
}

/// `None` means the document does not match.
fn score(query: &SearchQuery, source: &Value) -> Option<f64> {
    match query {
        SearchQuery::MatchAll => Some(1.0),
        SearchQuery::Term { field, value } => {
            value_matches(field_value(source, field), value).then_some(1.0)
        }
        SearchQuery::Terms { field, values } => {
            let doc = field_value(source, field);
            values.iter().any(|v| value_matches(doc, v)).then_some(1.0)
        }
        SearchQuery::SparseExpansion { field, text, .. } => {
            let weights = field_value(source, field)?.as_object()?;
            let mut query_tokens = tokenize(text);
            query_tokens.sort();
            query_tokens.dedup();
            let total: f64 = query_tokens
                .iter()
                .filter_map(|t| weights.get(t).and_then(Value::as_f64))
                .sum();
            (total > 0.0).then_some(total)
        }
        SearchQuery::FuzzyMultiMatch { query, fields } => {
            let query_tokens = tokenize(query);
            let best = fields
                .iter()
                .filter_map(|f| field_value(source, f).and_then(Value::as_str))
                .map(|text| fuzzy_score(&query_tokens, &tokenize(text)))
                .fold(0.0_f64, f64::max);
            (best > 0.0).then_some(best)
        }
    }
}

/// Edit distance allowed by `fuzziness: AUTO` for a term of this length.
fn auto_fuzziness(term: &str) -> usize {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

fn fuzzy_score(query_tokens: &[String], doc_tokens: &[String]) -> f64 {
    query_tokens
        .iter()
        .filter_map(|q| {
            let allowed = auto_fuzziness(q);
            doc_tokens
                .iter()
                .map(|d| strsim::levenshtein(q, d))
                .filter(|dist| *dist <= allowed)
                .min()
                .map(|dist| 1.0 / (1.0 + dist as f64))
        })
        .sum()
}

/// Dates compare chronologically, numbers numerically, everything else as strings.
/// A missing value compares lowest.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
                let dates = (
                    chrono::DateTime::parse_from_rfc3339(x),
                    chrono::DateTime::parse_from_rfc3339(y),
                );
                if let (Ok(dx), Ok(dy)) = dates {
                    return dx.cmp(&dy);
                }
                return x.cmp(y);
            }
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            a.to_string().cmp(&b.to_string())
        }
    }
}
