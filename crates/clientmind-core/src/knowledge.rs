//! Knowledge base: passage retrieval and PDF ingestion.
//!
//! Retrieval runs a sparse-expansion (ELSER) query against `content_embedding` and, only
//! when that returns nothing, a fuzzy lexical match over the chunk text. Fallback hits are
//! appended after the primary ones without re-scoring.

use crate::error::{PipelineError, PipelineResult};
use crate::store::{DocumentStore, SearchHit, SearchQuery, SearchRequest, CHUNK_PIPELINE, KNOWLEDGE_INDEX};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
const EMBEDDING_FIELD: &str = "content_embedding";
const LEXICAL_FIELDS: [&str; 2] = ["chunk_text", "content"];
const HIT_FIELDS: [&str; 6] = ["chunk_id", "source", "chunk_text", "metadata", "content", "text"];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported file type {0}: only PDF files are supported")]
    UnsupportedType(String),

    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("content extraction failed: {0}")]
    Extraction(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub chunk_id: String,
    pub source: String,
    pub chunk_text: String,
    pub score: f64,
    pub metadata: Value,
}

impl From<SearchHit> for KnowledgeHit {
    fn from(hit: SearchHit) -> Self {
        let s = &hit.source;
        let text = |f: &str| crate::store::str_field(s, f).map(str::to_string);
        KnowledgeHit {
            chunk_id: text("chunk_id").unwrap_or_else(|| hit.id.clone()),
            source: text("source").unwrap_or_default(),
            chunk_text: text("chunk_text")
                .or_else(|| text("content"))
                .or_else(|| text("text"))
                .unwrap_or_default(),
            score: hit.score,
            metadata: s.get("metadata").cloned().unwrap_or_else(|| json!({})),
        }
    }
}

pub struct KnowledgeRetriever {
    store: Arc<dyn DocumentStore>,
    model_id: String,
    debug_logs: bool,
}

impl KnowledgeRetriever {
    pub fn new(store: Arc<dyn DocumentStore>, model_id: &str, debug_logs: bool) -> Self {
        Self {
            store,
            model_id: model_id.to_string(),
            debug_logs,
        }
    }

    pub async fn search(&self, query_text: &str, top_k: usize) -> PipelineResult<Vec<KnowledgeHit>> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(PipelineError::validation("query_text is required"));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let primary = SearchRequest::new(
            KNOWLEDGE_INDEX,
            SearchQuery::SparseExpansion {
                field: EMBEDDING_FIELD.to_string(),
                model_id: self.model_id.clone(),
                text: query_text.to_string(),
            },
        )
        .size(top_k)
        .source_fields(&HIT_FIELDS)
        .ignore_unavailable();
        let primary_hits = self.store.search(&primary).await?;
        if self.debug_logs {
            if let Some(first) = primary_hits.first() {
                debug!("first knowledge hit: {}", first.source);
            }
        }

        let mut hits: Vec<KnowledgeHit> = primary_hits.into_iter().map(KnowledgeHit::from).collect();
        if hits.is_empty() {
            debug!("sparse expansion returned 0 hits, falling back to lexical match");
            let fallback = SearchRequest::new(
                KNOWLEDGE_INDEX,
                SearchQuery::FuzzyMultiMatch {
                    query: query_text.to_string(),
                    fields: LEXICAL_FIELDS.iter().map(|f| f.to_string()).collect(),
                },
            )
            .size(top_k)
            .source_fields(&HIT_FIELDS)
            .ignore_unavailable();
            hits.extend(self.store.search(&fallback).await?.into_iter().map(KnowledgeHit::from));
        }
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// Word-index ranges of overlapping windows over `word_count` words.
/// Windows advance by `max(1, window - overlap)`; the last one reaches the end.
pub fn chunk_spans(word_count: usize, window: usize, overlap: usize) -> Vec<Range<usize>> {
    let window = window.max(1);
    let step = window.saturating_sub(overlap).max(1);
    let mut spans = Vec::new();
    let mut start = 0;
    while start < word_count {
        spans.push(start..(start + window).min(word_count));
        if start + window >= word_count {
            break;
        }
        start += step;
    }
    spans
}

/// Split on whitespace and rejoin each window with single spaces.
pub fn chunk_words(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    chunk_spans(words.len(), window, overlap)
        .into_iter()
        .map(|span| words[span].join(" "))
        .collect()
}

#[derive(Debug, Clone)]
pub struct PdfUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub uploaded_by: String,
    pub doc_type: Option<String>,
    pub doc_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub status: String,
    pub chunks_count: usize,
}

pub struct KnowledgeIngestor {
    store: Arc<dyn DocumentStore>,
    window: usize,
    overlap: usize,
    max_bytes: usize,
}

impl KnowledgeIngestor {
    pub fn new(store: Arc<dyn DocumentStore>, window: usize, overlap: usize, max_bytes: usize) -> Self {
        Self {
            store,
            window,
            overlap,
            max_bytes,
        }
    }

    fn validate(&self, upload: &PdfUpload) -> Result<(), IngestError> {
        if upload.content_type != PDF_CONTENT_TYPE {
            return Err(IngestError::UnsupportedType(upload.content_type.clone()));
        }
        if upload.bytes.len() > self.max_bytes {
            return Err(IngestError::TooLarge {
                size: upload.bytes.len(),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    pub async fn ingest_pdf(&self, upload: PdfUpload) -> PipelineResult<IngestReport> {
        self.validate(&upload)?;
        let bytes = upload.bytes.clone();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| IngestError::Extraction(e.to_string()))?
            .map_err(|e| IngestError::Extraction(e.to_string()))?;
        self.ingest_text(&upload, &text).await
    }

    /// Chunk already-extracted text and index every chunk through the chunk pipeline.
    pub async fn ingest_text(&self, upload: &PdfUpload, text: &str) -> PipelineResult<IngestReport> {
        if text.trim().is_empty() {
            return Err(IngestError::Extraction("no text found in document".to_string()).into());
        }
        let upload_id = uuid::Uuid::new_v4().to_string();
        let uploaded_at = chrono::Utc::now().to_rfc3339();
        let chunks = chunk_words(text, self.window, self.overlap);

        for (i, chunk) in chunks.iter().enumerate() {
            let chunk_id = format!("{}-{}", upload_id, i);
            let doc = json!({
                "chunk_id": chunk_id,
                "source": upload.file_name,
                "chunk_text": chunk,
                "metadata": {
                    "doc_type": upload.doc_type.as_deref().unwrap_or("pdf"),
                    "uploaded_at": uploaded_at,
                    "uploaded_by": upload.uploaded_by,
                    "doc_version": upload.doc_version.as_deref().unwrap_or(""),
                    "file_size": upload.bytes.len(),
                }
            });
            self.store
                .index(KNOWLEDGE_INDEX, Some(&chunk_id), doc, Some(CHUNK_PIPELINE))
                .await?;
        }
        info!(
            "indexed {} as {} ({} chunks)",
            upload.file_name,
            upload_id,
            chunks.len()
        );
        Ok(IngestReport {
            document_id: upload_id,
            status: "indexed".to_string(),
            chunks_count: chunks.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;

    fn upload(content_type: &str, size: usize) -> PdfUpload {
        PdfUpload {
            file_name: "returns.pdf".into(),
            content_type: content_type.into(),
            bytes: vec![0u8; size],
            uploaded_by: "ops@shop.test".into(),
            doc_type: None,
            doc_version: None,
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_words("a b  c\n d", 800, 200), vec!["a b c d"]);
        assert!(chunk_words("   ", 800, 200).is_empty());
    }

    #[test]
    fn overlap_not_smaller_than_window_still_advances() {
        assert_eq!(chunk_spans(3, 2, 5), vec![0..2, 1..3]);
    }

    #[test]
    fn hit_text_falls_back_to_content() {
        let hit = SearchHit {
            id: "doc-1".into(),
            score: 1.5,
            source: json!({"content": "raw body", "source": "faq.pdf"}),
        };
        let k = KnowledgeHit::from(hit);
        assert_eq!(k.chunk_id, "doc-1");
        assert_eq!(k.chunk_text, "raw body");
        assert_eq!(k.metadata, json!({}));
    }

    #[tokio::test]
    async fn rejects_non_pdf_and_oversized() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        let ingestor = KnowledgeIngestor::new(store, 800, 200, 10);
        let err = ingestor.ingest_pdf(upload("text/plain", 1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Ingest(IngestError::UnsupportedType(_))));
        let err = ingestor.ingest_pdf(upload(PDF_CONTENT_TYPE, 11)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Ingest(IngestError::TooLarge { size: 11, limit: 10 })));
    }

    #[tokio::test]
    async fn ingested_text_is_searchable() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        let ingestor = KnowledgeIngestor::new(store.clone(), 800, 200, 1024);
        let report = ingestor
            .ingest_text(&upload(PDF_CONTENT_TYPE, 4), "Exchanges are free for store credit")
            .await
            .unwrap();
        assert_eq!(report.chunks_count, 1);
        assert_eq!(report.status, "indexed");

        let retriever = KnowledgeRetriever::new(store, "m", false);
        let hits = retriever.search("store credit", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, format!("{}-0", report.document_id));
        assert_eq!(hits[0].metadata["doc_type"], "pdf");
        assert_eq!(hits[0].metadata["file_size"], 4);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        let retriever = KnowledgeRetriever::new(store, "m", false);
        let err = retriever.search("  ", 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
