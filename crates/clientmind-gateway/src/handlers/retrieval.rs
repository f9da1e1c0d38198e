//! `/rag/dual` and `/knowledge/*`.

use super::{degrade_read, fail};
use crate::api::{ok, ApiError, ApiResult};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use clientmind_core::knowledge::IngestReport;
use clientmind_core::{DualContext, KnowledgeHit, PdfUpload, Services};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct DualBody {
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub query_text: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

pub async fn rag_dual(
    State(services): State<Services>,
    payload: Result<Json<DualBody>, JsonRejection>,
) -> ApiResult<DualContext> {
    let Json(body) = payload?;
    let top_k = body.top_k.unwrap_or(services.config.default_top_k);
    let ctx = services
        .assembler
        .assemble(body.customer_email.as_deref(), &body.query_text, top_k)
        .await
        .map_err(fail(&services, "dual retrieval"))?;
    ok(ctx)
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    #[serde(default)]
    pub query_text: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<KnowledgeHit>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub async fn knowledge_search(
    State(services): State<Services>,
    payload: Result<Json<SearchBody>, JsonRejection>,
) -> ApiResult<SearchResponse> {
    let Json(body) = payload?;
    let top_k = body.top_k.unwrap_or(services.config.default_top_k);
    let result = services.retriever.search(&body.query_text, top_k).await;
    let (hits, warnings) = degrade_read(&services, "knowledge search", "Knowledge search", result)?;
    ok(SearchResponse { hits, warnings })
}

/// Optional `metadata` form field.
#[derive(Debug, Default, Deserialize)]
struct UploadMetadata {
    #[serde(default)]
    doc_type: Option<String>,
    #[serde(default)]
    doc_version: Option<String>,
}

/// Multipart fields: `file` (required, PDF), `metadata` (JSON), `uploaded_by`.
pub async fn knowledge_upload(
    State(services): State<Services>,
    mut multipart: Multipart,
) -> ApiResult<IngestReport> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut metadata = UploadMetadata::default();
    let mut uploaded_by = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload.pdf").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await?;
                file = Some((file_name, content_type, bytes.to_vec()));
            }
            "metadata" => {
                let raw = field.text().await?;
                if !raw.trim().is_empty() {
                    metadata = serde_json::from_str(&raw)
                        .map_err(|e| ApiError::bad_request(format!("invalid metadata: {}", e)))?;
                }
            }
            "uploaded_by" => {
                let raw = field.text().await?;
                uploaded_by = Some(raw.trim().to_string()).filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    let (file_name, content_type, bytes) =
        file.ok_or_else(|| ApiError::bad_request("file is required"))?;
    info!("upload {} ({} bytes, {})", file_name, bytes.len(), content_type);
    let report = services
        .ingestor
        .ingest_pdf(PdfUpload {
            file_name,
            content_type,
            bytes,
            uploaded_by: uploaded_by.unwrap_or_else(|| "anonymous".to_string()),
            doc_type: metadata.doc_type,
            doc_version: metadata.doc_version,
        })
        .await
        .map_err(fail(&services, "upload"))?;
    ok(report)
}
