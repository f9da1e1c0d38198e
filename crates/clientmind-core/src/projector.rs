//! Review feed: recent drafts joined with their latest decision event.

use crate::error::PipelineResult;
use crate::store::{str_field, DocumentStore, SearchQuery, SearchRequest, DRAFTS_INDEX, EVENTS_INDEX};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Events fetched per listed draft, so repeated decisions on one draft do not crowd
/// out the latest event of another.
const EVENTS_PER_DRAFT: usize = 4;

/// Elasticsearch's default `index.max_result_window`; larger pages are refused.
const MAX_RESULT_WINDOW: usize = 10_000;

const DRAFT_FIELDS: [&str; 9] = [
    "draft_id",
    "email_id",
    "customer_email",
    "subject",
    "original_body",
    "draft_content",
    "status",
    "created_at",
    "reasoning",
];
const EVENT_FIELDS: [&str; 4] = ["draft_id", "approved_by", "approved_at", "status"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRow {
    pub correlation_id: String,
    pub draft_id: String,
    pub email_id: Option<String>,
    pub customer_email: Option<String>,
    pub subject: Option<String>,
    pub original_body: Option<String>,
    pub draft_content: Option<String>,
    pub status: String,
    pub created_at: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<String>,
    pub reasoning: String,
}

pub struct EventProjector {
    store: Arc<dyn DocumentStore>,
    default_limit: usize,
}

impl EventProjector {
    pub fn new(store: Arc<dyn DocumentStore>, default_limit: usize) -> Self {
        Self {
            store,
            default_limit,
        }
    }

    pub async fn list(&self, limit: Option<usize>) -> PipelineResult<Vec<EventRow>> {
        let limit = limit.unwrap_or(self.default_limit).min(MAX_RESULT_WINDOW);
        let drafts = self
            .store
            .search(
                &SearchRequest::new(DRAFTS_INDEX, SearchQuery::MatchAll)
                    .size(limit)
                    .sort_desc("created_at")
                    .source_fields(&DRAFT_FIELDS)
                    .ignore_unavailable(),
            )
            .await?;

        let drafts: Vec<(String, Value)> = drafts
            .into_iter()
            .map(|hit| {
                let id = str_field(&hit.source, "draft_id")
                    .map(str::to_string)
                    .unwrap_or(hit.id);
                (id, hit.source)
            })
            .collect();

        // Sorted newest first, so the first event seen per draft is its latest.
        let mut latest: HashMap<String, Value> = HashMap::new();
        if !drafts.is_empty() {
            let ids: Vec<&str> = drafts.iter().map(|(id, _)| id.as_str()).collect();
            let events = self
                .store
                .search(
                    &SearchRequest::new(EVENTS_INDEX, SearchQuery::terms("draft_id", ids))
                        .size(events_window(drafts.len()))
                        .sort_desc("approved_at")
                        .source_fields(&EVENT_FIELDS)
                        .ignore_unavailable(),
                )
                .await?;
            for event in events {
                if let Some(draft_id) = str_field(&event.source, "draft_id") {
                    latest.entry(draft_id.to_string()).or_insert(event.source);
                }
            }
        }
        debug!("projecting {} drafts with {} events", drafts.len(), latest.len());

        Ok(drafts
            .into_iter()
            .map(|(draft_id, draft)| {
                let event = latest.get(&draft_id);
                let text = |f: &str| str_field(&draft, f).map(str::to_string);
                let from_event = |f: &str| event.and_then(|e| str_field(e, f)).map(str::to_string);
                EventRow {
                    correlation_id: uuid::Uuid::new_v4().to_string(),
                    status: from_event("status")
                        .or_else(|| text("status"))
                        .unwrap_or_else(|| "pending".to_string()),
                    email_id: text("email_id"),
                    customer_email: text("customer_email"),
                    subject: text("subject"),
                    original_body: text("original_body"),
                    draft_content: text("draft_content"),
                    created_at: text("created_at"),
                    approved_by: from_event("approved_by"),
                    approved_at: from_event("approved_at"),
                    reasoning: text("reasoning").unwrap_or_default(),
                    draft_id,
                }
            })
            .collect())
    }
}

fn events_window(drafts: usize) -> usize {
    drafts.saturating_mul(EVENTS_PER_DRAFT).min(MAX_RESULT_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClusterHealth, IndexResult, LocalStore, SearchHit, StoreResult, StoredDocument};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the page size of every search before delegating.
    struct SizeRecorder {
        inner: LocalStore,
        sizes: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl DocumentStore for SizeRecorder {
        async fn get(&self, index: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
            self.inner.get(index, id).await
        }

        async fn index(
            &self,
            index: &str,
            id: Option<&str>,
            document: Value,
            pipeline: Option<&str>,
        ) -> StoreResult<IndexResult> {
            self.inner.index(index, id, document, pipeline).await
        }

        async fn update(&self, index: &str, id: &str, partial: Value) -> StoreResult<IndexResult> {
            self.inner.update(index, id, partial).await
        }

        async fn search(&self, request: &SearchRequest) -> StoreResult<Vec<SearchHit>> {
            self.sizes
                .lock()
                .unwrap()
                .push((request.index.clone(), request.size));
            self.inner.search(request).await
        }

        async fn count(&self, index: &str) -> StoreResult<u64> {
            self.inner.count(index).await
        }

        async fn health(&self) -> StoreResult<ClusterHealth> {
            self.inner.health().await
        }

        fn backend(&self) -> &'static str {
            "recorder"
        }
    }

    #[test]
    fn event_window_stays_under_result_limit() {
        assert_eq!(events_window(3), 12);
        assert_eq!(events_window(2500), MAX_RESULT_WINDOW);
        assert_eq!(events_window(2501), MAX_RESULT_WINDOW);
    }

    #[tokio::test]
    async fn oversized_limit_is_clamped() {
        let store = Arc::new(SizeRecorder {
            inner: LocalStore::temporary().unwrap(),
            sizes: Mutex::new(Vec::new()),
        });
        store
            .index(DRAFTS_INDEX, Some("d"), json!({"draft_id": "d", "created_at": "2025-01-01T00:00:00Z"}), None)
            .await
            .unwrap();

        let rows = EventProjector::new(store.clone(), 50)
            .list(Some(50_000))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let sizes = store.sizes.lock().unwrap().clone();
        assert_eq!(
            sizes,
            vec![
                (DRAFTS_INDEX.to_string(), MAX_RESULT_WINDOW),
                (EVENTS_INDEX.to_string(), EVENTS_PER_DRAFT)
            ]
        );
    }

    #[tokio::test]
    async fn drafts_without_events_keep_their_status() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        store
            .index(DRAFTS_INDEX, Some("old"), json!({"draft_id": "old", "created_at": "2025-01-01T00:00:00Z"}), None)
            .await
            .unwrap();
        store
            .index(
                DRAFTS_INDEX,
                Some("new"),
                json!({"draft_id": "new", "status": "rejected", "created_at": "2025-02-01T00:00:00Z"}),
                None,
            )
            .await
            .unwrap();

        let rows = EventProjector::new(store, 50).list(None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].draft_id, "new");
        assert_eq!(rows[0].status, "rejected");
        assert_eq!(rows[1].status, "pending");
        assert_eq!(rows[1].approved_by, None);
    }

    #[tokio::test]
    async fn limit_caps_rows() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        for i in 0..3 {
            store
                .index(
                    DRAFTS_INDEX,
                    Some(&format!("d{}", i)),
                    json!({"created_at": format!("2025-01-0{}T00:00:00Z", i + 1)}),
                    None,
                )
                .await
                .unwrap();
        }
        let rows = EventProjector::new(store, 50).list(Some(2)).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.draft_id.as_str()).collect::<Vec<_>>(),
            vec!["d2", "d1"]
        );
    }
}
