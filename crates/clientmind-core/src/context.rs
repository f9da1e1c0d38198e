//! Dual retrieval: persona memory and knowledge passages gathered concurrently.

use crate::error::{PipelineError, PipelineResult};
use crate::knowledge::{KnowledgeHit, KnowledgeRetriever};
use crate::persona::{InteractionEntry, PersonaConfig, PersonaStore, PersonaTag};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub const MISSING_EMAIL_WARNING: &str = "Missing customer_email. Memory context skipped.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    #[serde(default)]
    pub tags: Vec<PersonaTag>,
    #[serde(default)]
    pub interaction_history: Vec<InteractionEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeContext {
    #[serde(default)]
    pub hits: Vec<KnowledgeHit>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DualContext {
    pub memory: MemoryContext,
    pub knowledge: KnowledgeContext,
    /// Persona preferences read alongside the memory; not part of the API payload.
    #[serde(skip)]
    pub persona_config: PersonaConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Caller-facing text for a read that degraded to an empty result.
pub fn degraded_warning(what: &str, err: &dyn fmt::Display, expose_detail: bool) -> String {
    if expose_detail {
        format!("{} failed: {}", what, err)
    } else {
        format!("{} failed.", what)
    }
}

pub struct ContextAssembler {
    personas: Arc<PersonaStore>,
    retriever: Arc<KnowledgeRetriever>,
    expose_detail: bool,
}

impl ContextAssembler {
    pub fn new(personas: Arc<PersonaStore>, retriever: Arc<KnowledgeRetriever>) -> Self {
        Self {
            personas,
            retriever,
            expose_detail: false,
        }
    }

    /// Include upstream error text in warnings.
    pub fn with_error_detail(mut self, expose_detail: bool) -> Self {
        self.expose_detail = expose_detail;
        self
    }

    /// Only a missing `query_text` fails. Every retrieval problem degrades to an empty
    /// part plus a warning.
    pub async fn assemble(
        &self,
        customer_email: Option<&str>,
        query_text: &str,
        top_k: usize,
    ) -> PipelineResult<DualContext> {
        if query_text.trim().is_empty() {
            return Err(PipelineError::validation("query_text is required"));
        }
        let email = customer_email.map(str::trim).filter(|e| !e.is_empty());

        let persona_read = async {
            match email {
                Some(e) => Some(self.personas.get(e).await),
                None => None,
            }
        };
        let (persona, hits) = tokio::join!(persona_read, self.retriever.search(query_text, top_k));

        let mut ctx = DualContext::default();
        match persona {
            None => {
                warn!("assemble without customer_email, memory skipped");
                ctx.warnings.push(MISSING_EMAIL_WARNING.to_string());
            }
            Some(Ok(snapshot)) => {
                ctx.memory = MemoryContext {
                    tags: snapshot.tags,
                    interaction_history: snapshot.interaction_history,
                };
                ctx.persona_config = snapshot.persona_config;
            }
            Some(Err(e)) => {
                warn!("persona read failed: {}", e);
                ctx.warnings
                    .push(degraded_warning("Persona lookup", &e, self.expose_detail));
            }
        }
        match hits {
            Ok(hits) => ctx.knowledge.hits = hits,
            Err(e) => {
                warn!("knowledge search failed: {}", e);
                ctx.warnings
                    .push(degraded_warning("Knowledge search", &e, self.expose_detail));
            }
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ClusterHealth, DocumentStore, IndexResult, LocalStore, SearchHit, SearchRequest,
        StoreError, StoreResult, StoredDocument, CHUNK_PIPELINE, KNOWLEDGE_INDEX,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Every call fails as an unreachable cluster would.
    struct DownStore;

    fn unavailable() -> StoreError {
        StoreError::Status {
            status: 503,
            body: "cluster down".into(),
        }
    }

    #[async_trait]
    impl DocumentStore for DownStore {
        async fn get(&self, _index: &str, _id: &str) -> StoreResult<Option<StoredDocument>> {
            Err(unavailable())
        }

        async fn index(
            &self,
            _index: &str,
            _id: Option<&str>,
            _document: Value,
            _pipeline: Option<&str>,
        ) -> StoreResult<IndexResult> {
            Err(unavailable())
        }

        async fn update(&self, _index: &str, _id: &str, _partial: Value) -> StoreResult<IndexResult> {
            Err(unavailable())
        }

        async fn search(&self, _request: &SearchRequest) -> StoreResult<Vec<SearchHit>> {
            Err(unavailable())
        }

        async fn count(&self, _index: &str) -> StoreResult<u64> {
            Err(unavailable())
        }

        async fn health(&self) -> StoreResult<ClusterHealth> {
            Err(unavailable())
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    fn down_assembler() -> ContextAssembler {
        let store: Arc<dyn DocumentStore> = Arc::new(DownStore);
        ContextAssembler::new(
            Arc::new(PersonaStore::new(store.clone())),
            Arc::new(KnowledgeRetriever::new(store, "m", false)),
        )
    }

    fn assembler(store: Arc<LocalStore>) -> ContextAssembler {
        ContextAssembler::new(
            Arc::new(PersonaStore::new(store.clone())),
            Arc::new(KnowledgeRetriever::new(store, "m", false)),
        )
    }

    #[tokio::test]
    async fn missing_email_warns_but_searches() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        store
            .index(
                KNOWLEDGE_INDEX,
                Some("c1"),
                json!({"chunk_id": "c1", "chunk_text": "We ship worldwide"}),
                Some(CHUNK_PIPELINE),
            )
            .await
            .unwrap();

        let ctx = assembler(store).assemble(None, "ship", 3).await.unwrap();
        assert_eq!(ctx.warnings, vec![MISSING_EMAIL_WARNING.to_string()]);
        assert!(ctx.memory.tags.is_empty());
        assert_eq!(ctx.knowledge.hits.len(), 1);
    }

    #[tokio::test]
    async fn query_is_mandatory() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        let err = assembler(store).assemble(Some("a@b.co"), "", 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn memory_comes_from_persona() {
        let store = Arc::new(LocalStore::temporary().unwrap());
        let personas = PersonaStore::new(store.clone());
        personas
            .upsert(
                "Jo@Shop.test",
                &[PersonaTag::new("prefers email", crate::persona::TagKind::Basic)],
                &[],
                PersonaConfig::default(),
            )
            .await
            .unwrap();

        let ctx = assembler(store)
            .assemble(Some("jo@shop.test"), "anything", 3)
            .await
            .unwrap();
        assert!(ctx.warnings.is_empty());
        assert_eq!(ctx.memory.tags.len(), 1);
        assert!(ctx.knowledge.hits.is_empty());
    }

    #[tokio::test]
    async fn store_outage_degrades_both_halves() {
        let ctx = down_assembler()
            .assemble(Some("jo@shop.test"), "refund policy", 3)
            .await
            .unwrap();
        assert!(ctx.memory.tags.is_empty());
        assert!(ctx.memory.interaction_history.is_empty());
        assert!(ctx.knowledge.hits.is_empty());
        assert_eq!(
            ctx.warnings,
            vec![
                "Persona lookup failed.".to_string(),
                "Knowledge search failed.".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn outage_detail_only_when_exposed() {
        let ctx = down_assembler()
            .with_error_detail(true)
            .assemble(Some("jo@shop.test"), "refund policy", 3)
            .await
            .unwrap();
        assert_eq!(ctx.warnings.len(), 2);
        assert!(ctx.warnings.iter().all(|w| w.contains("503")));
    }
}
