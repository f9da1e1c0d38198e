//! ClientMind core: persona memory, dual retrieval, reply drafting and the review lifecycle.
//!
//! Every component takes its collaborators explicitly ([`DocumentStore`],
//! [`ConverseModel`], [`CallbackSink`]); [`Services::build`] wires them once at startup.

pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod knowledge;
pub mod lifecycle;
pub mod persona;
pub mod projector;
pub mod store;

pub use config::{ClientMindConfig, ModelProvider, StoreBackend};
pub use context::{ContextAssembler, DualContext, KnowledgeContext, MemoryContext};
pub use error::{PipelineError, PipelineResult};
pub use generator::{ConverseModel, DraftGenerator, GenerateRequest, GeneratedDraft, InboundEmail};
pub use knowledge::{IngestError, KnowledgeHit, KnowledgeIngestor, KnowledgeRetriever, PdfUpload};
pub use lifecycle::{
    ApproveRequest, CallbackSink, DraftLifecycle, DraftStatus, HoldRequest, HttpCallbackSink,
    RejectRequest, StepOutcome, StepReport,
};
pub use persona::{normalize_email, PersonaConfig, PersonaStore, PersonaTag, TagKind};
pub use projector::{EventProjector, EventRow};
pub use store::{DocumentStore, ElasticStore, LocalStore, StoreError};

use std::sync::Arc;
use std::time::Duration;

/// Shared handles for one process. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ClientMindConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub personas: Arc<PersonaStore>,
    pub retriever: Arc<KnowledgeRetriever>,
    pub ingestor: Arc<KnowledgeIngestor>,
    pub assembler: Arc<ContextAssembler>,
    pub generator: Arc<DraftGenerator>,
    pub lifecycle: Arc<DraftLifecycle>,
    pub projector: Arc<EventProjector>,
}

impl Services {
    pub fn build(
        config: ClientMindConfig,
        store: Arc<dyn DocumentStore>,
        model: Arc<dyn ConverseModel>,
        callbacks: Arc<dyn CallbackSink>,
    ) -> Self {
        let personas = Arc::new(PersonaStore::new(store.clone()));
        let retriever = Arc::new(KnowledgeRetriever::new(
            store.clone(),
            &config.elser_model_id,
            config.debug_logs,
        ));
        let ingestor = Arc::new(KnowledgeIngestor::new(
            store.clone(),
            config.chunk_words,
            config.chunk_overlap,
            config.max_upload_bytes,
        ));
        let assembler = Arc::new(
            ContextAssembler::new(personas.clone(), retriever.clone())
                .with_error_detail(config.expose_error_detail),
        );
        let generator = Arc::new(DraftGenerator::new(
            model,
            store.clone(),
            personas.clone(),
            config.debug_logs,
        ));
        let lifecycle = Arc::new(DraftLifecycle::new(store.clone(), personas.clone(), callbacks));
        let projector = Arc::new(EventProjector::new(store.clone(), config.events_default_limit));
        Self {
            config: Arc::new(config),
            store,
            personas,
            retriever,
            ingestor,
            assembler,
            generator,
            lifecycle,
            projector,
        }
    }

    /// Store, model provider and HTTP callback sink all taken from `config`.
    pub fn from_config(config: ClientMindConfig) -> Result<Self, StoreError> {
        let store = store::open_store(&config)?;
        let model = generator::model_from_config(&config);
        let callbacks = Arc::new(HttpCallbackSink::new(Duration::from_secs(
            config.callback_timeout_secs,
        )));
        Ok(Self::build(config, store, model, callbacks))
    }
}
