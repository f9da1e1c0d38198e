//! Draft generation: prompt, streaming model call, answer decoding, draft persistence.

pub mod model;
pub mod parse;
pub mod prompt;
pub mod stream;

pub use model::{model_from_config, ByteStream, ConverseModel, ModelError};
pub use parse::{GeneratedMemory, ParsedDraft};
pub use prompt::Prompt;
pub use stream::{SseDecoder, StreamAccumulator, StreamEvent};

use crate::context::{KnowledgeContext, MemoryContext};
use crate::error::{PipelineError, PipelineResult};
use crate::lifecycle::{Draft, StepOutcome, StepReport};
use crate::persona::{normalize_email, PersonaConfig, PersonaStore, Tone};
use crate::store::{DocumentStore, StoreError, DRAFTS_INDEX};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_AGENT_NAME: &str = "ClientMind";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    #[serde(default)]
    pub email_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub from: String,
}

impl InboundEmail {
    fn validate(&self) -> PipelineResult<()> {
        let fields = [&self.email_id, &self.subject, &self.body, &self.from];
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err(PipelineError::validation(
                "email (email_id, subject, body, from) is required",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub email: InboundEmail,
    pub memory: MemoryContext,
    pub knowledge: KnowledgeContext,
    pub persona_config: PersonaConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedDraft {
    pub correlation_id: String,
    pub draft_id: String,
    pub draft_content: String,
    pub new_memories: Vec<GeneratedMemory>,
    pub reasoning: String,
    pub steps: Vec<StepReport>,
}

pub struct DraftGenerator {
    model: Arc<dyn ConverseModel>,
    store: Arc<dyn DocumentStore>,
    personas: Arc<PersonaStore>,
    debug_logs: bool,
}

impl DraftGenerator {
    pub fn new(
        model: Arc<dyn ConverseModel>,
        store: Arc<dyn DocumentStore>,
        personas: Arc<PersonaStore>,
        debug_logs: bool,
    ) -> Self {
        Self {
            model,
            store,
            personas,
            debug_logs,
        }
    }

    /// Fails on invalid input, model errors and empty output. Persisting the draft and
    /// merging inferred memories are reported per step and never fail the call.
    pub async fn generate(&self, request: GenerateRequest) -> PipelineResult<GeneratedDraft> {
        let GenerateRequest {
            email,
            memory,
            knowledge,
            persona_config,
        } = request;
        email.validate()?;

        let tone = persona_config.tone.unwrap_or(Tone::Friendly);
        let agent_name = persona_config
            .agent_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(DEFAULT_AGENT_NAME);
        let prompt = prompt::build_prompt(&email, &memory, &knowledge, agent_name, tone);

        let stream = self.model.converse(&prompt).await?;
        let (raw, events) = stream::collect_stream(stream, self.debug_logs).await?.into_parts();
        let parsed = parse::parse_generation(&raw);
        if parsed.draft_content.trim().is_empty() {
            warn!("empty generation, events: {:?}", events);
            return Err(PipelineError::EmptyGeneration { events });
        }

        let reasoning = format!(
            "agent:{} | tone:{} | tags:{} | history:{} | hits:{}",
            self.model.agent_id(),
            tone.as_str(),
            memory.tags.len(),
            memory.interaction_history.len(),
            knowledge.hits.len()
        );
        let draft_id = uuid::Uuid::new_v4().to_string();
        let customer_email = normalize_email(&email.from);

        let draft = Draft::pending(&draft_id, &email, &customer_email, &parsed.draft_content, &reasoning);
        let mut steps = vec![StepReport::from_result("draft_persist", self.persist(&draft).await)];

        let memories: Vec<(String, String)> = parsed
            .new_memories
            .iter()
            .map(|m| (m.label.clone(), m.kind.clone()))
            .collect();
        let persona_step = if memories.is_empty() {
            StepReport::new("persona_merge", StepOutcome::Skipped("no new memories".to_string()))
        } else {
            StepReport::from_result(
                "persona_merge",
                self.personas.merge_inferred(&customer_email, &memories).await,
            )
        };
        steps.push(persona_step);

        info!(
            "draft {} generated for {} ({} new memories)",
            draft_id,
            customer_email,
            memories.len()
        );
        Ok(GeneratedDraft {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            draft_id,
            draft_content: parsed.draft_content,
            new_memories: parsed.new_memories,
            reasoning,
            steps,
        })
    }

    async fn persist(&self, draft: &Draft) -> Result<(), StoreError> {
        let doc = serde_json::to_value(draft)?;
        self.store
            .index(DRAFTS_INDEX, Some(&draft.draft_id), doc, None)
            .await?;
        Ok(())
    }
}
