//! `/draft/*`: generation and the review decisions.

use super::fail;
use crate::api::{ok, ApiResult};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use clientmind_core::generator::GeneratedMemory;
use clientmind_core::lifecycle::{ApproveOutcome, HoldOutcome, RejectOutcome};
use clientmind_core::{
    ApproveRequest, GenerateRequest, HoldRequest, InboundEmail, KnowledgeContext, MemoryContext,
    PersonaConfig, RejectRequest, Services, StepReport,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub email: InboundEmail,
    #[serde(default)]
    pub memory: Option<MemoryContext>,
    #[serde(default)]
    pub knowledge: Option<KnowledgeContext>,
    #[serde(default)]
    pub persona_config: Option<PersonaConfig>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub draft: String,
    pub reasoning: String,
    pub draft_id: String,
    pub correlation_id: String,
    pub new_memories: Vec<GeneratedMemory>,
    pub steps: Vec<StepReport>,
}

/// With neither `memory` nor `knowledge` in the body, context is assembled from the
/// sender's persona and the subject and body as the knowledge query.
pub async fn generate(
    State(services): State<Services>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> ApiResult<GenerateResponse> {
    let Json(body) = payload?;
    let mut request = GenerateRequest {
        email: body.email,
        memory: body.memory.clone().unwrap_or_default(),
        knowledge: body.knowledge.clone().unwrap_or_default(),
        persona_config: PersonaConfig::default(),
    };

    let mut assembled_config = None;
    if body.memory.is_none() && body.knowledge.is_none() {
        let query = format!("{} {}", request.email.subject, request.email.body);
        if !query.trim().is_empty() && !request.email.from.trim().is_empty() {
            match services
                .assembler
                .assemble(Some(&request.email.from), &query, services.config.default_top_k)
                .await
            {
                Ok(ctx) => {
                    info!(
                        "assembled context for {}: {} tags, {} hits",
                        request.email.email_id,
                        ctx.memory.tags.len(),
                        ctx.knowledge.hits.len()
                    );
                    for warning in &ctx.warnings {
                        warn!("context: {}", warning);
                    }
                    request.memory = ctx.memory;
                    request.knowledge = ctx.knowledge;
                    assembled_config = Some(ctx.persona_config);
                }
                Err(e) => warn!("context assembly skipped: {}", e),
            }
        }
    }
    request.persona_config = body
        .persona_config
        .or(assembled_config)
        .unwrap_or_default();

    let draft = services
        .generator
        .generate(request)
        .await
        .map_err(fail(&services, "draft generation"))?;
    ok(GenerateResponse {
        draft: draft.draft_content,
        reasoning: draft.reasoning,
        draft_id: draft.draft_id,
        correlation_id: draft.correlation_id,
        new_memories: draft.new_memories,
        steps: draft.steps,
    })
}

pub async fn approve(
    State(services): State<Services>,
    payload: Result<Json<ApproveRequest>, JsonRejection>,
) -> ApiResult<ApproveOutcome> {
    let Json(request) = payload?;
    let outcome = services
        .lifecycle
        .approve(request)
        .await
        .map_err(fail(&services, "approval"))?;
    ok(outcome)
}

pub async fn hold(
    State(services): State<Services>,
    payload: Result<Json<HoldRequest>, JsonRejection>,
) -> ApiResult<HoldOutcome> {
    let Json(request) = payload?;
    let outcome = services
        .lifecycle
        .hold(request)
        .await
        .map_err(fail(&services, "hold"))?;
    ok(outcome)
}

pub async fn reject(
    State(services): State<Services>,
    payload: Result<Json<RejectRequest>, JsonRejection>,
) -> ApiResult<RejectOutcome> {
    let Json(request) = payload?;
    let outcome = services
        .lifecycle
        .reject(request)
        .await
        .map_err(fail(&services, "rejection"))?;
    ok(outcome)
}
