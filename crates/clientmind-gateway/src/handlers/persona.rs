//! `/persona/get` and `/persona/upsert`.

use super::{correlation_id, degrade_read, fail};
use crate::api::{ok, ApiResult};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use clientmind_core::persona::InteractionEntry;
use clientmind_core::{PersonaConfig, PersonaTag, Services};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct PersonaGetBody {
    #[serde(default)]
    pub customer_email: String,
}

#[derive(Debug, Serialize)]
pub struct PersonaView {
    pub correlation_id: String,
    pub tags: Vec<PersonaTag>,
    pub interaction_history: Vec<InteractionEntry>,
    pub persona_config: PersonaConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub async fn get(
    State(services): State<Services>,
    payload: Result<Json<PersonaGetBody>, JsonRejection>,
) -> ApiResult<PersonaView> {
    let Json(body) = payload?;
    let result = services.personas.get(&body.customer_email).await;
    let (snapshot, warnings) = degrade_read(&services, "persona read", "Persona lookup", result)?;
    ok(PersonaView {
        correlation_id: correlation_id(),
        tags: snapshot.tags,
        interaction_history: snapshot.interaction_history,
        persona_config: snapshot.persona_config,
        warnings,
    })
}

#[derive(Debug, Deserialize)]
pub struct PersonaUpsertBody {
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub tags: Vec<PersonaTag>,
    #[serde(default)]
    pub interaction_history: Vec<InteractionEntry>,
    #[serde(default)]
    pub persona_config: PersonaConfig,
}

#[derive(Debug, Serialize)]
pub struct UpsertView {
    pub correlation_id: String,
    pub updated: bool,
    pub version: u64,
    pub persona_config: PersonaConfig,
}

pub async fn upsert(
    State(services): State<Services>,
    payload: Result<Json<PersonaUpsertBody>, JsonRejection>,
) -> ApiResult<UpsertView> {
    let Json(body) = payload?;
    let outcome = services
        .personas
        .upsert(
            &body.customer_email,
            &body.tags,
            &body.interaction_history,
            body.persona_config,
        )
        .await
        .map_err(fail(&services, "persona upsert"))?;
    ok(UpsertView {
        correlation_id: correlation_id(),
        updated: true,
        version: outcome.version,
        persona_config: outcome.record.persona_config,
    })
}
