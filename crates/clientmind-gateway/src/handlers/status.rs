//! Review feed, store status and liveness.

use super::fail;
use crate::api::{ok, ApiError, ApiResult};
use axum::body::Bytes;
use axum::extract::State;
use clientmind_core::store::{store_status, StoreStatus};
use clientmind_core::{EventRow, PipelineError, Services};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct EventsBody {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventRow>,
}

/// The body is optional; an empty POST lists the default window.
pub async fn events_list(State(services): State<Services>, body: Bytes) -> ApiResult<EventsResponse> {
    let body: EventsBody = if body.iter().all(u8::is_ascii_whitespace) {
        EventsBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))?
    };
    let events = services
        .projector
        .list(body.limit)
        .await
        .map_err(fail(&services, "event listing"))?;
    ok(EventsResponse { events })
}

pub async fn elastic_status(State(services): State<Services>) -> ApiResult<StoreStatus> {
    let status = store_status(services.store.as_ref())
        .await
        .map_err(|e| fail(&services, "status check")(PipelineError::from(e)))?;
    ok(status)
}

pub async fn health() -> &'static str {
    "OK"
}
