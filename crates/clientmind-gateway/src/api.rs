//! Response envelope and error mapping shared by every JSON endpoint.
//!
//! Success: `{"code": 0, "message": "ok", "data": ...}`.
//! Failure: `{"code": -1, "message": ...}` with a matching HTTP status.

use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clientmind_core::generator::ModelError;
use clientmind_core::{PipelineError, StoreError};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        code: 0,
        message: "ok".to_string(),
        data: Some(data),
    }))
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Map a pipeline failure for operation `op`. Caller mistakes always carry their
    /// message; collaborator failures only when `expose_detail` is set.
    pub fn from_pipeline(op: &str, err: PipelineError, expose_detail: bool) -> Self {
        let status = status_for(&err);
        if err.is_client_error() {
            warn!("{} rejected: {}", op, err);
            return Self::new(status, err.to_string());
        }
        error!("{} failed: {}", op, err);
        let message = if expose_detail {
            format!("{} failed: {}", op, err)
        } else {
            format!("{} failed: Internal Server Error", op)
        };
        Self::new(status, message)
    }
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        PipelineError::Store(StoreError::NotConfigured(_))
        | PipelineError::Model(ModelError::NotConfigured(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        PipelineError::Store(_) | PipelineError::Model(_) => StatusCode::BAD_GATEWAY,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("invalid request body: {}", rejection.body_text()))
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), format!("invalid upload: {}", err.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            code: -1,
            message: self.message,
            data: None,
        };
        (self.status, Json(body)).into_response()
    }
}
