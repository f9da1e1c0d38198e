//! Top-level pipeline error. Component errors (store, model, ingest) convert into it.

use crate::generator::model::ModelError;
use crate::knowledge::IngestError;
use crate::store::StoreError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing or malformed caller input. Never has side effects.
    #[error("{0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("draft {draft_id} is {from}; cannot move to {to}")]
    InvalidTransition {
        draft_id: String,
        from: String,
        to: String,
    },

    #[error("draft generation failed: empty stream response. Events received: {}", .events.join(", "))]
    EmptyGeneration { events: Vec<String> },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    /// True for errors caused by the caller rather than by a collaborator.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::NotFound(_)
                | PipelineError::InvalidTransition { .. }
                | PipelineError::Ingest(IngestError::UnsupportedType(_))
                | PipelineError::Ingest(IngestError::TooLarge { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_generation_lists_events() {
        let err = PipelineError::EmptyGeneration {
            events: vec!["conversation_id_set".into(), "round_complete".into()],
        };
        assert_eq!(
            err.to_string(),
            "draft generation failed: empty stream response. Events received: conversation_id_set, round_complete"
        );
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(PipelineError::validation("x").is_client_error());
        assert!(!PipelineError::Store(StoreError::NotFound {
            index: "i".into(),
            id: "d".into()
        })
        .is_client_error());
    }
}
