//! Draft review lifecycle: hold, approve, reject.
//!
//! `pending -> approved`, `pending -> rejected` and `pending -> pending` (hold) are the
//! legal transitions; any move out of a decided state is refused before a write. A
//! decision is first appended to `clientmind_events`; that write is the only one that
//! can fail the request. The draft update, persona history append and workflow
//! callback that follow are best-effort and reported as [`StepReport`]s.

use crate::error::{PipelineError, PipelineResult};
use crate::generator::InboundEmail;
use crate::persona::{normalize_email, truncate_chars, InteractionEntry, PersonaStore};
use crate::store::{DocumentStore, StoreError, DRAFTS_INDEX, EVENTS_INDEX};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
        }
    }

    pub fn can_transition(self, to: DraftStatus) -> bool {
        use DraftStatus::*;
        matches!(
            (self, to),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Pending)
        )
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub draft_id: String,
    #[serde(default)]
    pub email_id: String,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub original_body: String,
    #[serde(default)]
    pub draft_content: String,
    #[serde(default)]
    pub status: DraftStatus,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n8n_callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Draft {
    pub fn pending(
        draft_id: &str,
        email: &InboundEmail,
        customer_email: &str,
        content: &str,
        reasoning: &str,
    ) -> Self {
        Self {
            draft_id: draft_id.to_string(),
            email_id: email.email_id.clone(),
            customer_email: customer_email.to_string(),
            subject: email.subject.clone(),
            original_body: email.body.clone(),
            draft_content: content.to_string(),
            status: DraftStatus::Pending,
            created_at: now_rfc3339(),
            reasoning: reasoning.to_string(),
            ..Default::default()
        }
    }
}

/// Immutable audit record of one review decision. For rejections `approved_by` and
/// `approved_at` hold the reviewer and decision time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub correlation_id: String,
    pub draft_id: String,
    pub approved_by: String,
    pub approved_at: String,
    pub status: DraftStatus,
    pub message_id: String,
    #[serde(default)]
    pub n8n_callback_url: String,
    #[serde(default)]
    pub draft_content: String,
    #[serde(default)]
    pub email_id: String,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum StepOutcome {
    Applied,
    Skipped(String),
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step: &'static str,
    pub outcome: StepOutcome,
}

impl StepReport {
    pub fn new(step: &'static str, outcome: StepOutcome) -> Self {
        Self { step, outcome }
    }

    /// `Err` becomes `Degraded` and is logged.
    pub fn from_result<T, E: fmt::Display>(step: &'static str, result: Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::new(step, StepOutcome::Applied),
            Err(e) => {
                warn!("{} degraded: {}", step, e);
                Self::new(step, StepOutcome::Degraded(e.to_string()))
            }
        }
    }

    fn skipped(step: &'static str, reason: &str) -> Self {
        info!("{} skipped: {}", step, reason);
        Self::new(step, StepOutcome::Skipped(reason.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("callback request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("callback returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Body posted to the workflow callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackPayload {
    pub status: DraftStatus,
    pub approved_by: String,
    pub draft_content: String,
    pub draft_id: String,
}

#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError>;
}

pub struct HttpCallbackSink {
    client: reqwest::Client,
}

impl HttpCallbackSink {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("callback client without {:?} timeout: {}", timeout, e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl CallbackSink for HttpCallbackSink {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError> {
        info!("sending workflow callback to {}", url);
        let res = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            if status == reqwest::StatusCode::NOT_FOUND {
                warn!("callback 404: the workflow execution may have expired");
            }
            return Err(CallbackError::Status {
                status: status.as_u16(),
                body,
            });
        }
        info!("workflow callback accepted ({})", status);
        Ok(())
    }
}

/// Rewrite the first `localhost` to `127.0.0.1` so IPv4-only local listeners are reachable.
pub fn loopback_url(url: &str) -> String {
    url.replacen("localhost", "127.0.0.1", 1)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub draft_id: String,
    #[serde(default)]
    pub approved_by: String,
    #[serde(default)]
    pub n8n_callback_url: Option<String>,
    #[serde(default)]
    pub draft_content: Option<String>,
    #[serde(default)]
    pub email_id: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApproveOutcome {
    pub correlation_id: String,
    pub sent: bool,
    pub message_id: String,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HoldRequest {
    #[serde(default)]
    pub draft_id: String,
    #[serde(default)]
    pub n8n_callback_url: String,
    #[serde(default)]
    pub email_id: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldOutcome {
    pub correlation_id: String,
    pub saved: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub draft_id: String,
    #[serde(default)]
    pub rejected_by: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub n8n_callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectOutcome {
    pub correlation_id: String,
    pub rejected: bool,
    pub message_id: String,
    pub steps: Vec<StepReport>,
}

/// Decision details after filling gaps from the stored draft.
struct Resolved {
    stored_status: Option<DraftStatus>,
    callback_url: Option<String>,
    draft_content: Option<String>,
    email_id: Option<String>,
    customer_email: Option<String>,
    subject: Option<String>,
}

pub struct DraftLifecycle {
    store: Arc<dyn DocumentStore>,
    personas: Arc<PersonaStore>,
    callbacks: Arc<dyn CallbackSink>,
}

impl DraftLifecycle {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        personas: Arc<PersonaStore>,
        callbacks: Arc<dyn CallbackSink>,
    ) -> Self {
        Self {
            store,
            personas,
            callbacks,
        }
    }

    async fn stored_draft(&self, draft_id: &str) -> Option<Draft> {
        match self.store.get(DRAFTS_INDEX, draft_id).await {
            Ok(Some(doc)) => match serde_json::from_value::<Draft>(doc.source) {
                Ok(draft) => Some(draft),
                Err(e) => {
                    warn!("stored draft {} unreadable: {}", draft_id, e);
                    None
                }
            },
            Ok(None) => {
                info!("draft {} not found in store", draft_id);
                None
            }
            Err(e) => {
                warn!("draft {} lookup failed: {}", draft_id, e);
                None
            }
        }
    }

    async fn resolve(
        &self,
        draft_id: &str,
        callback_url: Option<String>,
        draft_content: Option<String>,
        email_id: Option<String>,
        customer_email: Option<String>,
        subject: Option<String>,
    ) -> Resolved {
        let stored = self.stored_draft(draft_id).await;
        let from_stored = |f: fn(&Draft) -> &str| {
            stored
                .as_ref()
                .map(|d| f(d).to_string())
                .filter(|s| !s.is_empty())
        };
        Resolved {
            stored_status: stored.as_ref().map(|d| d.status),
            callback_url: non_empty(callback_url).or_else(|| {
                stored
                    .as_ref()
                    .and_then(|d| non_empty(d.n8n_callback_url.clone()))
            }),
            draft_content: non_empty(draft_content).or_else(|| from_stored(|d| d.draft_content.as_str())),
            email_id: non_empty(email_id).or_else(|| from_stored(|d| d.email_id.as_str())),
            customer_email: non_empty(customer_email)
                .or_else(|| from_stored(|d| d.customer_email.as_str()))
                .map(|e| normalize_email(&e)),
            subject: non_empty(subject).or_else(|| from_stored(|d| d.subject.as_str())),
        }
    }

    async fn update_draft(&self, draft_id: &str, partial: Value) -> StepReport {
        StepReport::from_result(
            "draft_update",
            self.store.update(DRAFTS_INDEX, draft_id, partial).await,
        )
    }

    /// Decided drafts are final. An unknown draft passes so the decision is still recorded.
    fn check_transition(
        draft_id: &str,
        stored: Option<DraftStatus>,
        to: DraftStatus,
    ) -> PipelineResult<()> {
        match stored {
            Some(from) if !from.can_transition(to) => Err(PipelineError::InvalidTransition {
                draft_id: draft_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn callback(&self, url: Option<&str>, payload: CallbackPayload) -> StepReport {
        const STEP: &str = "workflow_callback";
        match url {
            Some(url) => StepReport::from_result(
                STEP,
                self.callbacks.notify(&loopback_url(url), &payload).await,
            ),
            None => {
                warn!("no callback url for draft {}", payload.draft_id);
                StepReport::skipped(STEP, "no callback url")
            }
        }
    }

    async fn append_event(&self, event: &ApprovalEvent) -> PipelineResult<()> {
        let doc = serde_json::to_value(event).map_err(StoreError::from)?;
        self.store.index(EVENTS_INDEX, None, doc, None).await?;
        Ok(())
    }

    pub async fn approve(&self, req: ApproveRequest) -> PipelineResult<ApproveOutcome> {
        let draft_id = req.draft_id.trim().to_string();
        let approved_by = req.approved_by.trim().to_string();
        if draft_id.is_empty() || approved_by.is_empty() {
            return Err(PipelineError::validation("draft_id and approved_by are required"));
        }
        let edited_content = non_empty(req.draft_content.clone());
        let r = self
            .resolve(
                &draft_id,
                req.n8n_callback_url,
                req.draft_content,
                req.email_id,
                req.customer_email,
                req.subject,
            )
            .await;
        Self::check_transition(&draft_id, r.stored_status, DraftStatus::Approved)?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message_id = uuid::Uuid::new_v4().to_string();
        let approved_at = now_rfc3339();
        let draft_content = r.draft_content.clone().unwrap_or_default();
        let event = ApprovalEvent {
            correlation_id: correlation_id.clone(),
            draft_id: draft_id.clone(),
            approved_by: approved_by.clone(),
            approved_at: approved_at.clone(),
            status: DraftStatus::Approved,
            message_id: message_id.clone(),
            n8n_callback_url: r.callback_url.clone().unwrap_or_default(),
            draft_content: draft_content.clone(),
            email_id: r.email_id.clone().unwrap_or_default(),
            customer_email: r.customer_email.clone().unwrap_or_default(),
            subject: r.subject.clone().unwrap_or_default(),
            reason: None,
        };
        self.append_event(&event).await?;
        info!("approval event {} recorded for draft {}", correlation_id, draft_id);

        let mut partial = json!({
            "status": DraftStatus::Approved,
            "approved_by": approved_by,
            "approved_at": approved_at,
        });
        if let Some(content) = edited_content {
            partial["draft_content"] = Value::String(content);
        }
        let mut steps = vec![self.update_draft(&draft_id, partial).await];

        steps.push(match &r.customer_email {
            Some(email) => {
                let entry = InteractionEntry {
                    summary: format!(
                        "Subject: {}\nDraft: {}...",
                        r.subject.as_deref().unwrap_or("No Subject"),
                        truncate_chars(&draft_content, SUMMARY_CHARS)
                    ),
                    date: approved_at.clone(),
                    source_id: r.email_id.clone().unwrap_or_else(|| draft_id.clone()),
                };
                StepReport::from_result(
                    "persona_history",
                    self.personas.record_interaction(email, entry).await,
                )
            }
            None => StepReport::skipped("persona_history", "no customer_email"),
        });

        let payload = CallbackPayload {
            status: DraftStatus::Approved,
            approved_by,
            draft_content,
            draft_id,
        };
        steps.push(self.callback(r.callback_url.as_deref(), payload).await);

        Ok(ApproveOutcome {
            correlation_id,
            sent: true,
            message_id,
            steps,
        })
    }

    /// Register callback metadata on a pending draft without deciding it.
    pub async fn hold(&self, req: HoldRequest) -> PipelineResult<HoldOutcome> {
        let draft_id = req.draft_id.trim().to_string();
        let callback_url = req.n8n_callback_url.trim().to_string();
        if draft_id.is_empty() || callback_url.is_empty() {
            return Err(PipelineError::validation("draft_id and n8n_callback_url are required"));
        }
        let doc = self
            .store
            .get(DRAFTS_INDEX, &draft_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("draft {}", draft_id)))?;
        let status: DraftStatus = doc
            .source
            .get("status")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();
        Self::check_transition(&draft_id, Some(status), DraftStatus::Pending)?;

        let mut partial = Map::new();
        partial.insert("n8n_callback_url".into(), Value::String(callback_url));
        if let Some(v) = non_empty(req.email_id) {
            partial.insert("email_id".into(), Value::String(v));
        }
        if let Some(v) = non_empty(req.customer_email) {
            partial.insert("customer_email".into(), Value::String(normalize_email(&v)));
        }
        if let Some(v) = non_empty(req.subject) {
            partial.insert("subject".into(), Value::String(v));
        }
        partial.insert("updated_at".into(), Value::String(now_rfc3339()));
        self.store
            .update(DRAFTS_INDEX, &draft_id, Value::Object(partial))
            .await?;
        info!("draft {} held for callback", draft_id);

        Ok(HoldOutcome {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            saved: true,
        })
    }

    /// Record a rejection. The persona is left untouched.
    pub async fn reject(&self, req: RejectRequest) -> PipelineResult<RejectOutcome> {
        let draft_id = req.draft_id.trim().to_string();
        let rejected_by = req.rejected_by.trim().to_string();
        if draft_id.is_empty() || rejected_by.is_empty() {
            return Err(PipelineError::validation("draft_id and rejected_by are required"));
        }
        let r = self
            .resolve(&draft_id, req.n8n_callback_url, None, None, None, None)
            .await;
        Self::check_transition(&draft_id, r.stored_status, DraftStatus::Rejected)?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message_id = uuid::Uuid::new_v4().to_string();
        let decided_at = now_rfc3339();
        let reason = non_empty(req.reason);
        let draft_content = r.draft_content.clone().unwrap_or_default();
        let event = ApprovalEvent {
            correlation_id: correlation_id.clone(),
            draft_id: draft_id.clone(),
            approved_by: rejected_by.clone(),
            approved_at: decided_at.clone(),
            status: DraftStatus::Rejected,
            message_id: message_id.clone(),
            n8n_callback_url: r.callback_url.clone().unwrap_or_default(),
            draft_content: draft_content.clone(),
            email_id: r.email_id.clone().unwrap_or_default(),
            customer_email: r.customer_email.clone().unwrap_or_default(),
            subject: r.subject.clone().unwrap_or_default(),
            reason: reason.clone(),
        };
        self.append_event(&event).await?;
        info!("rejection event {} recorded for draft {}", correlation_id, draft_id);

        let mut partial = json!({
            "status": DraftStatus::Rejected,
            "approved_by": rejected_by,
            "approved_at": decided_at,
        });
        if let Some(reason) = reason {
            partial["rejection_reason"] = Value::String(reason);
        }
        let mut steps = vec![self.update_draft(&draft_id, partial).await];
        let payload = CallbackPayload {
            status: DraftStatus::Rejected,
            approved_by: rejected_by,
            draft_content,
            draft_id,
        };
        steps.push(self.callback(r.callback_url.as_deref(), payload).await);

        Ok(RejectOutcome {
            correlation_id,
            rejected: true,
            message_id,
            steps,
        })
    }
}
