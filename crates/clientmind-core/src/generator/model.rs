//! Generative model providers. Each returns the raw SSE byte stream of one completion.

use super::prompt::Prompt;
use crate::config::{ClientMindConfig, ModelProvider};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ModelError>>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model provider not configured: {0}")]
    NotConfigured(String),

    #[error("model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Permission denied. Please ensure your API Key has 'read_agent_builder' privileges. Error: {body}")]
    PermissionDenied { body: String },

    #[error("Agent invocation failed: {status} - {body}")]
    Upstream { status: u16, body: String },

    #[error("model stream read failed: {0}")]
    Stream(String),
}

#[async_trait]
pub trait ConverseModel: Send + Sync {
    async fn converse(&self, prompt: &Prompt) -> Result<ByteStream, ModelError>;

    /// Identifier reported in draft reasoning (agent id or model name).
    fn agent_id(&self) -> &str;
}

fn into_byte_stream(response: reqwest::Response) -> ByteStream {
    response
        .bytes_stream()
        .map(|chunk| {
            chunk
                .map(|b| b.to_vec())
                .map_err(|e| ModelError::Stream(e.to_string()))
        })
        .boxed()
}

/// Kibana Agent Builder `converse/async` endpoint.
pub struct AgentBuilderModel {
    client: reqwest::Client,
    kibana_url: String,
    api_key: String,
    agent_id: String,
    debug_logs: bool,
}

impl AgentBuilderModel {
    pub fn new(kibana_url: &str, api_key: &str, agent_id: &str, debug_logs: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            kibana_url: kibana_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            agent_id: agent_id.to_string(),
            debug_logs,
        }
    }
}

#[async_trait]
impl ConverseModel for AgentBuilderModel {
    async fn converse(&self, prompt: &Prompt) -> Result<ByteStream, ModelError> {
        let url = format!("{}/api/agent_builder/converse/async", self.kibana_url);
        if self.debug_logs {
            debug!("calling agent builder at {} with agent {}", url, self.agent_id);
        }
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("ApiKey {}", self.api_key))
            .header("kbn-xsrf", "true")
            .json(&json!({ "agent_id": self.agent_id, "input": prompt.combined() }))
            .send()
            .await?;

        let status = response.status();
        info!("agent builder responded {}", status);
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("agent builder error {}: {}", status, body);
            if status == reqwest::StatusCode::FORBIDDEN {
                return Err(ModelError::PermissionDenied { body });
            }
            return Err(ModelError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(into_byte_stream(response))
    }

    fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

/// OpenAI-compatible streaming chat completion on OpenRouter.
pub struct OpenRouterModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenRouterModel {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            base_url: OPENROUTER_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ConverseModel for OpenRouterModel {
    async fn converse(&self, prompt: &Prompt) -> Result<ByteStream, ModelError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "stream": true,
            "temperature": 0.7,
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", "https://clientmind.local")
            .header("X-Title", "ClientMind Drafts")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("openrouter error {}: {}", status, body);
            return Err(ModelError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(into_byte_stream(response))
    }

    fn agent_id(&self) -> &str {
        &self.model
    }
}

/// Stand-in when credentials are missing; every call fails with `NotConfigured`.
pub struct UnconfiguredModel {
    reason: String,
}

impl UnconfiguredModel {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ConverseModel for UnconfiguredModel {
    async fn converse(&self, _prompt: &Prompt) -> Result<ByteStream, ModelError> {
        Err(ModelError::NotConfigured(self.reason.clone()))
    }

    fn agent_id(&self) -> &str {
        "unconfigured"
    }
}

/// Provider selected by `model_provider`.
pub fn model_from_config(cfg: &ClientMindConfig) -> Arc<dyn ConverseModel> {
    match cfg.model_provider {
        ModelProvider::AgentBuilder => {
            let (Some(kibana), Some(key), Some(agent)) = (
                cfg.kibana_url.as_deref(),
                cfg.elastic_api_key.as_deref(),
                cfg.agent_id.as_deref(),
            ) else {
                return Arc::new(UnconfiguredModel::new(
                    "agent_builder needs ELASTIC_CLOUD_URL (or kibana_url), ELASTIC_API_KEY and ELASTIC_AGENT_ID",
                ));
            };
            Arc::new(AgentBuilderModel::new(kibana, key, agent, cfg.debug_logs))
        }
        ModelProvider::OpenRouter => match cfg.openrouter_api_key.as_deref() {
            Some(key) => Arc::new(OpenRouterModel::new(key, &cfg.openrouter_model)),
            None => Arc::new(UnconfiguredModel::new("openrouter needs OPENROUTER_API_KEY")),
        },
    }
}
