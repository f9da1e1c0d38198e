//! Process configuration loaded once at startup.
//!
//! Precedence: built-in defaults < legacy deployment variables (`ELASTIC_CLOUD_URL`,
//! `ELASTIC_API_KEY`, `ELASTIC_AGENT_ID`, `OPENROUTER_API_KEY`, `DEBUG_LOGS`) <
//! TOML file (`CLIENTMIND_CONFIG`, default `config/clientmind.toml`) < `CLIENTMIND_*` env.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | store_backend | local | `elastic` talks to a cluster, `local` uses an embedded sled DB. |
//! | storage_path | ./data/clientmind | sled directory for the local backend. |
//! | model_provider | agent_builder | `agent_builder` (Kibana converse) or `openrouter`. |
//! | debug_logs | false | Per-line stream diagnostics at debug level. |
//! | expose_error_detail | false | Include upstream error detail in API envelopes. |

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_ELSER_MODEL: &str = ".elser_model_2_linux-x86_64";
pub const DEFAULT_OPENROUTER_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Elastic,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    AgentBuilder,
    OpenRouter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMindConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub store_backend: StoreBackend,
    pub storage_path: String,
    #[serde(default)]
    pub elastic_url: Option<String>,
    #[serde(default)]
    pub elastic_api_key: Option<String>,
    /// Kibana base URL for the Agent Builder. Derived from `elastic_url` when unset.
    #[serde(default)]
    pub kibana_url: Option<String>,
    pub elser_model_id: String,
    pub model_provider: ModelProvider,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub callback_timeout_secs: u64,
    pub debug_logs: bool,
    pub expose_error_detail: bool,
    pub max_upload_bytes: usize,
    pub chunk_words: usize,
    pub chunk_overlap: usize,
    pub default_top_k: usize,
    pub events_default_limit: usize,
}

impl Default for ClientMindConfig {
    fn default() -> Self {
        Self {
            app_name: "ClientMind".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            store_backend: StoreBackend::Local,
            storage_path: "./data/clientmind".to_string(),
            elastic_url: None,
            elastic_api_key: None,
            kibana_url: None,
            elser_model_id: DEFAULT_ELSER_MODEL.to_string(),
            model_provider: ModelProvider::AgentBuilder,
            agent_id: None,
            openrouter_api_key: None,
            openrouter_model: DEFAULT_OPENROUTER_MODEL.to_string(),
            callback_timeout_secs: 15,
            debug_logs: false,
            expose_error_detail: false,
            max_upload_bytes: 10 * 1024 * 1024,
            chunk_words: 800,
            chunk_overlap: 200,
            default_top_k: 3,
            events_default_limit: 50,
        }
    }
}

impl ClientMindConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CLIENTMIND_CONFIG").unwrap_or_else(|_| "config/clientmind.toml".to_string());
        let d = Self::default();
        let mut builder = config::Config::builder()
            .set_default("app_name", d.app_name)?
            .set_default("host", d.host)?
            .set_default("port", d.port as i64)?
            .set_default("store_backend", "local")?
            .set_default("storage_path", d.storage_path)?
            .set_default("elser_model_id", d.elser_model_id)?
            .set_default("model_provider", "agent_builder")?
            .set_default("openrouter_model", d.openrouter_model)?
            .set_default("callback_timeout_secs", d.callback_timeout_secs as i64)?
            .set_default("debug_logs", env_bool("DEBUG_LOGS", false))?
            .set_default("expose_error_detail", false)?
            .set_default("max_upload_bytes", d.max_upload_bytes as i64)?
            .set_default("chunk_words", d.chunk_words as i64)?
            .set_default("chunk_overlap", d.chunk_overlap as i64)?
            .set_default("default_top_k", d.default_top_k as i64)?
            .set_default("events_default_limit", d.events_default_limit as i64)?;

        for (key, legacy) in [
            ("elastic_url", "ELASTIC_CLOUD_URL"),
            ("elastic_api_key", "ELASTIC_API_KEY"),
            ("agent_id", "ELASTIC_AGENT_ID"),
            ("openrouter_api_key", "OPENROUTER_API_KEY"),
        ] {
            if let Some(v) = env_opt_string(legacy) {
                builder = builder.set_default(key, v)?;
            }
        }
        // A cluster URL in the environment means the deployment expects Elasticsearch.
        if env_opt_string("ELASTIC_CLOUD_URL").is_some() {
            builder = builder.set_default("store_backend", "elastic")?;
        }

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("CLIENTMIND")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Self = built.try_deserialize()?;
        if cfg.kibana_url.is_none() {
            cfg.kibana_url = cfg.elastic_url.as_deref().map(derive_kibana_url);
        }
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Elastic Cloud convention: the Kibana host replaces `.es.` with `.kb.` and serves on the default port.
pub fn derive_kibana_url(elastic_url: &str) -> String {
    elastic_url
        .trim_end_matches('/')
        .replacen(".es.", ".kb.", 1)
        .replacen(":443", "", 1)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.trim().eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
