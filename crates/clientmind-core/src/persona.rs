//! Persona memory: per-customer tags, interaction history and reply preferences.
//!
//! One document per customer in `clientmind_persona`, addressed by the normalized email
//! (trimmed, lower-cased) which is also the document id. Writes for the same email are
//! serialized in-process; across processes the store's last write wins.

use crate::error::{PipelineError, PipelineResult};
use crate::store::{DocumentStore, SearchQuery, SearchRequest, EVENTS_INDEX, PERSONA_INDEX};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tag source for facts extracted from a generated reply.
pub const INFERENCE_SOURCE: &str = "email_inference";
/// History length kept by the approval append path.
pub const HISTORY_CAP: usize = 10;
const COLD_START_EVENTS: usize = 5;
const SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Warning,
    Opportunity,
    #[default]
    Basic,
    History,
}

impl TagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Warning => "warning",
            TagKind::Opportunity => "opportunity",
            TagKind::Basic => "basic",
            TagKind::History => "history",
        }
    }

    /// Unknown kinds read as `basic`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "warning" => TagKind::Warning,
            "opportunity" => TagKind::Opportunity,
            "history" => TagKind::History,
            _ => TagKind::Basic,
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TagKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(TagKind::parse_lenient).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaTag {
    pub label: String,
    #[serde(rename = "type", default)]
    pub kind: TagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl PersonaTag {
    pub fn new(label: &str, kind: TagKind) -> Self {
        Self {
            label: label.to_string(),
            kind,
            source: None,
            date: None,
            confidence: None,
        }
    }

    /// Uniqueness key: `label|type|source` (absent source counts as empty).
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.label,
            self.kind,
            self.source.as_deref().unwrap_or("")
        )
    }

    fn overlay(&mut self, incoming: PersonaTag) {
        self.label = incoming.label;
        self.kind = incoming.kind;
        self.source = incoming.source.or(self.source.take());
        self.date = incoming.date.or(self.date.take());
        self.confidence = incoming.confidence.or(self.confidence);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEntry {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub source_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Friendly,
    Professional,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Friendly => "friendly",
            Tone::Professional => "professional",
        }
    }
}

/// Reply preferences. Known keys are typed; anything else rides along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<Tone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_send: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PersonaConfig {
    /// Shallow merge: every key present on `incoming` overwrites.
    pub fn merge(&mut self, incoming: PersonaConfig) {
        if incoming.agent_name.is_some() {
            self.agent_name = incoming.agent_name;
        }
        if incoming.tone.is_some() {
            self.tone = incoming.tone;
        }
        if incoming.auto_send.is_some() {
            self.auto_send = incoming.auto_send;
        }
        self.extra.extend(incoming.extra);
    }
}

/// Stored persona document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaRecord {
    pub customer_email: String,
    #[serde(default)]
    pub tags: Vec<PersonaTag>,
    #[serde(default)]
    pub interaction_history: Vec<InteractionEntry>,
    #[serde(default)]
    pub persona_config: PersonaConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Read view returned by [`PersonaStore::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaSnapshot {
    pub tags: Vec<PersonaTag>,
    pub interaction_history: Vec<InteractionEntry>,
    pub persona_config: PersonaConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub record: PersonaRecord,
    pub version: u64,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Merge tags keyed by `label|type|source`. Existing order is kept and new keys are
/// appended; for a shared key incoming fields win and fields it leaves out are kept.
pub fn merge_tags(existing: &[PersonaTag], incoming: &[PersonaTag]) -> Vec<PersonaTag> {
    let mut merged: Vec<PersonaTag> = Vec::with_capacity(existing.len() + incoming.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for tag in existing.iter().chain(incoming.iter()) {
        match positions.get(&tag.key()) {
            Some(&i) => merged[i].overlay(tag.clone()),
            None => {
                positions.insert(tag.key(), merged.len());
                merged.push(tag.clone());
            }
        }
    }
    merged
}

/// Merge history keyed by `source_id`; incoming entries replace in place, new ids append.
pub fn merge_history(
    existing: &[InteractionEntry],
    incoming: &[InteractionEntry],
) -> Vec<InteractionEntry> {
    let mut merged: Vec<InteractionEntry> = Vec::with_capacity(existing.len() + incoming.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for entry in existing.iter().chain(incoming.iter()) {
        match positions.get(&entry.source_id) {
            Some(&i) => merged[i] = entry.clone(),
            None => {
                positions.insert(entry.source_id.clone(), merged.len());
                merged.push(entry.clone());
            }
        }
    }
    merged
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct PersonaStore {
    store: Arc<dyn DocumentStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PersonaStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, email: &str) -> Arc<Mutex<()>> {
        self.locks.entry(email.to_string()).or_default().clone()
    }

    /// Drop the customer's lock once no other writer holds or awaits it.
    fn release(&self, email: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(email, |_, l| Arc::strong_count(l) == 1);
    }

    fn require_email(email: &str) -> PipelineResult<String> {
        let normalized = normalize_email(email);
        if normalized.is_empty() {
            return Err(PipelineError::validation("customer_email is required"));
        }
        Ok(normalized)
    }

    async fn load(&self, email: &str) -> PipelineResult<Option<PersonaRecord>> {
        match self.store.get(PERSONA_INDEX, email).await? {
            Some(doc) => {
                let mut record: PersonaRecord = serde_json::from_value(doc.source)
                    .map_err(crate::store::StoreError::from)?;
                record.customer_email = email.to_string();
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, record: &PersonaRecord) -> PipelineResult<u64> {
        let doc = serde_json::to_value(record).map_err(crate::store::StoreError::from)?;
        let result = self
            .store
            .index(PERSONA_INDEX, Some(&record.customer_email), doc, None)
            .await?;
        Ok(result.version)
    }

    /// Never fails for an unknown customer. Without a stored record the history is
    /// synthesized from the customer's most recent approval events.
    pub async fn get(&self, email: &str) -> PipelineResult<PersonaSnapshot> {
        let email = Self::require_email(email)?;
        if let Some(record) = self.load(&email).await? {
            return Ok(PersonaSnapshot {
                tags: record.tags,
                interaction_history: record.interaction_history,
                persona_config: record.persona_config,
            });
        }
        debug!("no persona for {}, reading recent approval events", email);
        Ok(PersonaSnapshot {
            interaction_history: self.history_from_events(&email).await,
            ..Default::default()
        })
    }

    async fn history_from_events(&self, email: &str) -> Vec<InteractionEntry> {
        let request = SearchRequest::new(EVENTS_INDEX, SearchQuery::term("customer_email", email))
            .size(COLD_START_EVENTS)
            .sort_desc("approved_at")
            .ignore_unavailable();
        let hits = match self.store.search(&request).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("cold-start history lookup failed for {}: {}", email, e);
                return Vec::new();
            }
        };
        hits.into_iter()
            .map(|hit| {
                let s = &hit.source;
                let text = |f: &str| s.get(f).and_then(Value::as_str).unwrap_or_default();
                InteractionEntry {
                    summary: format!(
                        "Subject: {}\nContent: {}...",
                        text("subject"),
                        truncate_chars(text("draft_content"), SUMMARY_CHARS)
                    ),
                    date: text("approved_at").to_string(),
                    source_id: crate::store::str_field(s, "email_id")
                        .map(str::to_string)
                        .unwrap_or(hit.id.clone()),
                }
            })
            .collect()
    }

    /// Merge `tags`, `history` and `config` into the stored record (created if missing).
    pub async fn upsert(
        &self,
        email: &str,
        tags: &[PersonaTag],
        history: &[InteractionEntry],
        config: PersonaConfig,
    ) -> PipelineResult<UpsertOutcome> {
        let email = Self::require_email(email)?;
        let lock = self.lock_for(&email);
        let result = {
            let _guard = lock.lock().await;
            self.upsert_locked(&email, tags, history, config).await
        };
        self.release(&email, lock);
        result
    }

    async fn upsert_locked(
        &self,
        email: &str,
        tags: &[PersonaTag],
        history: &[InteractionEntry],
        config: PersonaConfig,
    ) -> PipelineResult<UpsertOutcome> {
        let now = now_rfc3339();
        let mut record = self.load(email).await?.unwrap_or_else(|| PersonaRecord {
            customer_email: email.to_string(),
            created_at: Some(now.clone()),
            ..Default::default()
        });
        record.tags = merge_tags(&record.tags, tags);
        record.interaction_history = merge_history(&record.interaction_history, history);
        record.persona_config.merge(config);
        record.updated_at = Some(now);

        let version = self.save(&record).await?;
        info!(
            "persona {} upserted: {} tags, {} history entries (v{})",
            email,
            record.tags.len(),
            record.interaction_history.len(),
            version
        );
        Ok(UpsertOutcome { record, version })
    }

    /// Approval path: prepend `entry` (replacing any entry with the same `source_id`) and
    /// keep the newest [`HISTORY_CAP`] entries. Tags and config are untouched.
    pub async fn record_interaction(
        &self,
        email: &str,
        entry: InteractionEntry,
    ) -> PipelineResult<u64> {
        let email = Self::require_email(email)?;
        let lock = self.lock_for(&email);
        let result = {
            let _guard = lock.lock().await;
            self.record_interaction_locked(&email, entry).await
        };
        self.release(&email, lock);
        result
    }

    async fn record_interaction_locked(
        &self,
        email: &str,
        entry: InteractionEntry,
    ) -> PipelineResult<u64> {
        let now = now_rfc3339();
        let mut record = self.load(email).await?.unwrap_or_else(|| PersonaRecord {
            customer_email: email.to_string(),
            created_at: Some(now.clone()),
            ..Default::default()
        });
        record
            .interaction_history
            .retain(|e| e.source_id != entry.source_id);
        record.interaction_history.insert(0, entry);
        record.interaction_history.truncate(HISTORY_CAP);
        record.updated_at = Some(now);
        self.save(&record).await
    }

    /// Fold `{label, type}` pairs extracted by the generator into the customer's tags.
    pub async fn merge_inferred(
        &self,
        email: &str,
        memories: &[(String, String)],
    ) -> PipelineResult<u64> {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let tags: Vec<PersonaTag> = memories
            .iter()
            .map(|(label, kind)| PersonaTag {
                label: label.clone(),
                kind: TagKind::parse_lenient(kind),
                source: Some(INFERENCE_SOURCE.to_string()),
                date: Some(today.clone()),
                confidence: None,
            })
            .collect();
        let outcome = self.upsert(email, &tags, &[], PersonaConfig::default()).await?;
        Ok(outcome.version)
    }
}
