//! Decoding the model's `{draft_html, new_memories}` answer.
//!
//! Strict JSON first (after stripping markdown fences). Model output is often almost-JSON,
//! so a regex decoder recovers the draft and memory objects when strict parsing fails.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```json\n?|\n?```").unwrap());
// The draft string ends at the quote followed by the `new_memories` key or the closing brace.
static DRAFT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""draft_html":\s*"([\s\S]*?)"\s*(?:,\s*"new_memories"|\})"#).unwrap());
static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\s*"label":\s*"([^"]+)",\s*"type":\s*"([^"]+)"\s*\}"#).unwrap());

fn default_kind() -> String {
    "basic".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedMemory {
    pub label: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDraft {
    pub draft_content: String,
    pub new_memories: Vec<GeneratedMemory>,
}

#[derive(Deserialize)]
struct StrictOutput {
    #[serde(default)]
    draft_html: Option<String>,
    #[serde(default)]
    new_memories: Option<Vec<GeneratedMemory>>,
}

pub fn strip_fences(raw: &str) -> String {
    FENCE_RE.replace_all(raw, "").trim().to_string()
}

/// `None` when the cleaned text is not the expected JSON object.
pub fn parse_strict(raw: &str) -> Option<ParsedDraft> {
    let out: StrictOutput = serde_json::from_str(&strip_fences(raw)).ok()?;
    Some(ParsedDraft {
        draft_content: out.draft_html.unwrap_or_default(),
        new_memories: out.new_memories.unwrap_or_default(),
    })
}

/// Regex recovery. When no `draft_html` value is found the raw text is the draft.
pub fn parse_lenient(raw: &str) -> ParsedDraft {
    let draft_content = match DRAFT_RE.captures(raw) {
        Some(caps) => caps[1].replace("\\n", "\n").replace("\\\"", "\""),
        None => raw.to_string(),
    };
    let new_memories = MEMORY_RE
        .captures_iter(raw)
        .map(|caps| GeneratedMemory {
            label: caps[1].to_string(),
            kind: caps[2].to_string(),
        })
        .collect();
    ParsedDraft {
        draft_content,
        new_memories,
    }
}

pub fn parse_generation(raw: &str) -> ParsedDraft {
    parse_strict(raw).unwrap_or_else(|| parse_lenient(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_accepts_fenced_json() {
        let raw = "```json\n{\"draft_html\":\"<p>hi</p>\",\"new_memories\":[]}\n```";
        let parsed = parse_strict(raw).unwrap();
        assert_eq!(parsed.draft_content, "<p>hi</p>");
        assert!(parsed.new_memories.is_empty());
    }

    #[test]
    fn null_draft_is_empty_not_raw() {
        let parsed = parse_generation(r#"{"draft_html":null,"new_memories":null}"#);
        assert_eq!(parsed.draft_content, "");
        assert!(parsed.new_memories.is_empty());
    }

    #[test]
    fn lenient_recovers_from_broken_json() {
        // Unescaped quote inside the HTML and a trailing comma break strict parsing.
        let raw = r#"Sure! {"draft_html": "<p>Say "hi"\nthere</p>", "new_memories": [{"label": "Size M", "type": "basic"}, {"label": "Late order", "type": "warning"},]}"#;
        assert!(parse_strict(raw).is_none());
        let parsed = parse_lenient(raw);
        assert_eq!(parsed.draft_content, "<p>Say \"hi\"\nthere</p>");
        assert_eq!(
            parsed.new_memories,
            vec![
                GeneratedMemory { label: "Size M".into(), kind: "basic".into() },
                GeneratedMemory { label: "Late order".into(), kind: "warning".into() },
            ]
        );
    }

    #[test]
    fn plain_text_becomes_the_draft() {
        let parsed = parse_generation("Thanks for reaching out!");
        assert_eq!(parsed.draft_content, "Thanks for reaching out!");
        assert!(parsed.new_memories.is_empty());
    }

    #[test]
    fn memory_type_defaults_to_basic() {
        let parsed = parse_strict(r#"{"draft_html":"x","new_memories":[{"label":"VIP"}]}"#).unwrap();
        assert_eq!(parsed.new_memories[0].kind, "basic");
    }
}
