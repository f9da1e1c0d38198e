//! Prompt template for reply drafting.

use super::InboundEmail;
use crate::context::{KnowledgeContext, MemoryContext};
use crate::persona::Tone;

const HISTORY_LINES: usize = 5;
const KNOWLEDGE_PASSAGES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// Single-input form for providers without a system role.
    pub fn combined(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}

fn system_directive(agent_name: &str, tone: Tone) -> String {
    let voice = match tone {
        Tone::Friendly => "warm, upbeat and personal",
        Tone::Professional => "courteous, precise and composed",
    };
    [
        "# Role".to_string(),
        format!(
            "You are {}, a customer support specialist writing reply emails on behalf of the team.",
            agent_name
        ),
        format!("Write in a {} voice ({} tone).", voice, tone.as_str()),
        String::new(),
        "# Guidelines".to_string(),
        "- Never say \"according to the database\" or \"our records show\".".to_string(),
        "- Memory and history:".to_string(),
        "  1. Check 'Memory & Preferences' (tags) first.".to_string(),
        "  2. Check 'History' (previous interactions) second. Customer details that appear only in History (sizes, measurements, past issues) must be used as if they were already known.".to_string(),
        "  3. When such details are concrete (e.g. 180cm, size M), mention them explicitly.".to_string(),
        "  4. When Memory and History disagree, Memory wins.".to_string(),
        "- Memory extraction: put every new customer attribute you learn from this email into \"new_memories\". Use type \"warning\", \"opportunity\", \"basic\" or \"history\".".to_string(),
        "- Facts: do not invent policies or timelines that are not in the Knowledge Base section.".to_string(),
        "- Format: return one JSON object and nothing else (no markdown):".to_string(),
        "{".to_string(),
        "  \"draft_html\": \"HTML body of the reply (<p>, <strong>, ...). No subject line.\",".to_string(),
        "  \"new_memories\": [".to_string(),
        "    { \"label\": \"Height 180cm\", \"type\": \"basic\" }".to_string(),
        "  ]".to_string(),
        "}".to_string(),
    ]
    .join("\n")
}

pub fn build_prompt(
    email: &InboundEmail,
    memory: &MemoryContext,
    knowledge: &KnowledgeContext,
    agent_name: &str,
    tone: Tone,
) -> Prompt {
    let tag_line = if memory.tags.is_empty() {
        "No stored preferences were found.".to_string()
    } else {
        let tags: Vec<String> = memory
            .tags
            .iter()
            .map(|t| format!("{}({})", t.label, t.kind))
            .collect();
        format!("Known preferences: {}.", tags.join(", "))
    };

    let history_line = if memory.interaction_history.is_empty() {
        "No previous interaction history found.".to_string()
    } else {
        let lines: Vec<String> = memory
            .interaction_history
            .iter()
            .take(HISTORY_LINES)
            .map(|h| format!("- [{}] {}", h.date, h.summary))
            .collect();
        format!("Previous interactions:\n{}", lines.join("\n"))
    };

    let knowledge_line = if knowledge.hits.is_empty() {
        "No relevant knowledge snippets were found.".to_string()
    } else {
        let passages: Vec<&str> = knowledge
            .hits
            .iter()
            .take(KNOWLEDGE_PASSAGES)
            .map(|h| h.chunk_text.as_str())
            .collect();
        format!("Relevant references: {}", passages.join(" "))
    };

    let user = [
        "# Context Data".to_string(),
        format!("1. **Email Subject**: {}", email.subject),
        format!("2. **Email Body**: {}", email.body),
        format!("3. **Memory & Preferences**: {}", tag_line),
        format!("4. **History**: {}", history_line),
        format!("5. **Knowledge Base**: {}", knowledge_line),
        String::new(),
        "# Task".to_string(),
        "Write a clear, complete and personalized reply email in HTML following the guidelines above. Return JSON only.".to_string(),
    ]
    .join("\n");

    Prompt {
        system: system_directive(agent_name, tone),
        user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeHit;
    use crate::persona::{InteractionEntry, PersonaTag, TagKind};

    fn email() -> InboundEmail {
        InboundEmail {
            email_id: "m-1".into(),
            subject: "Wrong size".into(),
            body: "The jacket is too small".into(),
            from: "kim@shop.test".into(),
        }
    }

    #[test]
    fn empty_context_uses_placeholders() {
        let p = build_prompt(
            &email(),
            &MemoryContext::default(),
            &KnowledgeContext::default(),
            "ClientMind",
            Tone::Friendly,
        );
        assert!(p.system.contains("You are ClientMind"));
        assert!(p.system.contains("friendly tone"));
        assert!(p.user.contains("No stored preferences were found."));
        assert!(p.user.contains("No previous interaction history found."));
        assert!(p.user.contains("No relevant knowledge snippets were found."));
    }

    #[test]
    fn context_is_truncated_and_formatted() {
        let memory = MemoryContext {
            tags: vec![PersonaTag::new("size M", TagKind::Basic)],
            interaction_history: (0..7)
                .map(|i| InteractionEntry {
                    summary: format!("visit {}", i),
                    date: "2025-05-01".into(),
                    source_id: format!("s{}", i),
                })
                .collect(),
        };
        let knowledge = KnowledgeContext {
            hits: (0..4)
                .map(|i| KnowledgeHit {
                    chunk_id: format!("c{}", i),
                    source: "faq.pdf".into(),
                    chunk_text: format!("passage{}", i),
                    score: 1.0,
                    metadata: serde_json::json!({}),
                })
                .collect(),
        };
        let p = build_prompt(&email(), &memory, &knowledge, "Ava", Tone::Professional);
        assert!(p.user.contains("Known preferences: size M(basic)."));
        assert!(p.user.contains("- [2025-05-01] visit 4"));
        assert!(!p.user.contains("visit 5"));
        assert!(p.user.contains("Relevant references: passage0 passage1 passage2"));
        assert!(!p.user.contains("passage3"));
        assert!(p.combined().starts_with("# Role\nYou are Ava"));
    }
}
