//! Pain events - structured difficulties lifted from posts.

use serde::{Deserialize, Serialize};

/// Where the evidence for a pain event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSource {
    Post,
    Comments,
}

/// Family a pain event belongs to, derived from keyword presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PainType {
    Workflow,
    Technical,
    Efficiency,
    Complexity,
    Integration,
    Cost,
    Ux,
    Data,
}

impl PainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Technical => "technical",
            Self::Efficiency => "efficiency",
            Self::Complexity => "complexity",
            Self::Integration => "integration",
            Self::Cost => "cost",
            Self::Ux => "ux",
            Self::Data => "data",
        }
    }

    pub fn all() -> [PainType; 8] {
        [
            Self::Workflow,
            Self::Technical,
            Self::Efficiency,
            Self::Complexity,
            Self::Integration,
            Self::Cost,
            Self::Ux,
            Self::Data,
        ]
    }
}

/// A single concrete, recurring user difficulty extracted from a post.
///
/// `problem` is the load-bearing field: validation guarantees it is
/// non-empty and between 10 and 1000 characters before a row is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PainEvent {
    /// Database id (None until stored)
    pub id: Option<i64>,
    pub post_id: String,

    /// Who is experiencing the problem
    pub actor: String,
    /// Situation the problem occurs in
    pub context: String,
    /// The concrete difficulty
    pub problem: String,
    /// What they currently do instead, if stated
    pub current_workaround: Option<String>,
    /// Free-text frequency ("daily", "every sprint", ...)
    pub frequency: Option<String>,
    /// Expressed emotion, if any
    pub emotional_signal: Option<String>,
    /// Tools named in the post
    pub mentioned_tools: Vec<String>,
    /// Extraction confidence in [0,1]
    pub confidence: f32,
    /// Which parts of the thread supported this event
    pub evidence_sources: Vec<EvidenceSource>,

    // Enrichment, attached after extraction
    pub pain_types: Vec<PainType>,
    pub primary_pain_type: Option<PainType>,
    /// 1-10, derived from the frequency text
    pub frequency_score: u8,
    pub post_title: String,
    pub post_category: String,
    /// The filter-stage pain score of the originating post
    pub post_pain_score: f32,
}

impl PainEvent {
    /// Text used for embedding: fields joined with " | ".
    pub fn embedding_text(&self, max_chars: usize) -> String {
        let full = [
            self.actor.as_str(),
            self.context.as_str(),
            self.problem.as_str(),
            self.current_workaround.as_deref().unwrap_or(""),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" | ");

        if full.chars().count() <= max_chars {
            return full;
        }

        // Prefer context | problem when cutting
        let core = format!("{} | {}", self.context, self.problem);
        truncate_chars(&core, max_chars)
    }

    /// Map frequency text onto a 1-10 score.
    pub fn score_frequency(frequency: Option<&str>) -> u8 {
        let text = match frequency {
            Some(f) => f.to_lowercase(),
            None => return 5,
        };
        if text.contains("daily") || text.contains("every day") {
            10
        } else if text.contains("weekly") || text.contains("every week") {
            8
        } else if text.contains("often") || text.contains("frequent") {
            7
        } else if text.contains("monthly") || text.contains("every month") {
            6
        } else if text.contains("sometimes") || text.contains("occasional") {
            4
        } else if text.contains("rarely") || text.contains("seldom") {
            2
        } else {
            5
        }
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_text_maps_to_scores() {
        assert_eq!(PainEvent::score_frequency(Some("daily")), 10);
        assert_eq!(PainEvent::score_frequency(Some("every week or so")), 8);
        assert_eq!(PainEvent::score_frequency(Some("monthly close")), 6);
        assert_eq!(PainEvent::score_frequency(Some("quite often")), 7);
        assert_eq!(PainEvent::score_frequency(Some("sometimes")), 4);
        assert_eq!(PainEvent::score_frequency(Some("rarely")), 2);
        assert_eq!(PainEvent::score_frequency(Some("when Jupiter aligns")), 5);
        assert_eq!(PainEvent::score_frequency(None), 5);
    }

    #[test]
    fn embedding_text_prefers_context_and_problem_when_cutting() {
        let mut event = crate::testing::pain_event("p1", "exporting reports breaks constantly");
        event.actor = "a".repeat(1500);
        event.context = "monthly financial reporting".into();
        let text = event.embedding_text(100);
        assert!(text.chars().count() <= 100);
        assert!(text.starts_with("monthly financial reporting | "));
    }

    #[test]
    fn embedding_text_joins_all_fields_when_short() {
        let event = crate::testing::pain_event("p1", "exports crash on large files");
        let text = event.embedding_text(2000);
        assert!(text.contains(" | exports crash on large files"));
    }
}
