//! Pain extraction stage - lift structured events out of passed posts.
//!
//! The model is prompted literally (no advice, no summaries, empty
//! list allowed), optionally with the post's top comments. Responses
//! are validated hard - a generic or low-confidence event never
//! reaches the database - then enriched with post context, pain-type
//! families, a tools vocabulary, and a frequency score.

use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{MinerError, Result};
use crate::pipeline::prompts::{format_extract_prompt, SYSTEM_PROMPT};
use crate::traits::ai::{Ai, ModelRole};
use crate::traits::store::{EventStore, FilterStore, PostStore};
use crate::types::{
    EvidenceSource, ExtractStats, ExtractorConfig, FilteredPost, PainEvent, PainType, Post,
};

/// Problems shorter than this are noise.
const MIN_PROBLEM_CHARS: usize = 10;
/// Problems longer than this are summaries, not events.
const MAX_PROBLEM_CHARS: usize = 1000;
/// Backoff between timeout retries.
const TIMEOUT_BACKOFF: Duration = Duration::from_secs(5);

/// Generic complaints that carry no buildable signal.
const GENERIC_PROBLEMS: &[&str] = &[
    "it's slow",
    "it is slow",
    "it doesn't work",
    "it does not work",
    "it's broken",
    "it is broken",
    "too slow",
    "not working",
];

/// Vocabulary used to extend `mentioned_tools`.
const COMMON_TOOLS: &[&str] = &[
    "excel",
    "google sheets",
    "slack",
    "notion",
    "jira",
    "github",
    "zapier",
    "airtable",
    "discord",
    "email",
    "salesforce",
    "trello",
    "asana",
    "outlook",
    "quickbooks",
];

/// Keyword families for pain-type classification, in priority order.
const PAIN_TYPE_KEYWORDS: &[(PainType, &[&str])] = &[
    (
        PainType::Workflow,
        &["workflow", "process", "steps", "manual", "repetitive", "copy paste"],
    ),
    (
        PainType::Technical,
        &["error", "bug", "crash", "fails", "broken", "exception"],
    ),
    (
        PainType::Efficiency,
        &["slow", "hours", "tedious", "waste", "takes forever"],
    ),
    (
        PainType::Complexity,
        &["complex", "complicated", "confusing", "difficult"],
    ),
    (
        PainType::Integration,
        &["integrate", "sync", "connect", "api", "export", "import"],
    ),
    (
        PainType::Cost,
        &["cost", "price", "expensive", "subscription"],
    ),
    (
        PainType::Ux,
        &["interface", "clunky", "unusable", "ui", "ux"],
    ),
    (
        PainType::Data,
        &["data", "spreadsheet", "csv", "database", "records"],
    ),
];

/// Raw extraction response from the model (before validation).
#[derive(Debug, Deserialize)]
pub struct AiEventsResponse {
    #[serde(default)]
    pub events: Vec<AiPainEvent>,
}

/// One raw event from the model.
#[derive(Debug, Deserialize)]
pub struct AiPainEvent {
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub current_workaround: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub emotional_signal: Option<String>,
    #[serde(default)]
    pub mentioned_tools: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub evidence_sources: Vec<String>,
}

fn default_confidence() -> f32 {
    0.5
}

/// Validate one raw event. Returns None when it must be discarded.
pub fn validate_event(
    raw: AiPainEvent,
    post_id: &str,
    min_confidence: f32,
) -> Option<PainEvent> {
    if post_id.is_empty() {
        return None;
    }
    let problem = raw.problem.trim().to_string();
    let problem_len = problem.chars().count();
    if problem_len < MIN_PROBLEM_CHARS || problem_len > MAX_PROBLEM_CHARS {
        return None;
    }
    if raw.confidence < min_confidence || !(0.0..=1.0).contains(&raw.confidence) {
        return None;
    }
    let folded = problem.to_lowercase();
    if GENERIC_PROBLEMS.iter().any(|g| folded == *g) {
        return None;
    }

    let mut evidence_sources: Vec<EvidenceSource> = raw
        .evidence_sources
        .iter()
        .filter_map(|s| match s.to_lowercase().as_str() {
            "post" => Some(EvidenceSource::Post),
            "comments" => Some(EvidenceSource::Comments),
            _ => None,
        })
        .collect();
    evidence_sources.dedup();
    if evidence_sources.is_empty() {
        evidence_sources.push(EvidenceSource::Post);
    }

    Some(PainEvent {
        id: None,
        post_id: post_id.to_string(),
        actor: raw.actor.trim().to_string(),
        context: raw.context.trim().to_string(),
        problem,
        current_workaround: raw.current_workaround.filter(|w| !w.trim().is_empty()),
        frequency: raw.frequency.filter(|f| !f.trim().is_empty()),
        emotional_signal: raw.emotional_signal.filter(|e| !e.trim().is_empty()),
        mentioned_tools: raw.mentioned_tools,
        confidence: raw.confidence,
        evidence_sources,
        pain_types: vec![],
        primary_pain_type: None,
        frequency_score: 5,
        post_title: String::new(),
        post_category: String::new(),
        post_pain_score: 0.0,
    })
}

/// Attach post context, classify pain types, extend tools, derive the
/// frequency score.
pub fn enrich_event(mut event: PainEvent, post: &Post, filtered: &FilteredPost) -> PainEvent {
    event.post_title = post.title.clone();
    event.post_category = post.category.clone();
    event.post_pain_score = filtered.pain_score;

    let haystack = format!("{} {}", event.context, event.problem).to_lowercase();
    for (pain_type, keywords) in PAIN_TYPE_KEYWORDS {
        if keywords.iter().any(|k| haystack.contains(k)) {
            event.pain_types.push(*pain_type);
        }
    }
    event.primary_pain_type = event.pain_types.first().copied();

    let text = format!("{} {}", post.full_text(), haystack).to_lowercase();
    for tool in COMMON_TOOLS {
        let known = event
            .mentioned_tools
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tool));
        if !known && text.contains(tool) {
            event.mentioned_tools.push(tool.to_string());
        }
    }

    event.frequency_score = PainEvent::score_frequency(event.frequency.as_deref());
    event
}

/// Run extraction over passed posts the extractor has not attempted.
pub async fn run_extract<S, A>(
    store: &S,
    ai: &A,
    config: &ExtractorConfig,
    limit: usize,
) -> Result<ExtractStats>
where
    S: PostStore + FilterStore + EventStore,
    A: Ai,
{
    let started = Instant::now();
    let mut stats = ExtractStats::default();
    let pending = store.filtered_pending_extraction(limit).await?;

    for (index, (post, filtered)) in pending.iter().enumerate() {
        let comments = if config.max_comments > 0 {
            store.comments_for(&post.id, config.max_comments).await?
        } else {
            vec![]
        };
        let prompt = format_extract_prompt(post, &comments, config.comment_truncate_chars);

        let response = match chat_with_timeout_retry(ai, &prompt, config.timeout_retries).await {
            Ok(response) => response,
            Err(err) => {
                warn!(post = %post.id, "extraction failed: {err}");
                stats.llm_errors += 1;
                stats.posts_skipped += 1;
                continue;
            }
        };

        let parsed: AiEventsResponse = match serde_json::from_str(&response) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(post = %post.id, "unparseable extraction payload: {err}");
                stats.llm_errors += 1;
                stats.posts_skipped += 1;
                continue;
            }
        };

        let raw_count = parsed.events.len();
        let events: Vec<PainEvent> = parsed
            .events
            .into_iter()
            .filter_map(|raw| validate_event(raw, &post.id, config.min_confidence))
            .map(|event| enrich_event(event, post, filtered))
            .collect();
        stats.events_discarded += raw_count - events.len();

        if !events.is_empty() {
            store.insert_events(&events).await?;
            stats.events_extracted += events.len();
        }
        store.mark_extracted(&post.id).await?;
        stats.posts_processed += 1;

        // Cooperative pacing between posts; deterministic jitter keeps
        // runs reproducible.
        if index + 1 < pending.len() {
            tokio::time::sleep(dynamic_delay(&post.id, config)).await;
        }
    }

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        posts = stats.posts_processed,
        events = stats.events_extracted,
        discarded = stats.events_discarded,
        "extraction complete"
    );
    Ok(stats)
}

async fn chat_with_timeout_retry<A: Ai>(
    ai: &A,
    prompt: &str,
    timeout_retries: u32,
) -> Result<String> {
    let mut attempts = 0u32;
    loop {
        match ai.chat_json(ModelRole::Main, SYSTEM_PROMPT, prompt).await {
            Ok(response) => return Ok(response),
            Err(err @ MinerError::AiTimeout { .. }) if attempts < timeout_retries => {
                attempts += 1;
                warn!(attempts, "extraction timed out, retrying: {err}");
                tokio::time::sleep(TIMEOUT_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Delay in the configured window, derived from the post id.
fn dynamic_delay(post_id: &str, config: &ExtractorConfig) -> Duration {
    let span = config.max_delay_secs.saturating_sub(config.min_delay_secs) + 1;
    let hash = post_id.bytes().fold(0u64, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(b as u64)
    });
    Duration::from_secs(config.min_delay_secs + hash % span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::SqliteStore;
    use crate::testing::{self, MockAi};
    use crate::traits::store::{EventStore, FilterStore, PostStore};

    fn raw_event(problem: &str, confidence: f32) -> AiPainEvent {
        AiPainEvent {
            actor: "analyst".into(),
            context: "monthly reporting".into(),
            problem: problem.into(),
            current_workaround: None,
            frequency: Some("weekly".into()),
            emotional_signal: None,
            mentioned_tools: vec![],
            confidence,
            evidence_sources: vec!["post".into(), "comments".into()],
        }
    }

    #[test]
    fn validation_drops_short_long_generic_and_unsure() {
        assert!(validate_event(raw_event("too short", 0.9), "p", 0.3).is_none());
        assert!(validate_event(raw_event(&"x".repeat(1001), 0.9), "p", 0.3).is_none());
        assert!(validate_event(raw_event("It's slow", 0.9), "p", 0.3).is_none());
        assert!(validate_event(raw_event("exports keep crashing mid-run", 0.2), "p", 0.3).is_none());
        assert!(validate_event(raw_event("exports keep crashing mid-run", 0.9), "", 0.3).is_none());
        assert!(validate_event(raw_event("exports keep crashing mid-run", 0.9), "p", 0.3).is_some());
    }

    #[test]
    fn validation_normalizes_evidence_sources() {
        let event = validate_event(raw_event("exports keep crashing mid-run", 0.9), "p", 0.3)
            .unwrap();
        assert_eq!(
            event.evidence_sources,
            vec![EvidenceSource::Post, EvidenceSource::Comments]
        );

        let mut raw = raw_event("exports keep crashing mid-run", 0.9);
        raw.evidence_sources = vec!["chat".into()];
        let event = validate_event(raw, "p", 0.3).unwrap();
        assert_eq!(event.evidence_sources, vec![EvidenceSource::Post]);
    }

    #[test]
    fn enrichment_classifies_and_extends_tools() {
        let post = testing::post_builder("reddit", "p1")
            .title("Excel macros crash every export")
            .body("The excel export fails on large sheets and I redo it by hand.")
            .build();
        let filtered = testing::filtered_post("reddit_p1", 0.7);
        let event = validate_event(
            raw_event("the export crashes on files above 50MB", 0.9),
            "reddit_p1",
            0.3,
        )
        .unwrap();

        let enriched = enrich_event(event, &post, &filtered);
        assert!(enriched.mentioned_tools.iter().any(|t| t == "excel"));
        assert!(enriched.pain_types.contains(&PainType::Technical));
        assert!(enriched.pain_types.contains(&PainType::Integration));
        assert!(enriched.primary_pain_type.is_some());
        assert_eq!(enriched.frequency_score, 8);
        assert_eq!(enriched.post_title, post.title);
        assert!((enriched.post_pain_score - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn extraction_persists_events_and_marks_posts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let fetched = testing::fetched_post("reddit", "p1", 2);
        store.insert_post(&fetched).await.unwrap();
        store
            .upsert_filtered(&testing::filtered_post("reddit_p1", 0.6))
            .await
            .unwrap();

        let ai = MockAi::new().with_default_response(
            r#"{"events": [
                {"actor": "analyst", "context": "reporting",
                 "problem": "the excel export crashes every week on big files",
                 "frequency": "weekly", "mentioned_tools": ["excel"],
                 "confidence": 0.9, "evidence_sources": ["post", "comments"]},
                {"actor": "", "context": "", "problem": "it's slow", "confidence": 0.9}
            ]}"#,
        );

        let stats = run_extract(&store, &ai, &ExtractorConfig::default(), 10)
            .await
            .unwrap();
        assert_eq!(stats.posts_processed, 1);
        assert_eq!(stats.events_extracted, 1);
        assert_eq!(stats.events_discarded, 1);

        // Post is marked attempted, so a rerun does nothing.
        let rerun = run_extract(&store, &ai, &ExtractorConfig::default(), 10)
            .await
            .unwrap();
        assert_eq!(rerun.posts_processed, 0);

        let events = store.events_by_ids(&[1]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].problem.contains("export"));
    }

    #[tokio::test]
    async fn comment_prompt_is_used_when_comments_exist() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .insert_post(&testing::fetched_post("reddit", "p1", 3))
            .await
            .unwrap();
        store
            .upsert_filtered(&testing::filtered_post("reddit_p1", 0.6))
            .await
            .unwrap();

        let ai = MockAi::new().with_default_response(r#"{"events": []}"#);
        run_extract(&store, &ai, &ExtractorConfig::default(), 10)
            .await
            .unwrap();

        let calls = ai.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].user_prompt.contains("Top comments:"));
    }

    #[test]
    fn dynamic_delay_stays_in_window() {
        let config = ExtractorConfig::default();
        for id in ["reddit_a", "reddit_b", "hn_12345"] {
            let delay = dynamic_delay(id, &config).as_secs();
            assert!((3..=7).contains(&delay));
        }
    }
}
