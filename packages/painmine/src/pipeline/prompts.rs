//! LLM prompts for the mining pipeline.
//!
//! Prompts are conservative and literal: extraction must not advise or
//! summarize, validation must answer the question asked, and every
//! response is a single JSON document. Placeholders use `{name}`
//! substitution via the `format_*` helpers.

use sha2::{Digest, Sha256};

use crate::types::{Cluster, Comment, Post};

/// System prompt shared by all calls.
pub const SYSTEM_PROMPT: &str =
    "You are a careful analyst. Respond with a single valid JSON document and nothing else.";

/// Prompt for extracting pain events from a post.
pub const EXTRACT_PROMPT: &str = r#"Extract concrete, recurring user difficulties from this post.

Be literal and conservative:
- Do NOT give advice or summarize the post
- Only report difficulties the author actually describes
- An empty list is a valid answer

Post from {source} (score {score}, {num_comments} comments):
Title: {title}
Body:
{body}

Output JSON:
{
    "events": [
        {
            "actor": "who has the problem (role, not username)",
            "context": "situation it occurs in",
            "problem": "the concrete difficulty, specific and self-contained",
            "current_workaround": "what they do instead, or null",
            "frequency": "how often, in the author's words, or null",
            "emotional_signal": "expressed emotion, or null",
            "mentioned_tools": ["tools named in the post"],
            "confidence": 0.0 to 1.0
        }
    ]
}"#;

/// Comment-aware variant of the extraction prompt.
pub const EXTRACT_WITH_COMMENTS_PROMPT: &str = r#"Extract concrete, recurring user difficulties from this post and its top comments.

Be literal and conservative:
- Do NOT give advice or summarize the thread
- Only report difficulties actually described
- Use comments to make events more specific and to confirm that others
  hit the same problem
- For each event, set "evidence_sources" to the subset of
  ["post", "comments"] that supports it
- An empty list is a valid answer

Post from {source} (score {score}, {num_comments} comments):
Title: {title}
Body:
{body}

Top comments:
{comments}

Output JSON:
{
    "events": [
        {
            "actor": "who has the problem (role, not username)",
            "context": "situation it occurs in",
            "problem": "the concrete difficulty, specific and self-contained",
            "current_workaround": "what they do instead, or null",
            "frequency": "how often, in the author's words, or null",
            "emotional_signal": "expressed emotion, or null",
            "mentioned_tools": ["tools named in the thread"],
            "confidence": 0.0 to 1.0,
            "evidence_sources": ["post", "comments"]
        }
    ]
}"#;

/// Prompt asking whether sampled events share one workflow.
pub const CLUSTER_VALIDATE_PROMPT: &str = r#"Do these user difficulties describe the same underlying workflow failing in similar ways?

Events:
{events}

Answer strictly about the workflow, not the tools involved.

Output JSON:
{
    "same_workflow": true or false,
    "workflow_name": "short name for the workflow",
    "description": "one sentence describing the shared workflow",
    "confidence": 0.0 to 1.0,
    "reason": "brief justification"
}"#;

/// Prompt summarizing an accepted cluster.
pub const CLUSTER_SUMMARIZE_PROMPT: &str = r#"Summarize this group of user difficulties that share the workflow "{workflow_name}".

Events:
{events}

Output JSON:
{
    "centroid_summary": "2-3 sentences describing the shared difficulty",
    "common_pain": "the pain every event shares, one sentence",
    "common_context": "the situation they share, one sentence",
    "example_events": ["2-3 representative problem statements, verbatim"],
    "coherence_score": 0.0 to 1.0
}"#;

/// Prompt aligning clusters across sources.
pub const ALIGN_PROMPT: &str = r#"These workflow clusters come from different communities. Find clusters from DIFFERENT sources that describe the same underlying problem despite different tone or vocabulary.

Only align across sources; never align two clusters from the same source.

Clusters by source:
{clusters_by_source}

Output a JSON array (empty if nothing aligns):
[
    {
        "aligned_problem_id": "AP_01",
        "sources": ["reddit", "hn_ask"],
        "core_problem": "the shared underlying problem",
        "why_they_look_different": "why the communities phrase it differently",
        "evidence": [
            {"source": "reddit", "quote": "short supporting quote"}
        ],
        "cluster_names": ["names of the aligned clusters"]
    }
]"#;

/// The "brutally practical" opportunity prompt.
pub const OPPORTUNITY_PROMPT: &str = r#"You advise a one-person founder looking for a narrow micro-tool to build. Be brutally practical; prefer boring, buildable ideas.

A group of {size} users share this difficulty:
{summary}

Representative problems:
{problems}

Current workarounds:
{workarounds}

Tools already in use: {tools}
Communities: {communities}
Average frequency score (1-10): {avg_frequency}

Output JSON:
{
    "current_tools": ["tools these users already rely on"],
    "missing_capability": "what no current tool does",
    "why_existing_fail": "why existing tools do not solve it",
    "opportunity": {
        "name": "short product name",
        "description": "what the micro-tool does, 1-2 sentences",
        "target_users": "who pays for it",
        "pain_frequency": 1 to 10,
        "market_size": 1 to 10,
        "mvp_complexity": 1 to 10 (lower is better),
        "competition_risk": 1 to 10 (lower is better),
        "integration_complexity": 1 to 10 (lower is better)
    }
}"#;

/// Viability rubric prompt.
pub const SCORE_PROMPT: &str = r#"Score this micro-tool opportunity for a solo founder. Be skeptical.

Opportunity: {name}
Description: {description}
Target users: {target_users}
Missing capability: {missing_capability}
Cluster size: {cluster_size} similar complaints

Score each 0-10:
- pain_frequency: how often the pain recurs
- clear_buyer: how obvious the paying customer is
- mvp_buildable: how feasible a 2-4 week MVP is
- crowded_market: 10 means the market is empty, 0 means saturated
- integration: how easily it fits existing workflows

Output JSON:
{
    "pain_frequency": 0 to 10,
    "clear_buyer": 0 to 10,
    "mvp_buildable": 0 to 10,
    "crowded_market": 0 to 10,
    "integration": 0 to 10,
    "total_score": 0.0 to 10.0,
    "killer_risks": ["1-3 risks that could kill this"]
}"#;

/// Shortlist phrasing prompt (small model).
pub const SHORTLIST_CONTENT_PROMPT: &str = r#"Write three short strings for a decision shortlist entry.

Opportunity: {name}
Description: {description}
Communities: {communities}
Core pain: {pain}

Rules:
- "problem": at most 200 characters, shaped like "Users in ... struggle with ... because ..."
- "mvp": at most 150 characters, shaped like "A minimal tool that ..."
- "why_now": at most 150 characters, one concrete signal this is timely

Output JSON:
{
    "problem": "...",
    "mvp": "...",
    "why_now": "..."
}"#;

/// Substitute `{name}` placeholders in a prompt template.
pub fn fill(template: &str, pairs: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in pairs {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// Format the extraction prompt for a post, optionally comment-aware.
pub fn format_extract_prompt(
    post: &Post,
    comments: &[Comment],
    truncate_chars: usize,
) -> String {
    let base = [
        ("source", post.source.clone()),
        ("score", post.score.to_string()),
        ("num_comments", post.num_comments.to_string()),
        ("title", post.title.clone()),
        ("body", post.body.clone()),
    ];

    if comments.is_empty() {
        fill(EXTRACT_PROMPT, &base)
    } else {
        let rendered = comments
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. {}", i + 1, truncate_ellipsis(&c.body, truncate_chars)))
            .collect::<Vec<_>>()
            .join("\n");
        let mut pairs = base.to_vec();
        pairs.push(("comments", rendered));
        fill(EXTRACT_WITH_COMMENTS_PROMPT, &pairs)
    }
}

/// Render events as a numbered list for cluster prompts.
pub fn format_event_list(problems: &[String]) -> String {
    problems
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}. {}", i + 1, p))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format the alignment prompt from clusters grouped by source.
pub fn format_align_prompt(clusters_by_source: &[(String, Vec<&Cluster>)]) -> String {
    let rendered = clusters_by_source
        .iter()
        .map(|(source, clusters)| {
            let lines = clusters
                .iter()
                .map(|c| format!("  - {}", c.prompt_summary()))
                .collect::<Vec<_>>()
                .join("\n");
            format!("{}:\n{}", source, lines)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    fill(ALIGN_PROMPT, &[("clusters_by_source", rendered)])
}

/// Truncate to `max_chars`, appending an ellipsis marker when cut.
pub fn truncate_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Hash of a prompt template, for cache invalidation keys.
pub fn prompt_hash(template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn fill_replaces_named_placeholders() {
        let out = fill("a {x} b {y}", &[("x", "1".into()), ("y", "2".into())]);
        assert_eq!(out, "a 1 b 2");
    }

    #[test]
    fn extract_prompt_switches_on_comments() {
        let post = testing::post_builder("reddit", "p1").build();
        let plain = format_extract_prompt(&post, &[], 500);
        assert!(!plain.contains("evidence_sources"));

        let fetched = testing::fetched_post("reddit", "p1", 2);
        let aware = format_extract_prompt(&fetched.post, &fetched.comments, 500);
        assert!(aware.contains("evidence_sources"));
        assert!(aware.contains("1. Same here"));
    }

    #[test]
    fn comments_are_truncated_with_marker() {
        assert_eq!(truncate_ellipsis("abcdef", 3), "abc...");
        assert_eq!(truncate_ellipsis("abc", 3), "abc");
    }

    #[test]
    fn prompt_hash_is_stable() {
        assert_eq!(prompt_hash("x"), prompt_hash("x"));
        assert_ne!(prompt_hash("x"), prompt_hash("y"));
    }
}
