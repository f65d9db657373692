//! Testing utilities including mock implementations.
//!
//! Useful for exercising the pipeline without real LLM or network
//! calls. The mock AI returns scripted JSON keyed by prompt substrings
//! and deterministic sha-derived embeddings, so clustering behavior is
//! reproducible across runs.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::error::{Result, SourceResult};
use crate::traits::ai::{Ai, ModelRole};
use crate::traits::source::{CommunitySource, FetchOutcome};
use crate::types::{
    AlignedProblem, AlignmentEvidence, AlignmentStatus, Cluster, Comment, FetchedPost,
    FilterReason, FilteredPost, Opportunity, PainEvent, Post, SourceConfig,
};

/// Record of a call made to the mock AI.
#[derive(Debug, Clone)]
pub struct MockAiCall {
    pub role: ModelRole,
    pub user_prompt: String,
}

/// A scripted AI implementation for tests.
///
/// Chat responses are selected by the first registered prompt
/// substring that matches; otherwise the default response, otherwise
/// `{}`. Embeddings are deterministic functions of the input text
/// unless overridden.
#[derive(Default)]
pub struct MockAi {
    responses: Arc<RwLock<Vec<(String, String)>>>,
    default_response: Arc<RwLock<Option<String>>>,
    embeddings: Arc<RwLock<HashMap<String, Vec<f32>>>>,
    embedding_dim: usize,
    calls: Arc<RwLock<Vec<MockAiCall>>>,
}

impl MockAi {
    pub fn new() -> Self {
        Self {
            embedding_dim: 8,
            ..Default::default()
        }
    }

    /// Respond with `json` whenever the user prompt contains `needle`.
    pub fn with_response(self, needle: impl Into<String>, json: impl Into<String>) -> Self {
        self.responses
            .write()
            .unwrap()
            .push((needle.into(), json.into()));
        self
    }

    /// Response used when no substring matches.
    pub fn with_default_response(self, json: impl Into<String>) -> Self {
        *self.default_response.write().unwrap() = Some(json.into());
        self
    }

    /// Override the embedding for an exact input text.
    pub fn with_embedding(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.embeddings.write().unwrap().insert(text.into(), vector);
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    /// All calls made to this mock.
    pub fn calls(&self) -> Vec<MockAiCall> {
        self.calls.read().unwrap().clone()
    }

    fn deterministic_embedding(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();
        (0..self.embedding_dim)
            .map(|i| {
                let byte = hash[i % 32] as f32;
                (byte / 127.5) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl Ai for MockAi {
    async fn chat_json(&self, role: ModelRole, _system: &str, user: &str) -> Result<String> {
        self.calls.write().unwrap().push(MockAiCall {
            role,
            user_prompt: user.to_string(),
        });

        let responses = self.responses.read().unwrap();
        for (needle, response) in responses.iter() {
            if user.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self
            .default_response
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "{}".to_string()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(vector) = self.embeddings.read().unwrap().get(text) {
            return Ok(vector.clone());
        }
        Ok(self.deterministic_embedding(text))
    }

    fn embedding_model(&self) -> &str {
        "mock-embedding"
    }
}

/// A source that serves a fixed set of posts.
#[derive(Default)]
pub struct MockSource {
    name: String,
    posts: Vec<FetchedPost>,
}

impl MockSource {
    pub fn new(name: impl Into<String>, posts: Vec<FetchedPost>) -> Self {
        Self {
            name: name.into(),
            posts,
        }
    }
}

#[async_trait]
impl CommunitySource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        _config: &SourceConfig,
        seen: &HashSet<String>,
    ) -> SourceResult<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        for fetched in &self.posts {
            if seen.contains(&fetched.post.id) {
                outcome.skipped += 1;
            } else {
                outcome.posts.push(fetched.clone());
            }
        }
        Ok(outcome)
    }
}

// Builders for domain values used across stage tests.

/// Builder for test posts.
pub struct PostBuilder {
    post: Post,
}

impl PostBuilder {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.post.title = title.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.post.body = body.into();
        self
    }

    pub fn score(mut self, score: i64) -> Self {
        self.post.score = score;
        self
    }

    pub fn num_comments(mut self, n: i64) -> Self {
        self.post.num_comments = n;
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.post.author = author.into();
        self
    }

    pub fn subreddit(mut self, subreddit: impl Into<String>) -> Self {
        self.post.platform_data["subreddit"] = serde_json::Value::String(subreddit.into());
        self
    }

    pub fn upvote_ratio(mut self, ratio: f32) -> Self {
        self.post.platform_data["upvote_ratio"] = serde_json::json!(ratio);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.post.created_at = at;
        self
    }

    pub fn build(self) -> Post {
        self.post
    }
}

/// Start building a post with sensible defaults.
pub fn post_builder(source: &str, source_id: &str) -> PostBuilder {
    let offset = source_id.bytes().map(|b| b as i64).sum::<i64>();
    PostBuilder {
        post: Post {
            id: Post::make_id(source, source_id),
            source: source.to_string(),
            source_id: source_id.to_string(),
            title: format!("Post {}", source_id),
            body: "I waste hours every week on this manual process and it is frustrating."
                .to_string(),
            url: format!("https://example.com/{}", source_id),
            platform_data: serde_json::json!({
                "subreddit": "excel",
                "upvote_ratio": 0.9,
            }),
            score: 50,
            num_comments: 10,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(offset),
            author: format!("author_{}", source_id),
            category: "productivity".to_string(),
            raw: serde_json::json!({"id": source_id}),
        },
    }
}

/// A fetched post with `comment_count` attached comments.
pub fn fetched_post(source: &str, source_id: &str, comment_count: usize) -> FetchedPost {
    let post = post_builder(source, source_id).build();
    let comments = (0..comment_count)
        .map(|i| Comment {
            id: None,
            post_id: post.id.clone(),
            source: source.to_string(),
            source_comment_id: format!("{}_{}", source_id, i),
            author: format!("commenter_{}", i),
            body: format!("Same here, this breaks for me too ({})", i),
            score: 10 - i as i64,
            created_at: post.created_at,
        })
        .collect();
    FetchedPost { post, comments }
}

/// A passed filter row for a post.
pub fn filtered_post(post_id: &str, pain_score: f32) -> FilteredPost {
    FilteredPost {
        post_id: post_id.to_string(),
        pain_score,
        matched_keywords: vec!["frustrating".into(), "manual process".into()],
        matched_patterns: vec!["every week".into()],
        emotional_intensity: 0.4,
        filter_reason: FilterReason {
            passed: true,
            failed_gate: None,
            keyword_score: 0.5,
            pattern_score: 0.5,
            emotional_intensity: 0.4,
            quality_base: 0.6,
            post_type: "general".into(),
        },
    }
}

/// A valid pain event for a post.
pub fn pain_event(post_id: &str, problem: &str) -> PainEvent {
    PainEvent {
        id: None,
        post_id: post_id.to_string(),
        actor: "spreadsheet user".into(),
        context: "monthly reporting".into(),
        problem: problem.to_string(),
        current_workaround: Some("exporting in small batches".into()),
        frequency: Some("weekly".into()),
        emotional_signal: Some("frustrated".into()),
        mentioned_tools: vec!["excel".into()],
        confidence: 0.8,
        evidence_sources: vec![crate::types::EvidenceSource::Post],
        pain_types: vec![crate::types::PainType::Workflow],
        primary_pain_type: Some(crate::types::PainType::Workflow),
        frequency_score: 8,
        post_title: "Excel pain".into(),
        post_category: "productivity".into(),
        post_pain_score: 0.6,
    }
}

/// A persisted-shape cluster over the given event ids.
pub fn cluster(id: &str, source: &str, event_ids: &[i64]) -> Cluster {
    Cluster {
        id: id.to_string(),
        name: format!("{} workflow", id),
        source_type: source.to_string(),
        centroid_summary: "exports keep breaking during reporting".into(),
        common_pain: "unreliable exports".into(),
        common_context: "recurring reporting work".into(),
        example_events: vec!["exports crash on big files".into()],
        coherence_score: 0.8,
        pain_event_ids: event_ids.iter().copied().collect(),
        size: event_ids.len(),
        workflow_confidence: 0.8,
        alignment_status: AlignmentStatus::Unprocessed,
        aligned_problem_id: None,
        created_at: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
    }
}

/// An aligned problem spanning the given sources.
pub fn aligned_problem(id: &str, sources: &[&str]) -> AlignedProblem {
    AlignedProblem {
        id: id.to_string(),
        sources: sources.iter().map(|s| s.to_string()).collect(),
        core_problem: "deployment pipelines are error-prone".into(),
        why_they_look_different: "different vocabulary per community".into(),
        evidence: sources
            .iter()
            .map(|s| AlignmentEvidence {
                source: s.to_string(),
                quote: format!("quote from {}", s),
            })
            .collect(),
        cluster_ids: sources.iter().map(|s| format!("{}_00", s)).collect(),
        created_at: Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap(),
    }
}

/// A mapped (not yet rescored) opportunity for a cluster.
pub fn opportunity(cluster_id: &str, name: &str) -> Opportunity {
    Opportunity {
        id: None,
        cluster_id: cluster_id.to_string(),
        source_type: "reddit".into(),
        name: name.to_string(),
        description: "A small tool that fixes broken exports".into(),
        target_users: "analysts living in spreadsheets".into(),
        current_tools: vec!["excel".into()],
        missing_capability: "resumable exports".into(),
        why_existing_fail: "built for small sheets".into(),
        pain_frequency: 8.0,
        market_size: 7.0,
        mvp_complexity: 4.0,
        competition_risk: 5.0,
        integration_complexity: 5.0,
        total_score: 0.6,
        killer_risks: vec![],
        recommendation: String::new(),
    }
}
