//! Raw post and comment types shared by every source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A post pulled from a community source, normalized across platforms.
///
/// The synthetic `id` is always `"{source}_{source_id}"` so rows from
/// different platforms never collide. `raw` keeps the original payload
/// for backfills; it is never rewritten once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    /// Synthetic id: `"{source}_{source_id}"`
    pub id: String,

    /// Source name (e.g. "reddit", "hn_ask")
    pub source: String,

    /// Platform-native id
    pub source_id: String,

    pub title: String,
    pub body: String,
    pub url: String,

    /// Platform-specific extras (subreddit, upvote ratio, flair, ...)
    pub platform_data: serde_json::Value,

    /// Upvotes / points
    pub score: i64,
    pub num_comments: i64,
    pub created_at: DateTime<Utc>,
    pub author: String,

    /// Configured category this post was fetched under
    pub category: String,

    /// Original payload, retained immutably for backfill
    pub raw: serde_json::Value,
}

impl Post {
    /// Build the synthetic id for a source/source_id pair.
    pub fn make_id(source: &str, source_id: &str) -> String {
        format!("{}_{}", source, source_id)
    }

    /// Subreddit if this post carries one in platform data.
    pub fn subreddit(&self) -> Option<&str> {
        self.platform_data.get("subreddit").and_then(|v| v.as_str())
    }

    /// Upvote ratio if the platform provides one (Reddit does).
    pub fn upvote_ratio(&self) -> Option<f32> {
        self.platform_data
            .get("upvote_ratio")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
    }

    /// Title and body joined for text analysis.
    pub fn full_text(&self) -> String {
        if self.body.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.body)
        }
    }
}

/// A top-level comment attached to a post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    /// Database id (None until stored)
    pub id: Option<i64>,
    pub post_id: String,
    pub source: String,
    pub source_comment_id: String,
    pub author: String,
    pub body: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

/// A post together with its fetched comments, as returned by a source.
#[derive(Debug, Clone)]
pub struct FetchedPost {
    pub post: Post,
    pub comments: Vec<Comment>,
}

/// Why a post passed or failed the signal filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterReason {
    pub passed: bool,
    /// Gate that rejected the post, if any
    pub failed_gate: Option<String>,
    pub keyword_score: f32,
    pub pattern_score: f32,
    pub emotional_intensity: f32,
    pub quality_base: f32,
    /// Post type the thresholds were taken from
    pub post_type: String,
}

/// A post that passed the signal filter, with its deterministic score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredPost {
    /// Same id as the originating post
    pub post_id: String,
    /// Composite pain score in [0,1]
    pub pain_score: f32,
    pub matched_keywords: Vec<String>,
    pub matched_patterns: Vec<String>,
    pub emotional_intensity: f32,
    pub filter_reason: FilterReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_id_format() {
        assert_eq!(Post::make_id("reddit", "abc123"), "reddit_abc123");
    }

    #[test]
    fn full_text_skips_empty_body() {
        let post = crate::testing::post_builder("reddit", "p1")
            .title("Just a title")
            .body("")
            .build();
        assert_eq!(post.full_text(), "Just a title");
    }
}
