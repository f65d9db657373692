//! Unauthenticated Hacker News client (Firebase JSON endpoints).
//!
//! Pulls the askstories, showstories and topstories id lists, looks
//! each item up, and admits stories whose title carries an Ask/Show
//! prefix or that have more than 10 descendants. Up to 10 top-level
//! comments are attached. The initial pain score is neutral; the
//! signal filter recomputes it from the text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SourceError, SourceResult};
use crate::traits::source::{CommunitySource, FetchOutcome};
use crate::types::{Comment, FetchedPost, Post, SourceConfig};

const API_BASE: &str = "https://hacker-news.firebaseio.com/v0";
const API_TIMEOUT: Duration = Duration::from_secs(10);
const STORY_LISTS: &[&str] = &["askstories", "showstories", "topstories"];
const MIN_DISCUSSION_DESCENDANTS: i64 = 10;
const NEUTRAL_PAIN_SCORE: f32 = 0.5;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Read-only Hacker News source.
pub struct HackerNewsSource {
    client: Client,
    limiter: Arc<DirectLimiter>,
}

impl HackerNewsSource {
    pub fn new(requests_per_second: u32) -> SourceResult<Self> {
        let client = Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Http(e.to_string().into()))?;
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        Ok(Self {
            client,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        })
    }

    async fn get_json(&self, url: &str) -> SourceResult<Value> {
        self.limiter.until_ready().await;
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout { what: url.into() }
            } else {
                SourceError::Http(e.to_string().into())
            }
        })?;

        if !response.status().is_success() {
            return Err(SourceError::Http(
                format!("{} from {}", response.status(), url).into(),
            ));
        }
        response.json().await.map_err(|e| SourceError::Malformed {
            source_name: "hackernews".into(),
            reason: e.to_string(),
        })
    }

    async fn item(&self, id: i64) -> SourceResult<Value> {
        self.get_json(&format!("{}/item/{}.json", API_BASE, id)).await
    }

    async fn story_ids(&self, max_per_list: usize) -> SourceResult<Vec<i64>> {
        let mut ids = Vec::new();
        let mut dedup = HashSet::new();
        for list in STORY_LISTS {
            let value = self.get_json(&format!("{}/{}.json", API_BASE, list)).await?;
            for id in value.as_array().into_iter().flatten().take(max_per_list) {
                if let Some(id) = id.as_i64() {
                    if dedup.insert(id) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Top-level comments, in kid order, up to `limit`.
    async fn comments(
        &self,
        story: &Value,
        post_id: &str,
        source_name: &str,
        limit: usize,
    ) -> Vec<Comment> {
        let kids: Vec<i64> = story["kids"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|k| k.as_i64())
            .take(limit)
            .collect();

        let mut comments = Vec::with_capacity(kids.len());
        for kid in kids {
            let item = match self.item(kid).await {
                Ok(item) => item,
                Err(err) => {
                    tracing::warn!(comment = kid, "comment lookup failed: {err}");
                    continue;
                }
            };
            if item["deleted"].as_bool().unwrap_or(false)
                || item["dead"].as_bool().unwrap_or(false)
            {
                continue;
            }
            let Some(body) = item["text"].as_str() else {
                continue;
            };
            comments.push(Comment {
                id: None,
                post_id: post_id.to_string(),
                source: source_name.to_string(),
                source_comment_id: kid.to_string(),
                author: item["by"].as_str().unwrap_or("[deleted]").to_string(),
                body: body.to_string(),
                score: item["score"].as_i64().unwrap_or(0),
                created_at: epoch_to_utc(item["time"].as_i64().unwrap_or(0)),
            });
        }
        comments
    }
}

/// Whether a story is worth storing: Ask/Show prefix or real discussion.
pub fn admits(title: &str, descendants: i64) -> bool {
    title.starts_with("Ask HN")
        || title.starts_with("Show HN")
        || descendants > MIN_DISCUSSION_DESCENDANTS
}

#[async_trait]
impl CommunitySource for HackerNewsSource {
    fn name(&self) -> &str {
        "hn_ask"
    }

    async fn fetch(
        &self,
        config: &SourceConfig,
        seen: &HashSet<String>,
    ) -> SourceResult<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        let ids = self.story_ids(config.max_results_per_method).await?;

        for story_id in ids {
            let id = Post::make_id(&config.name, &story_id.to_string());
            if seen.contains(&id) {
                outcome.skipped += 1;
                continue;
            }

            let story = match self.item(story_id).await {
                Ok(story) => story,
                Err(err) => {
                    tracing::warn!(story = story_id, "item lookup failed: {err}");
                    outcome.errors += 1;
                    continue;
                }
            };

            let title = story["title"].as_str().unwrap_or_default().to_string();
            let descendants = story["descendants"].as_i64().unwrap_or(0);
            if title.is_empty() || !admits(&title, descendants) {
                continue;
            }

            let score = story["score"].as_i64().unwrap_or(0);
            if score < config.min_score {
                continue;
            }

            let comments = self
                .comments(&story, &id, &config.name, config.max_comments)
                .await;

            let post = Post {
                id: id.clone(),
                source: config.name.clone(),
                source_id: story_id.to_string(),
                title,
                body: story["text"].as_str().unwrap_or_default().to_string(),
                url: story["url"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!("https://news.ycombinator.com/item?id={}", story_id)
                    }),
                platform_data: serde_json::json!({
                    "descendants": descendants,
                    "preliminary_pain_score": NEUTRAL_PAIN_SCORE,
                }),
                score,
                num_comments: descendants,
                created_at: epoch_to_utc(story["time"].as_i64().unwrap_or(0)),
                author: story["by"].as_str().unwrap_or("[deleted]").to_string(),
                category: config.category.clone(),
                raw: story,
            };

            outcome.posts.push(FetchedPost { post, comments });
        }
        Ok(outcome)
    }
}

fn epoch_to_utc(epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now)
}
