//! Authenticated read-only Reddit client.
//!
//! Consumes subreddit listings (hot / new / rising / controversial /
//! top-in-timeframe) and keyword search built from the configured
//! keyword families, paginating with `after` cursors up to the
//! configured per-method cap. Each admitted submission gets up to 20
//! top-level comments (by score) and a preliminary pain score; the
//! signal filter recomputes scores properly downstream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{SourceError, SourceResult};
use crate::traits::source::{CommunitySource, FetchOutcome};
use crate::types::{Comment, FetchMethod, FetchedPost, Post, SourceConfig};

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";
const API_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_SIZE: usize = 100;

/// Emotion words that earn a small per-hit bonus at ingest time.
const EMOTION_WORDS: &[&str] = &[
    "frustrating",
    "annoying",
    "hate",
    "painful",
    "nightmare",
    "desperate",
    "tedious",
];

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

struct OauthToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Credentialed Reddit source.
pub struct RedditSource {
    client: Client,
    client_id: String,
    client_secret: SecretString,
    user_agent: String,
    token: Arc<Mutex<OauthToken>>,
    limiter: Arc<DirectLimiter>,
}

impl RedditSource {
    /// Authenticate with the client-credentials grant.
    ///
    /// Fails fast: a bad credential pair is a configuration problem,
    /// not something to retry mid-run.
    pub async fn connect(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        user_agent: impl Into<String>,
        requests_per_second: u32,
    ) -> SourceResult<Self> {
        let client_id = client_id.into();
        let client_secret = SecretString::from(client_secret.into());
        let user_agent = user_agent.into();
        let client = Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Http(e.to_string().into()))?;

        let token = obtain_token(&client, &client_id, &client_secret, &user_agent).await?;

        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        Ok(Self {
            client,
            client_id,
            client_secret,
            user_agent,
            token: Arc::new(Mutex::new(token)),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        })
    }

    /// Connect from `REDDIT_CLIENT_ID`, `REDDIT_CLIENT_SECRET`,
    /// `REDDIT_USER_AGENT`.
    pub async fn from_env(requests_per_second: u32) -> SourceResult<Self> {
        let get = |name: &str| {
            std::env::var(name).map_err(|_| SourceError::Auth {
                source_name: "reddit".into(),
                reason: format!("{} not set", name),
            })
        };
        Self::connect(
            get("REDDIT_CLIENT_ID")?,
            get("REDDIT_CLIENT_SECRET")?,
            get("REDDIT_USER_AGENT")?,
            requests_per_second,
        )
        .await
    }

    async fn bearer(&self) -> SourceResult<String> {
        let mut token = self.token.lock().await;
        if token.expires_at <= Utc::now() {
            *token = obtain_token(
                &self.client,
                &self.client_id,
                &self.client_secret,
                &self.user_agent,
            )
            .await?;
        }
        Ok(token.access_token.clone())
    }

    async fn get_json(&self, url: &str) -> SourceResult<Value> {
        self.limiter.until_ready().await;
        let bearer = self.bearer().await?;
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", bearer))
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout { what: url.into() }
                } else {
                    SourceError::Http(e.to_string().into())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(SourceError::RateLimited {
                source_name: "reddit".into(),
                retry_after,
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::Auth {
                source_name: "reddit".into(),
                reason: format!("{} from {}", status, url),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Http(format!("{} from {}", status, url).into()));
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Malformed {
                source_name: "reddit".into(),
                reason: e.to_string(),
            })
    }

    /// Walk one listing endpoint with `after` pagination.
    async fn listing(&self, base_url: &str, max_results: usize) -> SourceResult<Vec<Value>> {
        let mut children = Vec::new();
        let mut after: Option<String> = None;

        while children.len() < max_results {
            let limit = PAGE_SIZE.min(max_results - children.len());
            let url = match &after {
                Some(cursor) => format!("{}&limit={}&after={}", base_url, limit, cursor),
                None => format!("{}&limit={}", base_url, limit),
            };
            let page = self.get_json(&url).await?;
            let data = &page["data"];
            let batch = data["children"].as_array().cloned().unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            children.extend(batch);
            after = match data["after"].as_str() {
                Some(cursor) if !cursor.is_empty() => Some(cursor.to_string()),
                _ => break,
            };
        }
        children.truncate(max_results);
        Ok(children)
    }

    /// Top-level comments for a submission, highest score first.
    async fn comments(
        &self,
        post_id: &str,
        source_name: &str,
        article: &str,
        limit: usize,
    ) -> SourceResult<Vec<Comment>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let url = format!("{}/comments/{}?sort=top&depth=1", API_BASE, article);
        let thread = self.get_json(&url).await?;
        let listing = thread
            .as_array()
            .and_then(|parts| parts.get(1))
            .map(|l| l["data"]["children"].clone())
            .unwrap_or(Value::Null);

        let mut comments: Vec<Comment> = listing
            .as_array()
            .into_iter()
            .flatten()
            .filter(|child| child["kind"] == "t1")
            .filter_map(|child| {
                let data = &child["data"];
                let body = data["body"].as_str()?;
                Some(Comment {
                    id: None,
                    post_id: post_id.to_string(),
                    source: source_name.to_string(),
                    source_comment_id: data["id"].as_str()?.to_string(),
                    author: data["author"].as_str().unwrap_or("[deleted]").to_string(),
                    body: body.to_string(),
                    score: data["score"].as_i64().unwrap_or(0),
                    created_at: epoch_to_utc(data["created_utc"].as_f64().unwrap_or(0.0)),
                })
            })
            .collect();

        comments.sort_by_key(|c| std::cmp::Reverse(c.score));
        comments.truncate(limit);
        Ok(comments)
    }

    fn method_url(subreddit: &str, method: FetchMethod, config: &SourceConfig) -> String {
        match method {
            FetchMethod::Hot => format!("{}/r/{}/hot.json?raw_json=1", API_BASE, subreddit),
            FetchMethod::New => format!("{}/r/{}/new.json?raw_json=1", API_BASE, subreddit),
            FetchMethod::Rising => format!("{}/r/{}/rising.json?raw_json=1", API_BASE, subreddit),
            FetchMethod::Controversial => format!(
                "{}/r/{}/controversial.json?raw_json=1",
                API_BASE, subreddit
            ),
            FetchMethod::Top => format!(
                "{}/r/{}/top.json?raw_json=1&t={}",
                API_BASE, subreddit, config.top_timeframe
            ),
            FetchMethod::KeywordSearch => format!(
                "{}/r/{}/search.json?raw_json=1&restrict_sr=1&q={}",
                API_BASE,
                subreddit,
                urlencode(&config.search_query())
            ),
        }
    }
}

#[async_trait]
impl CommunitySource for RedditSource {
    fn name(&self) -> &str {
        "reddit"
    }

    async fn fetch(
        &self,
        config: &SourceConfig,
        seen: &HashSet<String>,
    ) -> SourceResult<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        let mut batch_seen: HashSet<String> = HashSet::new();

        for subreddit in &config.communities {
            for method in &config.methods {
                let url = Self::method_url(subreddit, *method, config);
                let children = match self.listing(&url, config.max_results_per_method).await {
                    Ok(children) => children,
                    Err(SourceError::Auth { source_name, reason }) => {
                        return Err(SourceError::Auth { source_name, reason });
                    }
                    Err(err) => {
                        tracing::warn!(%subreddit, ?method, "listing failed: {err}");
                        outcome.errors += 1;
                        continue;
                    }
                };

                for child in children {
                    match self.admit(child, config, seen, &mut batch_seen).await {
                        Ok(Some(fetched)) => outcome.posts.push(fetched),
                        Ok(None) => outcome.skipped += 1,
                        Err(err) => {
                            tracing::warn!("submission dropped: {err}");
                            outcome.errors += 1;
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }
}

impl RedditSource {
    async fn admit(
        &self,
        child: Value,
        config: &SourceConfig,
        seen: &HashSet<String>,
        batch_seen: &mut HashSet<String>,
    ) -> SourceResult<Option<FetchedPost>> {
        let data = &child["data"];
        let source_id = data["id"]
            .as_str()
            .ok_or_else(|| SourceError::Malformed {
                source_name: "reddit".into(),
                reason: "submission without id".into(),
            })?
            .to_string();

        let id = Post::make_id(&config.name, &source_id);
        if seen.contains(&id) || !batch_seen.insert(id.clone()) {
            return Ok(None);
        }

        let score = data["score"].as_i64().unwrap_or(0);
        if score < config.min_score {
            return Ok(None);
        }

        let title = data["title"].as_str().unwrap_or_default().to_string();
        let body = data["selftext"].as_str().unwrap_or_default().to_string();
        let num_comments = data["num_comments"].as_i64().unwrap_or(0);
        let upvote_ratio = data["upvote_ratio"].as_f64().unwrap_or(0.5) as f32;
        let text = format!("{}\n\n{}", title, body);

        let preliminary = preliminary_pain_score(
            config,
            &text,
            score,
            num_comments,
            upvote_ratio,
        );

        let post = Post {
            id: id.clone(),
            source: config.name.clone(),
            source_id: source_id.clone(),
            title,
            body,
            url: format!(
                "https://reddit.com{}",
                data["permalink"].as_str().unwrap_or("/")
            ),
            platform_data: serde_json::json!({
                "subreddit": data["subreddit"].as_str().unwrap_or_default(),
                "upvote_ratio": upvote_ratio,
                "preliminary_pain_score": preliminary,
            }),
            score,
            num_comments,
            created_at: epoch_to_utc(data["created_utc"].as_f64().unwrap_or(0.0)),
            author: data["author"].as_str().unwrap_or("[deleted]").to_string(),
            category: config.category.clone(),
            raw: child.clone(),
        };

        let comments = self
            .comments(&id, &config.name, &source_id, config.max_comments)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(post = %id, "comment fetch failed: {err}");
                vec![]
            });

        Ok(Some(FetchedPost { post, comments }))
    }
}

/// Preliminary pain score at ingest time, clipped to [0,1].
///
/// Base quality from upvotes/comments/ratio/length, per-hit keyword
/// bonuses weighted by family, length bonuses at 200 and 500 chars,
/// and a small bonus per emotion word.
pub fn preliminary_pain_score(
    config: &SourceConfig,
    text: &str,
    score: i64,
    num_comments: i64,
    upvote_ratio: f32,
) -> f32 {
    let lower = text.to_lowercase();
    let len = lower.chars().count();

    let base = 0.4 * (score as f32 / 100.0).min(1.0)
        + 0.3 * (num_comments as f32 / 50.0).min(1.0)
        + 0.2 * upvote_ratio
        + 0.1 * (len as f32 / 1000.0).min(1.0);

    let mut pain = 0.25 * base;

    for (family, keywords) in &config.keyword_families {
        let weight = family_weight(family);
        let hits = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
        pain += 0.05 * weight * hits as f32;
    }

    if len >= 200 {
        pain += 0.05;
    }
    if len >= 500 {
        pain += 0.05;
    }

    let emotion_hits = EMOTION_WORDS
        .iter()
        .filter(|w| lower.contains(**w))
        .count();
    pain += 0.02 * emotion_hits as f32;

    pain.clamp(0.0, 1.0)
}

fn family_weight(family: &str) -> f32 {
    match family {
        "frustration" => 1.0,
        "workflow" => 0.9,
        "inefficiency" => 0.8,
        "complexity" => 0.7,
        "cost" => 0.6,
        _ => 0.7,
    }
}

async fn obtain_token(
    client: &Client,
    client_id: &str,
    client_secret: &SecretString,
    user_agent: &str,
) -> SourceResult<OauthToken> {
    let response = client
        .post(TOKEN_URL)
        .basic_auth(client_id, Some(client_secret.expose_secret()))
        .header("User-Agent", user_agent)
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .map_err(|e| SourceError::Auth {
            source_name: "reddit".into(),
            reason: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(SourceError::Auth {
            source_name: "reddit".into(),
            reason: format!("token endpoint returned {}", response.status()),
        });
    }

    let body: Value = response.json().await.map_err(|e| SourceError::Auth {
        source_name: "reddit".into(),
        reason: e.to_string(),
    })?;

    let access_token = body["access_token"]
        .as_str()
        .ok_or_else(|| SourceError::Auth {
            source_name: "reddit".into(),
            reason: "token response missing access_token".into(),
        })?
        .to_string();
    let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

    Ok(OauthToken {
        access_token,
        // Refresh a minute early
        expires_at: Utc::now() + chrono::Duration::seconds(expires_in - 60),
    })
}

fn epoch_to_utc(epoch: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch as i64, 0).unwrap_or_else(Utc::now)
}

fn urlencode(query: &str) -> String {
    query
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            ' ' => "+".to_string(),
            other => {
                let mut buf = [0u8; 4];
                other
                    .encode_utf8(&mut buf)
                    .bytes()
                    .map(|b| format!("%{:02X}", b))
                    .collect()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SourceConfig {
        SourceConfig::default()
    }

    #[test]
    fn preliminary_score_rewards_pain_language() {
        let plain = preliminary_pain_score(&config(), "a short neutral note", 10, 2, 0.8);
        let painful = preliminary_pain_score(
            &config(),
            &format!(
                "This manual process is so frustrating, I hate that every time I \
                 export I have to copy paste the whole sheet. {}",
                "More context here. ".repeat(30)
            ),
            10,
            2,
            0.8,
        );
        assert!(painful > plain);
        assert!((0.0..=1.0).contains(&painful));
    }

    #[test]
    fn preliminary_score_is_clipped() {
        let text = "frustrating annoying hate painful nightmare manual process copy paste "
            .repeat(40);
        let score = preliminary_pain_score(&config(), &text, 100_000, 10_000, 1.0);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn search_urls_quote_keywords() {
        let mut cfg = config();
        cfg.keyword_families.clear();
        cfg.keyword_families
            .insert("workflow".into(), vec!["copy paste".into()]);
        let url = RedditSource::method_url("excel", FetchMethod::KeywordSearch, &cfg);
        assert!(url.contains("q=%22copy+paste%22"));
        assert!(url.contains("restrict_sr=1"));
    }

    #[test]
    fn top_url_carries_timeframe() {
        let url = RedditSource::method_url("excel", FetchMethod::Top, &config());
        assert!(url.ends_with("t=week"));
    }
}
