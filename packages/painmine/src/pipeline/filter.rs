//! Signal filter stage - the rule-based gate in front of the LLM.
//!
//! A cold-blooded gate: every check is deterministic from the post and
//! the config, so re-running it over unchanged posts reproduces the
//! same outcome. Only passed posts get a `filtered_posts` row; the
//! stats record which gate rejected everything else.

use regex::Regex;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{MinerError, Result};
use crate::traits::store::{FilterStore, PostStore};
use crate::types::{FilterConfig, FilterReason, FilterStats, FilteredPost, Post};

/// Composite score a post must reach to pass.
pub const PASS_THRESHOLD: f32 = 0.3;

/// Filter with its regex lists compiled once per run.
pub struct SignalFilter {
    config: FilterConfig,
    exclusions: Vec<Regex>,
    required: Vec<Regex>,
    strong: Vec<Regex>,
}

/// Everything the filter computed for one post.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub passed: bool,
    pub failed_gate: Option<String>,
    pub pain_score: f32,
    pub matched_keywords: Vec<String>,
    pub matched_patterns: Vec<String>,
    pub keyword_score: f32,
    pub pattern_score: f32,
    pub emotional_intensity: f32,
    pub quality_base: f32,
    pub post_type: String,
}

impl Evaluation {
    fn rejected(gate: &str) -> Self {
        Self {
            passed: false,
            failed_gate: Some(gate.to_string()),
            pain_score: 0.0,
            matched_keywords: vec![],
            matched_patterns: vec![],
            keyword_score: 0.0,
            pattern_score: 0.0,
            emotional_intensity: 0.0,
            quality_base: 0.0,
            post_type: "general".into(),
        }
    }

    fn into_filtered(self, post_id: &str) -> FilteredPost {
        FilteredPost {
            post_id: post_id.to_string(),
            pain_score: self.pain_score,
            matched_keywords: self.matched_keywords.clone(),
            matched_patterns: self.matched_patterns.clone(),
            emotional_intensity: self.emotional_intensity,
            filter_reason: FilterReason {
                passed: self.passed,
                failed_gate: self.failed_gate,
                keyword_score: self.keyword_score,
                pattern_score: self.pattern_score,
                emotional_intensity: self.emotional_intensity,
                quality_base: self.quality_base,
                post_type: self.post_type,
            },
        }
    }
}

impl SignalFilter {
    pub fn new(config: FilterConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).map_err(|e| MinerError::config(format!("bad pattern {p:?}: {e}"))))
                .collect()
        };
        Ok(Self {
            exclusions: compile(&config.exclusion_patterns)?,
            required: compile(&config.required_patterns)?,
            strong: compile(&config.strong_patterns)?,
            config,
        })
    }

    /// Run every gate over one post.
    pub fn evaluate(&self, post: &Post) -> Evaluation {
        let config = &self.config;
        let text = post.full_text();
        let lower = text.to_lowercase();
        let length = lower.chars().count();

        // 1. Quality gate
        let ratio = post.upvote_ratio().unwrap_or(1.0);
        if post.score < config.min_upvotes
            || post.num_comments < config.min_comments
            || ratio < config.min_upvote_ratio
            || length < config.min_text_length
            || length > config.max_text_length
        {
            return Evaluation::rejected("quality");
        }

        // 2. Exclusion gate
        if self.exclusions.iter().any(|re| re.is_match(&text)) {
            return Evaluation::rejected("exclusion");
        }

        // 3. Weighted keyword score
        let mut matched_keywords = Vec::new();
        let mut weighted_hits = 0.0f32;
        for (category, keywords) in &config.keywords {
            let weight = config.keyword_weights.get(category).copied().unwrap_or(0.7);
            for keyword in keywords {
                let hits = lower.matches(keyword.as_str()).count();
                if hits > 0 {
                    matched_keywords.push(keyword.clone());
                    weighted_hits += weight * hits as f32;
                }
            }
        }
        let keyword_score = (weighted_hits / config.keyword_norm).min(1.0);

        // 4. Pain patterns
        let matched_required: Vec<String> = self
            .required
            .iter()
            .filter(|re| re.is_match(&text))
            .map(|re| re.as_str().to_string())
            .collect();
        let matched_strong: Vec<String> = self
            .strong
            .iter()
            .filter(|re| re.is_match(&text))
            .map(|re| re.as_str().to_string())
            .collect();
        if matched_required.len() < config.min_required
            || matched_strong.len() < config.min_strong
        {
            return Evaluation::rejected("patterns");
        }
        let pattern_score =
            ((matched_required.len() + matched_strong.len()) as f32 / config.pattern_norm).min(1.0);
        let matched_patterns: Vec<String> = matched_required
            .into_iter()
            .chain(matched_strong)
            .collect();

        // 6. Emotional intensity over a ~100-word denominator
        let emotional_intensity = emotional_intensity(&lower, config);

        // 7. Type-specific thresholds
        let post_type = classify_post_type(post, config);
        if let Some(thresholds) = config.type_thresholds.get(&post_type) {
            if keyword_score < thresholds.min_keyword_score
                || emotional_intensity < thresholds.min_emotion
            {
                return Evaluation {
                    post_type,
                    ..Evaluation::rejected("type_threshold")
                };
            }
        }

        // 8. Composite
        let quality_base = quality_base(post, ratio, length);
        let pain_score = (0.4 * keyword_score
            + 0.3 * pattern_score
            + 0.2 * emotional_intensity
            + 0.1 * quality_base)
            .clamp(0.0, 1.0);

        // 9. Pass rule
        let passed = matched_keywords.len() >= config.min_keyword_matches
            && emotional_intensity >= config.min_emotional_intensity
            && pain_score >= PASS_THRESHOLD;

        let failed_gate = if passed {
            None
        } else if matched_keywords.len() < config.min_keyword_matches {
            Some("keywords".to_string())
        } else if emotional_intensity < config.min_emotional_intensity {
            Some("emotion".to_string())
        } else {
            Some("composite".to_string())
        };

        Evaluation {
            passed,
            failed_gate,
            pain_score,
            matched_keywords,
            matched_patterns,
            keyword_score,
            pattern_score,
            emotional_intensity,
            quality_base,
            post_type,
        }
    }
}

/// Base quality from engagement and length, in [0,1].
fn quality_base(post: &Post, ratio: f32, length: usize) -> f32 {
    0.4 * (post.score as f32 / 100.0).min(1.0)
        + 0.3 * (post.num_comments as f32 / 50.0).min(1.0)
        + 0.2 * ratio
        + 0.1 * (length as f32 / 1000.0).min(1.0)
}

/// Weighted emotion hits over post length (~100-word denominator).
fn emotional_intensity(lower: &str, config: &FilterConfig) -> f32 {
    let hits = |words: &[String], weight: f32| -> f32 {
        words
            .iter()
            .map(|w| lower.matches(w.as_str()).count() as f32 * weight)
            .sum()
    };
    let weighted = hits(&config.high_intensity_words, 1.0)
        + hits(&config.medium_intensity_words, 0.6)
        + hits(&config.low_intensity_words, 0.3);

    let words = lower.split_whitespace().count();
    let denominator = (words as f32 / 100.0).max(1.0);
    (weighted / denominator).clamp(0.0, 1.0)
}

/// Pick a post type from subreddit hints and the comment-to-score ratio.
fn classify_post_type(post: &Post, config: &FilterConfig) -> String {
    if let Some(subreddit) = post.subreddit() {
        let lower = subreddit.to_lowercase();
        if config.technical_hints.iter().any(|h| lower.contains(h.as_str())) {
            return "technical".into();
        }
        if config.business_hints.iter().any(|h| lower.contains(h.as_str())) {
            return "business".into();
        }
    }
    // Heavily discussed relative to score reads as a discussion thread
    if post.score > 0 && post.num_comments as f32 / post.score as f32 > 1.0 {
        return "discussion".into();
    }
    "general".into()
}

/// Run the filter over all posts the gate has not examined yet.
pub async fn run_filter<S>(store: &S, config: &FilterConfig, limit: usize) -> Result<FilterStats>
where
    S: PostStore + FilterStore,
{
    let started = Instant::now();
    let filter = SignalFilter::new(config.clone())?;
    let posts = store.unfiltered_posts(limit).await?;

    let mut stats = FilterStats {
        examined: posts.len(),
        ..FilterStats::default()
    };
    let mut score_sum = 0.0f32;

    for post in &posts {
        let evaluation = filter.evaluate(post);
        if evaluation.passed {
            score_sum += evaluation.pain_score;
            let filtered = evaluation.into_filtered(&post.id);
            if let Err(err) = store.upsert_filtered(&filtered).await {
                warn!(post = %post.id, "filtered insert failed: {err}");
                *stats.rejected_by.entry("storage".into()).or_default() += 1;
                continue;
            }
            stats.passed += 1;
        } else {
            let gate = evaluation
                .failed_gate
                .unwrap_or_else(|| "composite".to_string());
            *stats.rejected_by.entry(gate).or_default() += 1;
        }
    }

    stats.avg_pain_score = if stats.passed > 0 {
        score_sum / stats.passed as f32
    } else {
        0.0
    };
    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        examined = stats.examined,
        passed = stats.passed,
        pass_rate = stats.pass_rate(),
        "filter complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::post_builder;

    fn filter() -> SignalFilter {
        SignalFilter::new(FilterConfig::default()).unwrap()
    }

    fn painful_post() -> Post {
        post_builder("reddit", "p1")
            .title("Excel macros crash every export")
            .body(
                "I hate this. Every week I spend hours fixing the export because the \
                 macro fails on large sheets. It is a frustrating, tedious manual process \
                 and I have tried everything; there is no good tool for it. My team copies \
                 data by hand into a second workbook just to get the report out.",
            )
            .score(120)
            .num_comments(45)
            .build()
    }

    #[test]
    fn pain_heavy_post_passes_with_bounded_score() {
        let evaluation = filter().evaluate(&painful_post());
        assert!(evaluation.passed, "failed gate: {:?}", evaluation.failed_gate);
        assert!(evaluation.pain_score >= PASS_THRESHOLD);
        assert!(evaluation.pain_score <= 1.0);
        assert!(evaluation
            .matched_keywords
            .iter()
            .any(|k| k == "frustrating"));
    }

    #[test]
    fn low_engagement_posts_fail_quality() {
        let post = post_builder("reddit", "p2")
            .score(1)
            .num_comments(0)
            .build();
        let evaluation = filter().evaluate(&post);
        assert!(!evaluation.passed);
        assert_eq!(evaluation.failed_gate.as_deref(), Some("quality"));
    }

    #[test]
    fn promotional_posts_are_excluded() {
        let post = post_builder("reddit", "p3")
            .body(
                "Check out my new tool, use discount code SAVE20 at checkout! It solves \
                 all the frustrating manual process problems you have every week, I promise.",
            )
            .score(50)
            .num_comments(10)
            .build();
        let evaluation = filter().evaluate(&post);
        assert_eq!(evaluation.failed_gate.as_deref(), Some("exclusion"));
    }

    #[test]
    fn neutral_posts_fail_on_patterns_or_keywords() {
        let post = post_builder("reddit", "p4")
            .title("Sharing my spreadsheet setup")
            .body(
                "Here is how my dashboard is organized. The layout uses three sheets and \
                 a pivot table; colors mark the quarters. Layout took a while to settle. \
                 Happy to answer questions about the structure and formatting choices.",
            )
            .score(40)
            .num_comments(12)
            .build();
        let evaluation = filter().evaluate(&post);
        assert!(!evaluation.passed);
    }

    #[test]
    fn discussion_type_comes_from_comment_ratio() {
        let post = post_builder("reddit", "p5")
            .subreddit("technology_talk")
            .score(10)
            .num_comments(40)
            .build();
        let config = FilterConfig::default();
        assert_eq!(classify_post_type(&post, &config), "discussion");

        let technical = post_builder("reddit", "p6").subreddit("devops").build();
        assert_eq!(classify_post_type(&technical, &config), "technical");
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        // A pathologically keyword-stuffed post must still clamp to 1.
        let post = post_builder("reddit", "p7")
            .body(
                "frustrating annoying painful hate tedious manual process copy paste \
                 every time i repetitive nightmare infuriating desperate waste of time \
                 takes forever so slow "
                    .repeat(20),
            )
            .score(500)
            .num_comments(200)
            .build();
        let evaluation = filter().evaluate(&post);
        assert!(evaluation.pain_score <= 1.0);
        assert!(evaluation.emotional_intensity <= 1.0);
        assert!(evaluation.keyword_score <= 1.0);
    }

    #[tokio::test]
    async fn rerun_over_examined_posts_is_a_no_op() {
        use crate::stores::SqliteStore;
        use crate::traits::store::PostStore;

        let store = SqliteStore::in_memory().await.unwrap();
        let fetched = crate::types::FetchedPost {
            post: painful_post(),
            comments: vec![],
        };
        store.insert_post(&fetched).await.unwrap();

        let first = run_filter(&store, &FilterConfig::default(), 100).await.unwrap();
        assert_eq!(first.examined, 1);
        assert_eq!(first.passed, 1);

        let second = run_filter(&store, &FilterConfig::default(), 100).await.unwrap();
        assert_eq!(second.examined, 0);
        assert_eq!(second.passed, 0);
    }
}
