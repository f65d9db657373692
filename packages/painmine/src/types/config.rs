//! Configuration types for every pipeline stage.
//!
//! These are plain serde structs with conservative defaults; loading
//! them from a file is the caller's concern. The keyword families,
//! pattern lists, reputation tables and clustering knobs are policy
//! inputs, not code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fetch methods a source can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Hot,
    New,
    Rising,
    Controversial,
    Top,
    KeywordSearch,
}

/// Configuration for one community source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name ("reddit", "hn_ask", ...)
    pub name: String,
    /// Category label stamped onto fetched posts
    pub category: String,
    /// Subreddits (reddit) or ignored (hn)
    pub communities: Vec<String>,
    pub methods: Vec<FetchMethod>,
    /// Timeframe for `Top` ("day", "week", "month", ...)
    pub top_timeframe: String,
    pub max_results_per_method: usize,
    /// Top-level comments to attach per post
    pub max_comments: usize,
    /// Posts below this score are not even stored
    pub min_score: i64,
    /// Keyword families used to build search queries, keyed by category
    pub keyword_families: HashMap<String, Vec<String>>,
    /// Requests per second against the community API
    pub requests_per_second: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        let mut keyword_families = HashMap::new();
        keyword_families.insert(
            "frustration".to_string(),
            vec![
                "frustrating".into(),
                "annoying".into(),
                "hate when".into(),
                "drives me crazy".into(),
            ],
        );
        keyword_families.insert(
            "workflow".to_string(),
            vec![
                "manual process".into(),
                "copy paste".into(),
                "every time I".into(),
                "workflow".into(),
            ],
        );
        Self {
            name: "reddit".into(),
            category: "general".into(),
            communities: vec![],
            methods: vec![FetchMethod::Hot, FetchMethod::New, FetchMethod::Top],
            top_timeframe: "week".into(),
            max_results_per_method: 100,
            max_comments: 20,
            min_score: 1,
            keyword_families,
            requests_per_second: 1,
        }
    }
}

impl SourceConfig {
    /// OR-joined quoted query built from all keyword families.
    pub fn search_query(&self) -> String {
        self.keyword_families
            .values()
            .flatten()
            .map(|k| format!("\"{}\"", k))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

/// Per-post-type minimum thresholds for the signal filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeThresholds {
    pub min_keyword_score: f32,
    pub min_emotion: f32,
}

/// Signal filter knobs: gates, keyword weights, pattern lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub min_upvotes: i64,
    pub min_comments: i64,
    pub min_upvote_ratio: f32,
    pub min_text_length: usize,
    pub max_text_length: usize,

    /// Regex families that disqualify a post outright
    pub exclusion_patterns: Vec<String>,

    /// Pain keywords by category; categories carry fixed weights
    pub keywords: HashMap<String, Vec<String>>,
    /// Weight per keyword category
    pub keyword_weights: HashMap<String, f32>,
    /// Weighted keyword hits are divided by this before clamping to 1
    pub keyword_norm: f32,

    /// Patterns a pain-bearing post must show at least `min_required` of
    pub required_patterns: Vec<String>,
    pub min_required: usize,
    /// Strong signals; at least `min_strong` expected
    pub strong_patterns: Vec<String>,
    pub min_strong: usize,
    /// Required + strong hits are divided by this before clamping to 1
    pub pattern_norm: f32,

    pub high_intensity_words: Vec<String>,
    pub medium_intensity_words: Vec<String>,
    pub low_intensity_words: Vec<String>,

    /// Minimum keyword hit count to pass
    pub min_keyword_matches: usize,
    /// Minimum emotional intensity to pass
    pub min_emotional_intensity: f32,

    /// Subreddit substrings hinting each post type
    pub technical_hints: Vec<String>,
    pub business_hints: Vec<String>,
    /// Thresholds per post type (technical / business / discussion / general)
    pub type_thresholds: HashMap<String, TypeThresholds>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let mut keywords = HashMap::new();
        keywords.insert(
            "frustration".to_string(),
            vec![
                "frustrating".into(),
                "annoying".into(),
                "painful".into(),
                "hate".into(),
                "drives me crazy".into(),
                "sick of".into(),
            ],
        );
        keywords.insert(
            "inefficiency".to_string(),
            vec![
                "waste of time".into(),
                "takes forever".into(),
                "so slow".into(),
                "hours every".into(),
                "tedious".into(),
            ],
        );
        keywords.insert(
            "complexity".to_string(),
            vec![
                "complicated".into(),
                "confusing".into(),
                "can't figure out".into(),
                "too many steps".into(),
            ],
        );
        keywords.insert(
            "workflow".to_string(),
            vec![
                "manual process".into(),
                "copy paste".into(),
                "every time i".into(),
                "over and over".into(),
                "repetitive".into(),
            ],
        );
        keywords.insert(
            "cost".to_string(),
            vec![
                "too expensive".into(),
                "can't afford".into(),
                "pricing".into(),
                "overpriced".into(),
            ],
        );

        let mut keyword_weights = HashMap::new();
        keyword_weights.insert("frustration".to_string(), 1.0);
        keyword_weights.insert("inefficiency".to_string(), 0.8);
        keyword_weights.insert("complexity".to_string(), 0.7);
        keyword_weights.insert("workflow".to_string(), 0.9);
        keyword_weights.insert("cost".to_string(), 0.6);

        let mut type_thresholds = HashMap::new();
        type_thresholds.insert(
            "technical".to_string(),
            TypeThresholds {
                min_keyword_score: 0.15,
                min_emotion: 0.05,
            },
        );
        type_thresholds.insert(
            "business".to_string(),
            TypeThresholds {
                min_keyword_score: 0.2,
                min_emotion: 0.1,
            },
        );
        type_thresholds.insert(
            "discussion".to_string(),
            TypeThresholds {
                min_keyword_score: 0.25,
                min_emotion: 0.15,
            },
        );
        type_thresholds.insert(
            "general".to_string(),
            TypeThresholds {
                min_keyword_score: 0.2,
                min_emotion: 0.1,
            },
        );

        Self {
            min_upvotes: 5,
            min_comments: 2,
            min_upvote_ratio: 0.6,
            min_text_length: 80,
            max_text_length: 15_000,
            exclusion_patterns: vec![
                r"(?i)\b(buy now|discount code|affiliate|sponsored)\b".into(),
                r"(?i)\b(hiring|we are looking for|job opening)\b".into(),
                r"(?i)\bcheck out my\b".into(),
            ],
            keywords,
            keyword_weights,
            keyword_norm: 5.0,
            required_patterns: vec![
                r"(?i)\b(i|we|my team)\b".into(),
                r"(?i)\b(problem|issue|struggle|stuck|fail|pain)\w*\b".into(),
            ],
            min_required: 1,
            strong_patterns: vec![
                r"(?i)every (day|week|month|time)".into(),
                r"(?i)(hours|all day) (on|doing|fixing)".into(),
                r"(?i)(tried everything|no good (way|tool|solution))".into(),
                r"(?i)(manually|by hand)".into(),
            ],
            min_strong: 1,
            pattern_norm: 4.0,
            high_intensity_words: vec![
                "nightmare".into(),
                "infuriating".into(),
                "desperate".into(),
                "hate".into(),
                "killing me".into(),
            ],
            medium_intensity_words: vec![
                "frustrating".into(),
                "annoying".into(),
                "painful".into(),
                "tedious".into(),
            ],
            low_intensity_words: vec![
                "wish".into(),
                "would be nice".into(),
                "hoping".into(),
                "struggling".into(),
            ],
            min_keyword_matches: 1,
            min_emotional_intensity: 0.05,
            technical_hints: vec![
                "programming".into(),
                "devops".into(),
                "sysadmin".into(),
                "webdev".into(),
                "dataengineering".into(),
            ],
            business_hints: vec![
                "entrepreneur".into(),
                "smallbusiness".into(),
                "startups".into(),
                "sales".into(),
                "accounting".into(),
            ],
            type_thresholds,
        }
    }
}

/// Pain extraction knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Include top-N comments in the prompt; 0 disables comment use
    pub max_comments: usize,
    /// Per-comment truncation before prompting
    pub comment_truncate_chars: usize,
    /// Delay window between posts (seconds)
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Timeout retries (5 s backoff between attempts)
    pub timeout_retries: u32,
    pub min_confidence: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_comments: 10,
            comment_truncate_chars: 500,
            min_delay_secs: 3,
            max_delay_secs: 7,
            timeout_retries: 2,
            min_confidence: 0.3,
        }
    }
}

/// Embedding stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedConfig {
    pub model: String,
    pub batch_size: usize,
    pub max_chars: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".into(),
            batch_size: 32,
            max_chars: 2000,
        }
    }
}

/// Per-source density clustering parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DensityParams {
    /// Cosine-distance neighborhood radius
    pub eps: f32,
    pub min_samples: usize,
}

impl Default for DensityParams {
    fn default() -> Self {
        Self {
            eps: 0.3,
            min_samples: 2,
        }
    }
}

/// Clustering stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Overrides per source; `default_params` otherwise
    pub per_source: HashMap<String, DensityParams>,
    pub default_params: DensityParams,
    /// Clusters smaller than this are dropped
    pub min_cluster_size: usize,
    /// Larger clusters are sampled to this many events for LLM work
    pub llm_sample_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            per_source: HashMap::new(),
            default_params: DensityParams::default(),
            min_cluster_size: 4,
            llm_sample_size: 20,
        }
    }
}

impl ClusterConfig {
    pub fn params_for(&self, source: &str) -> DensityParams {
        self.per_source
            .get(source)
            .copied()
            .unwrap_or(self.default_params)
    }
}

/// Cross-source alignment knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignConfig {
    /// Clusters below this size are not offered for alignment
    pub min_cluster_size: usize,
    pub batch_size: usize,
    /// Cached alignments older than this are recomputed
    pub cache_ttl_days: i64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            batch_size: 10,
            cache_ttl_days: 7,
        }
    }
}

/// Opportunity mapper knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfig {
    /// Quality rubric threshold below which opportunities are dropped
    pub min_quality: f32,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self { min_quality: 0.4 }
    }
}

/// Pre-gate thresholds for the viability scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreGateConfig {
    pub enabled: bool,
    pub min_cluster_size: usize,
    pub min_unique_authors: usize,
    pub min_cross_subreddits: usize,
    pub min_avg_frequency_score: f32,
}

impl Default for PreGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cluster_size: 5,
            min_unique_authors: 3,
            min_cross_subreddits: 1,
            min_avg_frequency_score: 4.0,
        }
    }
}

/// Viability scorer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub pre_gate: PreGateConfig,
    /// Estimated community members per subreddit
    pub subreddit_members: HashMap<String, f64>,
    /// Fallback estimate for unknown subreddits
    pub default_members: f64,
    /// Fraction of members considered addressable
    pub penetration: f64,
    /// Addressable-user thresholds for large/medium/small tiers
    pub tier_large: f64,
    pub tier_medium: f64,
    pub tier_small: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            pre_gate: PreGateConfig::default(),
            subreddit_members: HashMap::new(),
            default_members: 100_000.0,
            penetration: 0.001,
            tier_large: 50_000.0,
            tier_medium: 10_000.0,
            tier_small: 2_000.0,
        }
    }
}

/// Decision shortlist knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortlistConfig {
    pub min_viability: f32,
    pub min_cluster_size: usize,
    pub min_trust: f32,
    /// Cluster names to skip regardless of score
    pub ignore_clusters: Vec<String>,
    /// Trust per source name
    pub source_trust: HashMap<String, f32>,
    /// Trust per subreddit, overriding the source default
    pub subreddit_trust: HashMap<String, f32>,
    pub min_candidates: usize,
    pub max_candidates: usize,
    pub diversity_pass: bool,
    /// Output directories for the report artifacts
    pub markdown_dir: String,
    pub json_dir: String,
}

impl Default for ShortlistConfig {
    fn default() -> Self {
        let mut source_trust = HashMap::new();
        source_trust.insert("reddit".to_string(), 0.75);
        source_trust.insert("hn_ask".to_string(), 0.85);
        source_trust.insert("aligned".to_string(), 0.9);
        Self {
            min_viability: 7.0,
            min_cluster_size: 6,
            min_trust: 0.7,
            ignore_clusters: vec![],
            source_trust,
            subreddit_trust: HashMap::new(),
            min_candidates: 3,
            max_candidates: 5,
            diversity_pass: true,
            markdown_dir: "reports".into(),
            json_dir: "reports".into(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    pub sources: Vec<SourceConfig>,
    pub filter: FilterConfig,
    pub extractor: ExtractorConfig,
    pub embed: EmbedConfig,
    pub cluster: ClusterConfig,
    pub align: AlignConfig,
    pub mapper: MapperConfig,
    pub scorer: ScorerConfig,
    pub shortlist: ShortlistConfig,
}
