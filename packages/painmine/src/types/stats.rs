//! Per-stage statistics, the pipeline's observability surface.
//!
//! Every stage returns one of these records instead of logging ad hoc;
//! the binary serializes them when `--save-results` is set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counts from one `fetch_all` run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchStats {
    /// Inserted posts per source
    pub inserted: HashMap<String, usize>,
    /// Posts skipped because they were already stored
    pub skipped: HashMap<String, usize>,
    /// Per-item failures per source
    pub errors: HashMap<String, usize>,
    pub comments_attached: usize,
    pub elapsed_secs: f64,
}

impl FetchStats {
    pub fn total_inserted(&self) -> usize {
        self.inserted.values().sum()
    }
}

/// Counts from one signal-filter run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterStats {
    pub examined: usize,
    pub passed: usize,
    /// Rejections keyed by the gate that fired
    pub rejected_by: HashMap<String, usize>,
    pub avg_pain_score: f32,
    pub elapsed_secs: f64,
}

impl FilterStats {
    pub fn pass_rate(&self) -> f32 {
        if self.examined == 0 {
            0.0
        } else {
            self.passed as f32 / self.examined as f32
        }
    }
}

/// Counts from one extraction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractStats {
    pub posts_processed: usize,
    pub posts_skipped: usize,
    pub events_extracted: usize,
    pub events_discarded: usize,
    pub llm_errors: usize,
    pub elapsed_secs: f64,
}

/// Counts from one embedding run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedStats {
    pub events_embedded: usize,
    pub cache_hits: usize,
    pub errors: usize,
    pub elapsed_secs: f64,
}

/// Result of verifying stored embeddings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedVerify {
    pub checked: usize,
    /// Event ids whose vectors were empty, non-finite, or all zero
    pub anomalies: Vec<i64>,
}

/// Counts from one clustering run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterStats {
    pub events_considered: usize,
    pub clusters_formed: usize,
    pub clusters_rejected_llm: usize,
    pub clusters_below_floor: usize,
    pub noise_events: usize,
    pub elapsed_secs: f64,
}

/// Counts from one alignment run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignStats {
    pub clusters_considered: usize,
    pub batches: usize,
    pub batches_skipped_single_source: usize,
    pub cache_hits: usize,
    pub aligned_problems: usize,
    pub clusters_aligned: usize,
    pub clusters_processed: usize,
    pub elapsed_secs: f64,
}

/// Counts from one opportunity-mapping run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapStats {
    pub clusters_considered: usize,
    pub opportunities_persisted: usize,
    pub dropped_below_quality: usize,
    pub llm_errors: usize,
    pub elapsed_secs: f64,
}

/// Counts from one viability-scoring run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreStats {
    pub opportunities_scored: usize,
    pub pre_gate_abandoned: usize,
    pub llm_errors: usize,
    pub avg_total_score: f32,
    pub elapsed_secs: f64,
}

/// Counts from one shortlist run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortlistStats {
    pub considered: usize,
    pub passed_filters: usize,
    pub selected: usize,
    pub content_fallbacks: usize,
    pub elapsed_secs: f64,
}

/// Everything a full `--stage all` run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResults {
    pub fetch: Option<FetchStats>,
    pub filter: Option<FilterStats>,
    pub extract: Option<ExtractStats>,
    pub embed: Option<EmbedStats>,
    pub cluster: Option<ClusterStats>,
    pub align: Option<AlignStats>,
    pub map: Option<MapStats>,
    pub score: Option<ScoreStats>,
    pub shortlist: Option<ShortlistStats>,
}
