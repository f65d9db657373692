//! Opportunities and the decision shortlist.

use serde::{Deserialize, Serialize};

/// A proposed micro-tool addressing one cluster (real or aligned).
///
/// `total_score` is 0-1 right after mapping (the mapper's quality
/// rubric) and 0-10 once the viability scorer has rescored it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    /// Database id (None until stored)
    pub id: Option<i64>,
    pub cluster_id: String,
    pub source_type: String,
    pub name: String,
    pub description: String,
    pub target_users: String,
    pub current_tools: Vec<String>,
    pub missing_capability: String,
    pub why_existing_fail: String,

    /// How often the pain recurs (higher = more often)
    pub pain_frequency: f32,
    /// Addressable audience (higher = bigger)
    pub market_size: f32,
    /// Build effort (lower = better)
    pub mvp_complexity: f32,
    /// Existing competition (lower = better)
    pub competition_risk: f32,
    /// Integration surface (lower = better)
    pub integration_complexity: f32,

    pub total_score: f32,
    pub killer_risks: Vec<String>,
    pub recommendation: String,
}

impl Opportunity {
    /// Map a viability score onto a recommendation string.
    pub fn recommendation_for(score: f32) -> &'static str {
        if score >= 8.0 {
            "pursue"
        } else if score >= 6.5 {
            "pursue (managed risks)"
        } else if score >= 5.0 {
            "modify"
        } else if score >= 3.5 {
            "research"
        } else {
            "abandon"
        }
    }
}

/// One ranked item on the decision shortlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortlistEntry {
    pub cluster_id: String,
    pub name: String,
    pub viability_score: f32,
    pub cluster_size: usize,
    pub trust_level: f32,
    /// Cross-source validation boost (0.0, 0.5, 1.0, or 2.0)
    pub cross_source_boost: f32,
    pub final_score: f32,
    /// "Users in ... struggle with ... because ..." (<= 200 chars)
    pub problem: String,
    /// "A minimal tool that ..." (<= 150 chars)
    pub mvp: String,
    /// Concrete timing signal (<= 150 chars)
    pub why_now: String,
}

/// The shortlist plus enough context to explain an empty one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortlistReport {
    pub entries: Vec<ShortlistEntry>,
    /// Opportunities considered before hard filters
    pub considered: usize,
    /// Survivors of the hard filters
    pub passed_filters: usize,
    /// Filter that rejected the most candidates, when the list is empty
    pub binding_filter: Option<String>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl ShortlistReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
