//! Workflow clusters and cross-source aligned problems.

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Where a cluster sits in the cross-source alignment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentStatus {
    /// Not yet considered by the aligner
    Unprocessed,
    /// Considered but not matched across sources
    Processed,
    /// Matched into an aligned problem
    Aligned,
}

impl AlignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processed => "processed",
            Self::Aligned => "aligned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processed" => Self::Processed,
            "aligned" => Self::Aligned,
            _ => Self::Unprocessed,
        }
    }
}

/// A group of pain events judged to describe the same failing workflow.
///
/// Ids are `"{source}_{NN}"`, numbered monotonically within a source by
/// creation order. Membership is non-overlapping within a run and
/// `size` always equals the member count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    /// Discourse source the members came from ("reddit", "hn_ask", ...)
    pub source_type: String,
    pub centroid_summary: String,
    pub common_pain: String,
    pub common_context: String,
    /// 2-3 representative problem statements
    pub example_events: Vec<String>,
    pub coherence_score: f32,
    /// Ordered member event ids
    pub pain_event_ids: IndexSet<i64>,
    pub size: usize,
    pub workflow_confidence: f32,
    pub alignment_status: AlignmentStatus,
    pub aligned_problem_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    /// Build the stable id for the Nth cluster of a source.
    pub fn make_id(source: &str, index: usize) -> String {
        format!("{}_{:02}", source, index)
    }

    /// One-line summary used in alignment and mapper prompts.
    pub fn prompt_summary(&self) -> String {
        format!(
            "{} ({}, {} events): {}",
            self.name, self.source_type, self.size, self.centroid_summary
        )
    }
}

/// A quote supporting an aligned problem, tagged with its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentEvidence {
    pub source: String,
    pub quote: String,
}

/// Clusters from different sources judged to describe the same problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignedProblem {
    /// `"AP_XX"` style id
    pub id: String,
    pub sources: Vec<String>,
    pub core_problem: String,
    pub why_they_look_different: String,
    pub evidence: Vec<AlignmentEvidence>,
    pub cluster_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Mapper input: a real cluster or an aligned virtual one.
///
/// The mapper dispatches on this tag rather than on row identity; the
/// virtual variant carries `source_type = "aligned"` downstream.
#[derive(Debug, Clone)]
pub enum ClusterLike {
    Real(Cluster),
    Aligned {
        problem: AlignedProblem,
        /// The member clusters backing the aligned problem
        supporting: Vec<Cluster>,
    },
}

impl ClusterLike {
    /// Id the resulting opportunity is keyed under.
    pub fn cluster_id(&self) -> &str {
        match self {
            Self::Real(c) => &c.id,
            Self::Aligned { problem, .. } => &problem.id,
        }
    }

    pub fn source_type(&self) -> &str {
        match self {
            Self::Real(c) => &c.source_type,
            Self::Aligned { .. } => "aligned",
        }
    }

    /// Real clusters count events; aligned ones count member clusters.
    pub fn size(&self) -> usize {
        match self {
            Self::Real(c) => c.size,
            Self::Aligned { supporting, .. } => supporting.len(),
        }
    }

    pub fn workflow_confidence(&self) -> f32 {
        match self {
            Self::Real(c) => c.workflow_confidence,
            // Cross-source agreement is itself strong workflow evidence
            Self::Aligned { .. } => 0.95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_is_zero_padded() {
        assert_eq!(Cluster::make_id("reddit", 0), "reddit_00");
        assert_eq!(Cluster::make_id("hn_ask", 12), "hn_ask_12");
    }

    #[test]
    fn alignment_status_round_trips() {
        for status in [
            AlignmentStatus::Unprocessed,
            AlignmentStatus::Processed,
            AlignmentStatus::Aligned,
        ] {
            assert_eq!(AlignmentStatus::parse(status.as_str()), status);
        }
        assert_eq!(
            AlignmentStatus::parse("garbage"),
            AlignmentStatus::Unprocessed
        );
    }

    #[test]
    fn aligned_virtual_size_counts_clusters() {
        let problem = crate::testing::aligned_problem("AP_01", &["reddit", "hn_ask"]);
        let like = ClusterLike::Aligned {
            problem,
            supporting: vec![
                crate::testing::cluster("reddit_00", "reddit", &[1, 2, 3, 4]),
                crate::testing::cluster("hn_ask_00", "hn_ask", &[5, 6, 7, 8]),
            ],
        };
        assert_eq!(like.size(), 2);
        assert_eq!(like.source_type(), "aligned");
    }
}
