//! Storage traits for the pipeline's durable state.
//!
//! The store is split into focused traits, one per table family:
//! - `PostStore`: raw posts and comments
//! - `FilterStore`: filtered posts and extraction markers
//! - `EventStore`: pain events and their embeddings
//! - `ClusterStore`: clusters and aligned problems
//! - `OpportunityStore`: opportunities
//! - `Store`: composite trait combining all five
//!
//! Every write is idempotent (upsert or insert-or-ignore) so any stage
//! can be restarted without duplicating rows.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::types::{
    AlignedProblem, AlignmentStatus, Cluster, Comment, FetchedPost, FilteredPost, Opportunity,
    PainEvent, Post,
};

/// Raw posts and their comments.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Ids already stored for a source, preloaded as the seen-set.
    async fn seen_ids(&self, source: &str) -> Result<HashSet<String>>;

    /// Insert a post with its comments. Returns false when the
    /// `(source, source_id)` pair was already present.
    async fn insert_post(&self, fetched: &FetchedPost) -> Result<bool>;

    async fn get_post(&self, id: &str) -> Result<Option<Post>>;

    /// Top-level comments for a post, highest score first.
    async fn comments_for(&self, post_id: &str, limit: usize) -> Result<Vec<Comment>>;

    /// Posts not yet examined by the signal filter, newest first.
    async fn unfiltered_posts(&self, limit: usize) -> Result<Vec<Post>>;

    async fn count_posts(&self) -> Result<usize>;
}

/// Filtered posts and the extraction progress marker.
#[async_trait]
pub trait FilterStore: Send + Sync {
    /// Store a passed post's filter outcome (reruns overwrite).
    async fn upsert_filtered(&self, filtered: &FilteredPost) -> Result<()>;

    async fn get_filtered(&self, post_id: &str) -> Result<Option<FilteredPost>>;

    /// Passed posts the extractor has not attempted yet, newest first.
    async fn filtered_pending_extraction(
        &self,
        limit: usize,
    ) -> Result<Vec<(Post, FilteredPost)>>;

    /// Record that extraction was attempted for a post, regardless of
    /// how many events it yielded.
    async fn mark_extracted(&self, post_id: &str) -> Result<()>;
}

/// Pain events and their embeddings.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert events for a post, returning their new ids.
    async fn insert_events(&self, events: &[PainEvent]) -> Result<Vec<i64>>;

    /// Events lacking an embedding for the given model, oldest first.
    async fn events_without_embedding(&self, model: &str, limit: usize)
        -> Result<Vec<PainEvent>>;

    /// Store (or replace) the single active embedding for an event.
    async fn store_embedding(&self, event_id: i64, model: &str, vector: &[f32]) -> Result<()>;

    /// Every embedded event for a model, with its post's source tag.
    async fn embedded_events(&self, model: &str) -> Result<Vec<(PainEvent, String, Vec<f32>)>>;

    /// All stored vectors, for verification.
    async fn all_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>>;

    async fn events_by_ids(&self, ids: &[i64]) -> Result<Vec<PainEvent>>;

    /// Originating posts for a set of events.
    async fn posts_for_events(&self, ids: &[i64]) -> Result<Vec<Post>>;
}

/// Clusters and cross-source aligned problems.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// How many clusters this source already has (for stable numbering).
    async fn cluster_count(&self, source: &str) -> Result<usize>;

    async fn store_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Drop a source's clusters ahead of a rebuild.
    async fn clear_clusters_for_source(&self, source: &str) -> Result<()>;

    async fn get_cluster(&self, id: &str) -> Result<Option<Cluster>>;

    async fn clusters(&self) -> Result<Vec<Cluster>>;

    /// Clusters in a given alignment state with at least `min_size` members.
    async fn clusters_with_status(
        &self,
        status: AlignmentStatus,
        min_size: usize,
    ) -> Result<Vec<Cluster>>;

    async fn set_alignment(
        &self,
        cluster_id: &str,
        status: AlignmentStatus,
        aligned_problem_id: Option<&str>,
    ) -> Result<()>;

    async fn store_aligned_problem(&self, problem: &AlignedProblem) -> Result<()>;

    async fn aligned_problems(&self) -> Result<Vec<AlignedProblem>>;
}

/// Opportunities, one per cluster.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Insert or overwrite the opportunity for a cluster.
    async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<i64>;

    /// All persisted opportunities, newest first.
    async fn opportunities(&self, limit: usize) -> Result<Vec<Opportunity>>;

    /// Rewrite an opportunity's assessment after (re)scoring.
    async fn update_assessment(&self, opportunity: &Opportunity) -> Result<()>;
}

/// Composite storage trait used by the pipeline facade.
pub trait Store:
    PostStore + FilterStore + EventStore + ClusterStore + OpportunityStore
{
}

impl<T> Store for T where
    T: PostStore + FilterStore + EventStore + ClusterStore + OpportunityStore
{
}

/// Cosine similarity between two vectors (0 when shapes mismatch).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine distance, the clustering metric.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.2, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn mismatched_or_zero_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
