//! Community source trait for pluggable post ingestion.
//!
//! A source knows how to talk to one platform (Reddit, Hacker News)
//! and yields normalized posts with comments attached. Per-item
//! failures are counted in the outcome, never raised; only
//! authentication problems are fatal, and those surface when the
//! source is constructed.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::SourceResult;
use crate::types::{FetchedPost, SourceConfig};

/// Outcome of one fetch pass over a source.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Posts not present in `seen`, with their comments
    pub posts: Vec<FetchedPost>,
    /// Ids skipped because they were already stored
    pub skipped: usize,
    /// Per-item failures (bad payloads, dropped requests)
    pub errors: usize,
}

/// A read-only client for one community platform.
#[async_trait]
pub trait CommunitySource: Send + Sync {
    /// Source name; becomes the `source` column and the id prefix.
    fn name(&self) -> &str;

    /// Fetch new posts, skipping ids already in `seen`.
    async fn fetch(
        &self,
        config: &SourceConfig,
        seen: &HashSet<String>,
    ) -> SourceResult<FetchOutcome>;
}
