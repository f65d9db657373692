//! Ingestion stage - pull posts from every configured source.

use std::time::Instant;
use tracing::{info, warn};

use crate::error::{Result, SourceError};
use crate::traits::{source::CommunitySource, store::PostStore};
use crate::types::{FetchStats, SourceConfig};

/// Fetch from each source and persist unified rows.
///
/// The seen-set is preloaded per source so previously stored ids are
/// skipped without touching the network payload twice. Per-item
/// failures are counted; a source that fails wholesale (other than
/// auth) is logged and skipped so the remaining sources still run.
pub async fn fetch_all<S>(
    store: &S,
    sources: &[(Box<dyn CommunitySource>, SourceConfig)],
    limit_sources: Option<usize>,
) -> Result<FetchStats>
where
    S: PostStore,
{
    let started = Instant::now();
    let mut stats = FetchStats::default();

    let take = limit_sources.unwrap_or(sources.len());
    for (source, config) in sources.iter().take(take) {
        let name = config.name.clone();
        let seen = store.seen_ids(&name).await?;
        info!(source = %name, known = seen.len(), "fetching");

        let outcome = match source.fetch(config, &seen).await {
            Ok(outcome) => outcome,
            Err(err @ SourceError::Auth { .. }) => return Err(err.into()),
            Err(err) => {
                warn!(source = %name, "fetch failed: {err}");
                *stats.errors.entry(name.clone()).or_default() += 1;
                continue;
            }
        };

        let mut inserted = 0usize;
        let mut skipped = outcome.skipped;
        *stats.errors.entry(name.clone()).or_default() += outcome.errors;

        for fetched in &outcome.posts {
            match store.insert_post(fetched).await {
                Ok(true) => {
                    inserted += 1;
                    stats.comments_attached += fetched.comments.len();
                }
                Ok(false) => skipped += 1,
                Err(err) => {
                    warn!(post = %fetched.post.id, "insert failed: {err}");
                    *stats.errors.entry(name.clone()).or_default() += 1;
                }
            }
        }

        info!(source = %name, inserted, skipped, "source done");
        stats.inserted.insert(name.clone(), inserted);
        stats.skipped.insert(name, skipped);
    }

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        inserted = stats.total_inserted(),
        comments = stats.comments_attached,
        elapsed = stats.elapsed_secs,
        "fetch complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::SqliteStore;
    use crate::testing::{fetched_post, MockSource};
    use crate::types::SourceConfig;

    fn reddit_source(posts: Vec<crate::types::FetchedPost>) -> (Box<dyn CommunitySource>, SourceConfig) {
        let config = SourceConfig {
            name: "reddit".into(),
            ..SourceConfig::default()
        };
        (Box::new(MockSource::new("reddit", posts)), config)
    }

    #[tokio::test]
    async fn refetch_never_duplicates_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        let sources = vec![reddit_source(vec![
            fetched_post("reddit", "a", 1),
            fetched_post("reddit", "b", 0),
        ])];

        let first = fetch_all(&store, &sources, None).await.unwrap();
        assert_eq!(first.total_inserted(), 2);
        assert_eq!(first.comments_attached, 1);

        let second = fetch_all(&store, &sources, None).await.unwrap();
        assert_eq!(second.total_inserted(), 0);
        assert_eq!(second.skipped["reddit"], 2);
        assert_eq!(store.count_posts().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn limit_sources_restricts_the_pass() {
        let store = SqliteStore::in_memory().await.unwrap();
        let hn_config = SourceConfig {
            name: "hn_ask".into(),
            ..SourceConfig::default()
        };
        let sources: Vec<(Box<dyn CommunitySource>, SourceConfig)> = vec![
            reddit_source(vec![fetched_post("reddit", "a", 0)]),
            (
                Box::new(MockSource::new("hn_ask", vec![fetched_post("hn_ask", "1", 0)])),
                hn_config,
            ),
        ];

        let stats = fetch_all(&store, &sources, Some(1)).await.unwrap();
        assert_eq!(stats.inserted.len(), 1);
        assert!(stats.inserted.contains_key("reddit"));
    }
}
