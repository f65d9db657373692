//! Embedding stage - one dense vector per pain event.

use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::traits::ai::Ai;
use crate::traits::store::EventStore;
use crate::types::{EmbedConfig, EmbedStats, EmbedVerify};

/// Embed every event that lacks a vector for the current model.
///
/// Texts are cached per process so identical events (common after
/// reruns of upstream stages) cost one API call. Batches keep within
/// provider quotas; a failed batch is counted and skipped, never
/// fatal.
pub async fn run_embed<S, A>(store: &S, ai: &A, config: &EmbedConfig, limit: usize) -> Result<EmbedStats>
where
    S: EventStore,
    A: Ai,
{
    let started = Instant::now();
    let mut stats = EmbedStats::default();
    let model = ai.embedding_model().to_string();
    let events = store.events_without_embedding(&model, limit).await?;

    let mut cache: HashMap<String, Vec<f32>> = HashMap::new();

    for batch in events.chunks(config.batch_size.max(1)) {
        let mut texts: Vec<(i64, String)> = Vec::with_capacity(batch.len());
        for event in batch {
            let Some(id) = event.id else { continue };
            texts.push((id, event.embedding_text(config.max_chars)));
        }

        // Serve cached texts first; only the rest go to the API.
        let mut to_fetch: Vec<&str> = Vec::new();
        for (_, text) in &texts {
            if cache.contains_key(text.as_str()) {
                stats.cache_hits += 1;
            } else if !to_fetch.contains(&text.as_str()) {
                to_fetch.push(text.as_str());
            }
        }

        if !to_fetch.is_empty() {
            match ai.embed_batch(&to_fetch).await {
                Ok(vectors) => {
                    for (text, vector) in to_fetch.iter().zip(vectors) {
                        cache.insert(text.to_string(), vector);
                    }
                }
                Err(err) => {
                    warn!(batch = batch.len(), "embedding batch failed: {err}");
                    stats.errors += batch.len();
                    continue;
                }
            }
        }

        for (event_id, text) in &texts {
            let Some(vector) = cache.get(text) else {
                stats.errors += 1;
                continue;
            };
            match store.store_embedding(*event_id, &model, vector).await {
                Ok(()) => stats.events_embedded += 1,
                Err(err) => {
                    warn!(event = event_id, "embedding store failed: {err}");
                    stats.errors += 1;
                }
            }
        }
    }

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        embedded = stats.events_embedded,
        cache_hits = stats.cache_hits,
        errors = stats.errors,
        "embedding complete"
    );
    Ok(stats)
}

/// Check stored vectors for anomalies: empty, non-finite, or all zero.
pub async fn verify_embeddings<S: EventStore>(store: &S) -> Result<EmbedVerify> {
    let mut verify = EmbedVerify::default();
    for (event_id, vector) in store.all_embeddings().await? {
        verify.checked += 1;
        let empty = vector.is_empty();
        let non_finite = vector.iter().any(|v| !v.is_finite());
        let all_zero = !empty && vector.iter().all(|v| *v == 0.0);
        if empty || non_finite || all_zero {
            verify.anomalies.push(event_id);
        }
    }
    if !verify.anomalies.is_empty() {
        warn!(anomalies = verify.anomalies.len(), "embedding verification found problems");
    }
    Ok(verify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::SqliteStore;
    use crate::testing::{self, MockAi};
    use crate::traits::store::{EventStore, PostStore};

    async fn store_with_events(problems: &[&str]) -> (SqliteStore, Vec<i64>) {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .insert_post(&testing::fetched_post("reddit", "p1", 0))
            .await
            .unwrap();
        let events: Vec<_> = problems
            .iter()
            .map(|p| testing::pain_event("reddit_p1", p))
            .collect();
        let ids = store.insert_events(&events).await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn embedding_is_idempotent_per_model() {
        let (store, _) = store_with_events(&[
            "exports crash on big files",
            "imports drop rows silently every week",
        ])
        .await;
        let ai = MockAi::new();

        let first = run_embed(&store, &ai, &EmbedConfig::default(), 100).await.unwrap();
        assert_eq!(first.events_embedded, 2);

        let second = run_embed(&store, &ai, &EmbedConfig::default(), 100).await.unwrap();
        assert_eq!(second.events_embedded, 0);
    }

    #[tokio::test]
    async fn identical_texts_hit_the_cache() {
        let (store, _) =
            store_with_events(&["exports crash on big files", "exports crash on big files"]).await;
        let ai = MockAi::new();

        let stats = run_embed(&store, &ai, &EmbedConfig::default(), 100).await.unwrap();
        assert_eq!(stats.events_embedded, 2);
    }

    #[tokio::test]
    async fn verification_flags_bad_vectors() {
        let (store, ids) = store_with_events(&[
            "exports crash on big files",
            "imports drop rows silently every week",
            "sync fails between the two tools daily",
        ])
        .await;

        store.store_embedding(ids[0], "m", &[0.1, 0.2]).await.unwrap();
        store.store_embedding(ids[1], "m", &[0.0, 0.0]).await.unwrap();
        store
            .store_embedding(ids[2], "m", &[f32::NAN, 0.3])
            .await
            .unwrap();

        let verify = verify_embeddings(&store).await.unwrap();
        assert_eq!(verify.checked, 3);
        assert_eq!(verify.anomalies, vec![ids[1], ids[2]]);
    }
}
