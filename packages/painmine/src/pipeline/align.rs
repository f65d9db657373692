//! Cross-source alignment stage.
//!
//! Clusters from different sources often describe the same problem in
//! different vocabulary (Reddit venting vs HN architecture talk). The
//! aligner batches unprocessed clusters, asks the model to match them
//! across sources only, and persists accepted matches as aligned
//! problems. Batch results are cached by a deterministic key over the
//! batch summaries so reruns within the freshness window cost nothing.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{info, warn};

use crate::ai::recover::slice_array;
use crate::error::Result;
use crate::pipeline::prompts::{format_align_prompt, SYSTEM_PROMPT};
use crate::traits::ai::{Ai, ModelRole};
use crate::traits::store::ClusterStore;
use crate::types::{
    AlignConfig, AlignStats, AlignedProblem, AlignmentEvidence, AlignmentStatus, Cluster,
};

/// One alignment object from the model.
#[derive(Debug, Clone, Deserialize)]
pub struct AiAlignment {
    pub aligned_problem_id: String,
    pub sources: Vec<String>,
    pub core_problem: String,
    #[serde(default)]
    pub why_they_look_different: String,
    #[serde(default)]
    pub evidence: Vec<AiAlignmentEvidence>,
    #[serde(default)]
    pub cluster_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiAlignmentEvidence {
    pub source: String,
    pub quote: String,
}

/// Per-process cache of batch alignments, keyed by summary hash.
#[derive(Default)]
pub struct AlignmentCache {
    entries: HashMap<String, (DateTime<Utc>, Vec<AiAlignment>)>,
}

impl AlignmentCache {
    pub fn get(&self, key: &str, ttl_days: i64) -> Option<&Vec<AiAlignment>> {
        self.entries.get(key).and_then(|(stored_at, alignments)| {
            if Utc::now() - *stored_at <= Duration::days(ttl_days) {
                Some(alignments)
            } else {
                None
            }
        })
    }

    pub fn put(&mut self, key: String, alignments: Vec<AiAlignment>) {
        self.entries.insert(key, (Utc::now(), alignments));
    }
}

/// Deterministic key over the batch's cluster summaries.
pub fn batch_cache_key(batch: &[Cluster]) -> String {
    let mut hasher = Sha256::new();
    for cluster in batch {
        hasher.update(cluster.prompt_summary().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Parse the model's alignment array tolerantly.
///
/// The outermost JSON array is sliced out of whatever came back;
/// malformed elements are discarded one by one instead of failing the
/// batch.
pub fn parse_alignments(response: &str) -> Vec<AiAlignment> {
    let sliced = slice_array(response).unwrap_or(response);
    let values: Vec<serde_json::Value> = match serde_json::from_str(sliced) {
        Ok(values) => values,
        Err(err) => {
            warn!("alignment response is not a JSON array: {err}");
            return vec![];
        }
    };
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<AiAlignment>(value) {
            Ok(alignment) => Some(alignment),
            Err(err) => {
                warn!("discarding malformed alignment: {err}");
                None
            }
        })
        .collect()
}

/// Align unprocessed clusters across sources, in batches.
pub async fn run_align<S, A>(
    store: &S,
    ai: &A,
    config: &AlignConfig,
    cache: &mut AlignmentCache,
) -> Result<AlignStats>
where
    S: ClusterStore,
    A: Ai,
{
    let started = Instant::now();
    let mut stats = AlignStats::default();
    let clusters = store
        .clusters_with_status(AlignmentStatus::Unprocessed, config.min_cluster_size)
        .await?;
    stats.clusters_considered = clusters.len();

    let mut existing_ids: HashSet<String> = store
        .aligned_problems()
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect();

    for batch in clusters.chunks(config.batch_size.max(1)) {
        stats.batches += 1;

        let distinct_sources: HashSet<&str> =
            batch.iter().map(|c| c.source_type.as_str()).collect();
        if distinct_sources.len() < 2 {
            stats.batches_skipped_single_source += 1;
            continue;
        }

        let key = batch_cache_key(batch);
        let alignments = match cache.get(&key, config.cache_ttl_days) {
            Some(cached) => {
                stats.cache_hits += 1;
                cached.clone()
            }
            None => {
                let mut by_source: BTreeMap<String, Vec<&Cluster>> = BTreeMap::new();
                for cluster in batch {
                    by_source
                        .entry(cluster.source_type.clone())
                        .or_default()
                        .push(cluster);
                }
                let grouped: Vec<(String, Vec<&Cluster>)> = by_source.into_iter().collect();
                let prompt = format_align_prompt(&grouped);

                let response = match ai
                    .chat_json(ModelRole::Medium, SYSTEM_PROMPT, &prompt)
                    .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("alignment call failed: {err}");
                        continue;
                    }
                };
                let parsed = parse_alignments(&response);
                cache.put(key, parsed.clone());
                parsed
            }
        };

        let mut aligned_in_batch: HashSet<String> = HashSet::new();
        for alignment in alignments {
            let Some((problem, member_ids)) =
                accept_alignment(&alignment, batch, &mut existing_ids)
            else {
                continue;
            };

            store.store_aligned_problem(&problem).await?;
            for cluster_id in &member_ids {
                store
                    .set_alignment(cluster_id, AlignmentStatus::Aligned, Some(&problem.id))
                    .await?;
                aligned_in_batch.insert(cluster_id.clone());
            }
            stats.aligned_problems += 1;
            stats.clusters_aligned += member_ids.len();
        }

        for cluster in batch {
            if !aligned_in_batch.contains(&cluster.id) {
                store
                    .set_alignment(&cluster.id, AlignmentStatus::Processed, None)
                    .await?;
                stats.clusters_processed += 1;
            }
        }
    }

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        considered = stats.clusters_considered,
        aligned_problems = stats.aligned_problems,
        cache_hits = stats.cache_hits,
        "alignment complete"
    );
    Ok(stats)
}

/// Validate one alignment against its batch.
///
/// The match must resolve to named clusters from at least two distinct
/// sources; anything else is discarded.
fn accept_alignment(
    alignment: &AiAlignment,
    batch: &[Cluster],
    existing_ids: &mut HashSet<String>,
) -> Option<(AlignedProblem, Vec<String>)> {
    if alignment.core_problem.trim().is_empty() || alignment.cluster_names.is_empty() {
        return None;
    }

    let members: Vec<&Cluster> = batch
        .iter()
        .filter(|c| alignment.cluster_names.iter().any(|n| n == &c.name))
        .collect();
    let member_sources: HashSet<&str> = members.iter().map(|c| c.source_type.as_str()).collect();
    if member_sources.len() < 2 {
        return None;
    }

    let id = unique_problem_id(&alignment.aligned_problem_id, existing_ids);
    existing_ids.insert(id.clone());

    let problem = AlignedProblem {
        id,
        sources: member_sources.iter().map(|s| s.to_string()).collect(),
        core_problem: alignment.core_problem.clone(),
        why_they_look_different: alignment.why_they_look_different.clone(),
        evidence: alignment
            .evidence
            .iter()
            .map(|e| AlignmentEvidence {
                source: e.source.clone(),
                quote: e.quote.clone(),
            })
            .collect(),
        cluster_ids: members.iter().map(|c| c.id.clone()).collect(),
        created_at: Utc::now(),
    };
    let member_ids = problem.cluster_ids.clone();
    Some((problem, member_ids))
}

/// Keep the model's `AP_XX` id when it is free; renumber otherwise.
fn unique_problem_id(proposed: &str, existing: &HashSet<String>) -> String {
    let well_formed = proposed.starts_with("AP_") && proposed.len() > 3;
    if well_formed && !existing.contains(proposed) {
        return proposed.to_string();
    }
    let mut counter = existing.len() + 1;
    loop {
        let candidate = format!("AP_{:02}", counter);
        if !existing.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::SqliteStore;
    use crate::testing::{self, MockAi};
    use crate::traits::store::ClusterStore;

    fn alignment_json(names: &[&str]) -> String {
        let quoted: Vec<String> = names.iter().map(|n| format!("\"{}\"", n)).collect();
        format!(
            r#"Here you go: [
                {{"aligned_problem_id": "AP_01",
                  "sources": ["reddit", "hn_ask"],
                  "core_problem": "deployment pipelines are error-prone",
                  "why_they_look_different": "tone differs",
                  "evidence": [{{"source": "reddit", "quote": "deploys break weekly"}}],
                  "cluster_names": [{}]}}
            ] done."#,
            quoted.join(", ")
        )
    }

    async fn seed_clusters(store: &SqliteStore) {
        let mut reddit = testing::cluster("reddit_00", "reddit", &[1, 2, 3, 4]);
        reddit.name = "Deploy pain".into();
        let mut hn = testing::cluster("hn_ask_00", "hn_ask", &[5, 6, 7, 8]);
        hn.name = "Pipeline breakage".into();
        store.store_cluster(&reddit).await.unwrap();
        store.store_cluster(&hn).await.unwrap();
    }

    #[tokio::test]
    async fn cross_source_match_persists_and_marks_clusters() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_clusters(&store).await;

        let ai = MockAi::new()
            .with_default_response(alignment_json(&["Deploy pain", "Pipeline breakage"]));
        let mut cache = AlignmentCache::default();
        let stats = run_align(&store, &ai, &AlignConfig::default(), &mut cache)
            .await
            .unwrap();

        assert_eq!(stats.aligned_problems, 1);
        assert_eq!(stats.clusters_aligned, 2);

        let problems = store.aligned_problems().await.unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].id, "AP_01");
        assert_eq!(problems[0].sources.len(), 2);
        assert_eq!(problems[0].cluster_ids.len(), 2);

        for id in ["reddit_00", "hn_ask_00"] {
            let cluster = store.get_cluster(id).await.unwrap().unwrap();
            assert_eq!(cluster.alignment_status, AlignmentStatus::Aligned);
            assert_eq!(cluster.aligned_problem_id.as_deref(), Some("AP_01"));
        }
    }

    #[tokio::test]
    async fn single_source_batches_are_skipped() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .store_cluster(&testing::cluster("reddit_00", "reddit", &[1, 2, 3, 4]))
            .await
            .unwrap();
        store
            .store_cluster(&testing::cluster("reddit_01", "reddit", &[5, 6, 7, 8]))
            .await
            .unwrap();

        let ai = MockAi::new();
        let mut cache = AlignmentCache::default();
        let stats = run_align(&store, &ai, &AlignConfig::default(), &mut cache)
            .await
            .unwrap();

        assert_eq!(stats.batches_skipped_single_source, 1);
        assert_eq!(stats.aligned_problems, 0);
        assert!(ai.calls().is_empty());
        // Clusters stay unprocessed for a later, richer batch.
        let cluster = store.get_cluster("reddit_00").await.unwrap().unwrap();
        assert_eq!(cluster.alignment_status, AlignmentStatus::Unprocessed);
    }

    #[tokio::test]
    async fn unmatched_clusters_become_processed() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_clusters(&store).await;
        let mut extra = testing::cluster("hn_ask_01", "hn_ask", &[9, 10, 11]);
        extra.name = "Unrelated pain".into();
        store.store_cluster(&extra).await.unwrap();

        let ai = MockAi::new()
            .with_default_response(alignment_json(&["Deploy pain", "Pipeline breakage"]));
        let mut cache = AlignmentCache::default();
        run_align(&store, &ai, &AlignConfig::default(), &mut cache)
            .await
            .unwrap();

        let cluster = store.get_cluster("hn_ask_01").await.unwrap().unwrap();
        assert_eq!(cluster.alignment_status, AlignmentStatus::Processed);
        assert_eq!(cluster.aligned_problem_id, None);
    }

    #[tokio::test]
    async fn same_source_alignments_are_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut a = testing::cluster("reddit_00", "reddit", &[1, 2, 3, 4]);
        a.name = "Deploy pain".into();
        let mut b = testing::cluster("reddit_01", "reddit", &[5, 6, 7, 8]);
        b.name = "Pipeline breakage".into();
        let mut c = testing::cluster("hn_ask_00", "hn_ask", &[9, 10, 11]);
        c.name = "Other thing".into();
        for cluster in [&a, &b, &c] {
            store.store_cluster(cluster).await.unwrap();
        }

        // The model wrongly aligns two reddit clusters.
        let ai = MockAi::new()
            .with_default_response(alignment_json(&["Deploy pain", "Pipeline breakage"]));
        let mut cache = AlignmentCache::default();
        let stats = run_align(&store, &ai, &AlignConfig::default(), &mut cache)
            .await
            .unwrap();
        assert_eq!(stats.aligned_problems, 0);
    }

    #[tokio::test]
    async fn cached_batches_skip_the_model() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_clusters(&store).await;

        let ai = MockAi::new().with_default_response("[]");
        let mut cache = AlignmentCache::default();
        run_align(&store, &ai, &AlignConfig::default(), &mut cache)
            .await
            .unwrap();
        assert_eq!(ai.calls().len(), 1);

        // Reset statuses to re-offer the same batch.
        for id in ["reddit_00", "hn_ask_00"] {
            store
                .set_alignment(id, AlignmentStatus::Unprocessed, None)
                .await
                .unwrap();
        }
        let stats = run_align(&store, &ai, &AlignConfig::default(), &mut cache)
            .await
            .unwrap();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(ai.calls().len(), 1);
    }

    #[test]
    fn parse_is_tolerant_of_prose_and_bad_items() {
        let response = r#"Sure: [
            {"aligned_problem_id": "AP_01", "sources": ["a", "b"],
             "core_problem": "x", "cluster_names": ["n1", "n2"]},
            {"this one": "is missing required keys"}
        ] hope that helps"#;
        let alignments = parse_alignments(response);
        assert_eq!(alignments.len(), 1);
        assert_eq!(alignments[0].aligned_problem_id, "AP_01");
    }

    #[test]
    fn problem_ids_never_collide() {
        let mut existing = HashSet::new();
        existing.insert("AP_01".to_string());
        assert_eq!(unique_problem_id("AP_02", &existing), "AP_02");
        assert_eq!(unique_problem_id("AP_01", &existing), "AP_02");
        assert_eq!(unique_problem_id("garbage", &existing), "AP_02");
    }
}
