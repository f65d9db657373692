//! Clustering stage - density-based grouping within each source.
//!
//! Sources are clustered separately to preserve discourse style;
//! cross-source merging is the aligner's job. Density clustering runs
//! over cosine distance; surviving groups are validated by the model
//! ("do these describe the same workflow?") and then summarized.
//! Clusters are rebuilt from scratch each run, so ids stay monotone by
//! creation order within a source.

use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::prompts::{
    fill, format_event_list, CLUSTER_SUMMARIZE_PROMPT, CLUSTER_VALIDATE_PROMPT, SYSTEM_PROMPT,
};
use crate::traits::ai::{Ai, ModelRole};
use crate::traits::store::{cosine_distance, ClusterStore, EventStore};
use crate::types::{AlignmentStatus, Cluster, ClusterConfig, ClusterStats, PainEvent};

/// Density-based clustering over cosine distance.
///
/// Returns one label per vector; `None` marks noise. Neighborhoods
/// count the point itself, so `min_samples = 2` means "one similar
/// neighbor suffices".
pub fn dbscan(vectors: &[Vec<f32>], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let n = vectors.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_label = 0usize;

    let region = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| cosine_distance(&vectors[i], &vectors[j]) <= eps)
            .collect()
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let neighbors = region(i);
        if neighbors.len() < min_samples {
            continue; // noise, unless claimed by a later core point
        }

        labels[i] = Some(next_label);
        let mut queue: VecDeque<usize> = neighbors.into();
        while let Some(j) = queue.pop_front() {
            if !visited[j] {
                visited[j] = true;
                let expansion = region(j);
                if expansion.len() >= min_samples {
                    queue.extend(expansion);
                }
            }
            if labels[j].is_none() {
                labels[j] = Some(next_label);
            }
        }
        next_label += 1;
    }
    labels
}

/// Model verdict on whether sampled events share one workflow.
#[derive(Debug, Deserialize)]
pub struct WorkflowValidation {
    pub same_workflow: bool,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reason: String,
}

/// Model summary of an accepted cluster.
#[derive(Debug, Deserialize)]
pub struct ClusterSummary {
    #[serde(default)]
    pub centroid_summary: String,
    #[serde(default)]
    pub common_pain: String,
    #[serde(default)]
    pub common_context: String,
    #[serde(default)]
    pub example_events: Vec<String>,
    #[serde(default)]
    pub coherence_score: f32,
}

/// Rule-based summary used when the summarizer output is unusable.
fn fallback_summary(problems: &[String]) -> ClusterSummary {
    ClusterSummary {
        centroid_summary: problems.first().cloned().unwrap_or_default(),
        common_pain: problems.first().cloned().unwrap_or_default(),
        common_context: String::new(),
        example_events: problems.iter().take(3).cloned().collect(),
        coherence_score: 0.5,
    }
}

/// Run density clustering, validation and summarization per source.
pub async fn run_cluster<S, A>(store: &S, ai: &A, config: &ClusterConfig) -> Result<ClusterStats>
where
    S: EventStore + ClusterStore,
    A: Ai,
{
    let started = Instant::now();
    let mut stats = ClusterStats::default();
    let embedded = store.embedded_events(ai.embedding_model()).await?;
    stats.events_considered = embedded.len();

    // Group by source, deterministically ordered.
    let mut by_source: BTreeMap<String, Vec<(PainEvent, Vec<f32>)>> = BTreeMap::new();
    for (event, source, vector) in embedded {
        by_source.entry(source).or_default().push((event, vector));
    }

    for (source, members) in by_source {
        store.clear_clusters_for_source(&source).await?;
        let params = config.params_for(&source);
        let vectors: Vec<Vec<f32>> = members.iter().map(|(_, v)| v.clone()).collect();
        let labels = dbscan(&vectors, params.eps, params.min_samples);

        // Collect clusters in first-appearance order.
        let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
        for (index, label) in labels.iter().enumerate() {
            match label {
                Some(label) => match groups.iter_mut().find(|(l, _)| l == label) {
                    Some((_, indices)) => indices.push(index),
                    None => groups.push((*label, vec![index])),
                },
                None => stats.noise_events += 1,
            }
        }

        let mut cluster_index = store.cluster_count(&source).await?;
        for (_, indices) in groups {
            if indices.len() < config.min_cluster_size {
                stats.clusters_below_floor += 1;
                continue;
            }

            let events: Vec<&PainEvent> = indices.iter().map(|&i| &members[i].0).collect();
            let sample: Vec<String> = events
                .iter()
                .take(config.llm_sample_size)
                .map(|e| e.problem.clone())
                .collect();

            let Some(validation) = validate_workflow(ai, &sample).await else {
                stats.clusters_rejected_llm += 1;
                continue;
            };
            if !validation.same_workflow {
                stats.clusters_rejected_llm += 1;
                continue;
            }

            let summary = summarize_cluster(ai, &validation.workflow_name, &sample)
                .await
                .unwrap_or_else(|| fallback_summary(&sample));

            let cluster = Cluster {
                id: Cluster::make_id(&source, cluster_index),
                name: validation.workflow_name.clone(),
                source_type: source.clone(),
                centroid_summary: summary.centroid_summary,
                common_pain: summary.common_pain,
                common_context: summary.common_context,
                example_events: summary.example_events,
                coherence_score: summary.coherence_score.clamp(0.0, 1.0),
                pain_event_ids: events.iter().filter_map(|e| e.id).collect(),
                size: events.len(),
                workflow_confidence: validation.confidence.clamp(0.0, 1.0),
                alignment_status: AlignmentStatus::Unprocessed,
                aligned_problem_id: None,
                created_at: chrono::Utc::now(),
            };
            store.store_cluster(&cluster).await?;
            stats.clusters_formed += 1;
            cluster_index += 1;
        }
    }

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        considered = stats.events_considered,
        formed = stats.clusters_formed,
        noise = stats.noise_events,
        "clustering complete"
    );
    Ok(stats)
}

async fn validate_workflow<A: Ai>(ai: &A, problems: &[String]) -> Option<WorkflowValidation> {
    let prompt = fill(
        CLUSTER_VALIDATE_PROMPT,
        &[("events", format_event_list(problems))],
    );
    let response = match ai.chat_json(ModelRole::Main, SYSTEM_PROMPT, &prompt).await {
        Ok(response) => response,
        Err(err) => {
            warn!("workflow validation call failed: {err}");
            return None;
        }
    };
    match serde_json::from_str(&response) {
        Ok(validation) => Some(validation),
        Err(err) => {
            warn!("unparseable workflow validation: {err}");
            None
        }
    }
}

async fn summarize_cluster<A: Ai>(
    ai: &A,
    workflow_name: &str,
    problems: &[String],
) -> Option<ClusterSummary> {
    let prompt = fill(
        CLUSTER_SUMMARIZE_PROMPT,
        &[
            ("workflow_name", workflow_name.to_string()),
            ("events", format_event_list(problems)),
        ],
    );
    let response = match ai.chat_json(ModelRole::Medium, SYSTEM_PROMPT, &prompt).await {
        Ok(response) => response,
        Err(err) => {
            warn!("cluster summarization call failed: {err}");
            return None;
        }
    };
    serde_json::from_str(&response).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::SqliteStore;
    use crate::testing::{self, MockAi};
    use crate::traits::store::{ClusterStore, EventStore, PostStore};

    #[test]
    fn dbscan_groups_similar_vectors_and_drops_outliers() {
        // Three near-identical directions and one orthogonal outlier.
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.99, 0.05, 0.0],
            vec![0.98, 0.08, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        let labels = dbscan(&vectors, 0.3, 2);
        assert_eq!(labels[0], Some(0));
        assert_eq!(labels[1], Some(0));
        assert_eq!(labels[2], Some(0));
        assert_eq!(labels[3], None);
    }

    #[test]
    fn dbscan_separates_distinct_groups() {
        let vectors = vec![
            vec![1.0, 0.0],
            vec![0.99, 0.01],
            vec![0.0, 1.0],
            vec![0.01, 0.99],
        ];
        let labels = dbscan(&vectors, 0.1, 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn dbscan_respects_min_samples() {
        let vectors = vec![vec![1.0, 0.0], vec![0.99, 0.01]];
        let labels = dbscan(&vectors, 0.1, 3);
        assert_eq!(labels, vec![None, None]);
    }

    fn validation_json(name: &str, accept: bool) -> String {
        format!(
            r#"{{"same_workflow": {}, "workflow_name": "{}", "description": "d",
                "confidence": 0.85, "reason": "same activity"}}"#,
            accept, name
        )
    }

    const SUMMARY_JSON: &str = r#"{
        "centroid_summary": "exports break during reporting",
        "common_pain": "unreliable exports",
        "common_context": "recurring reporting",
        "example_events": ["exports crash on big files"],
        "coherence_score": 0.9
    }"#;

    async fn seed_events(
        store: &SqliteStore,
        count: usize,
        base: &str,
        vector: Vec<f32>,
    ) -> Vec<i64> {
        store
            .insert_post(&testing::fetched_post("reddit", base, 0))
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let event = testing::pain_event(
                &format!("reddit_{}", base),
                &format!("{} variant {}", base, i),
            );
            let id = store.insert_events(&[event]).await.unwrap()[0];
            let mut v = vector.clone();
            // Tiny per-event wobble keeps vectors distinct but close.
            v[0] += i as f32 * 0.001;
            store
                .store_embedding(id, "mock-embedding", &v)
                .await
                .unwrap();
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn validated_clusters_are_persisted_with_stable_ids() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_events(&store, 5, "exports keep crashing", vec![1.0, 0.0, 0.0, 0.0]).await;

        let ai = MockAi::new()
            .with_response("same underlying workflow", validation_json("Export recovery", true))
            .with_response("Summarize this group", SUMMARY_JSON);

        let stats = run_cluster(&store, &ai, &ClusterConfig::default()).await.unwrap();
        assert_eq!(stats.clusters_formed, 1);

        let clusters = store.clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.id, "reddit_00");
        assert_eq!(cluster.name, "Export recovery");
        assert_eq!(cluster.size, 5);
        assert_eq!(cluster.size, cluster.pain_event_ids.len());
        assert!((cluster.workflow_confidence - 0.85).abs() < 1e-6);
        assert_eq!(cluster.alignment_status, AlignmentStatus::Unprocessed);
    }

    #[tokio::test]
    async fn clusters_below_the_floor_are_dropped() {
        let store = SqliteStore::in_memory().await.unwrap();
        // Three similar events: a valid DBSCAN cluster, but under the
        // four-event persistence floor.
        seed_events(&store, 3, "exports keep crashing", vec![1.0, 0.0, 0.0, 0.0]).await;

        let ai = MockAi::new()
            .with_default_response(validation_json("anything", true));
        let stats = run_cluster(&store, &ai, &ClusterConfig::default()).await.unwrap();
        assert_eq!(stats.clusters_formed, 0);
        assert_eq!(stats.clusters_below_floor, 1);
    }

    #[tokio::test]
    async fn llm_rejection_discards_the_cluster() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_events(&store, 4, "mixed bag of complaints", vec![1.0, 0.0, 0.0, 0.0]).await;

        let ai = MockAi::new()
            .with_response("same underlying workflow", validation_json("n/a", false));
        let stats = run_cluster(&store, &ai, &ClusterConfig::default()).await.unwrap();
        assert_eq!(stats.clusters_formed, 0);
        assert_eq!(stats.clusters_rejected_llm, 1);
        assert!(store.clusters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerun_rebuilds_rather_than_duplicates() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_events(&store, 4, "exports keep crashing", vec![1.0, 0.0, 0.0, 0.0]).await;

        let ai = MockAi::new()
            .with_response("same underlying workflow", validation_json("Export recovery", true))
            .with_response("Summarize this group", SUMMARY_JSON);

        run_cluster(&store, &ai, &ClusterConfig::default()).await.unwrap();
        run_cluster(&store, &ai, &ClusterConfig::default()).await.unwrap();

        let clusters = store.clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, "reddit_00");
    }

    #[tokio::test]
    async fn summarizer_garbage_falls_back_to_rules() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_events(&store, 4, "exports keep crashing", vec![1.0, 0.0, 0.0, 0.0]).await;

        let ai = MockAi::new()
            .with_response("same underlying workflow", validation_json("Export recovery", true))
            .with_response("Summarize this group", "not json at all");

        let stats = run_cluster(&store, &ai, &ClusterConfig::default()).await.unwrap();
        assert_eq!(stats.clusters_formed, 1);
        let clusters = store.clusters().await.unwrap();
        assert!((clusters[0].coherence_score - 0.5).abs() < 1e-6);
        assert!(!clusters[0].centroid_summary.is_empty());
    }
}
