//! Opportunity mapping stage - one micro-tool proposal per cluster.
//!
//! Real clusters are enriched from their events and originating posts,
//! then put to the model with a brutally practical prompt. Aligned
//! virtual clusters skip the model: cross-source agreement already is
//! the signal, so their opportunity is synthesized with fixed high
//! frequency/market scores. A rubric gate drops weak proposals before
//! they ever reach the scorer.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::prompts::{fill, OPPORTUNITY_PROMPT, SYSTEM_PROMPT};
use crate::traits::ai::{Ai, ModelRole};
use crate::traits::store::{ClusterStore, EventStore, OpportunityStore};
use crate::types::{
    AlignmentStatus, Cluster, ClusterLike, MapStats, MapperConfig, Opportunity,
};

/// Quality score granted to synthesized cross-source opportunities.
const ALIGNED_QUALITY: f32 = 0.95;
/// Fixed frequency/market scores for aligned virtual clusters.
const ALIGNED_FREQUENCY: f32 = 9.0;
const ALIGNED_MARKET: f32 = 9.0;

/// Aggregated context for one real cluster.
#[derive(Debug, Default)]
pub struct ClusterEnrichment {
    /// Posts per subreddit (or source for non-reddit)
    pub subreddit_distribution: BTreeMap<String, usize>,
    pub merged_tools: Vec<String>,
    pub emotional_signals: BTreeMap<String, usize>,
    pub avg_frequency_score: f32,
    pub representative_problems: Vec<String>,
    pub representative_workarounds: Vec<String>,
    pub total_pain_score: f32,
}

/// Load and aggregate a cluster's events and posts.
pub async fn enrich_cluster<S>(store: &S, cluster: &Cluster) -> Result<ClusterEnrichment>
where
    S: EventStore,
{
    let ids: Vec<i64> = cluster.pain_event_ids.iter().copied().collect();
    let events = store.events_by_ids(&ids).await?;
    let posts = store.posts_for_events(&ids).await?;

    let mut enrichment = ClusterEnrichment::default();

    for post in &posts {
        let community = post
            .subreddit()
            .map(str::to_string)
            .unwrap_or_else(|| post.source.clone());
        *enrichment.subreddit_distribution.entry(community).or_default() += 1;
    }

    let mut frequency_sum = 0u32;
    for event in &events {
        for tool in &event.mentioned_tools {
            if !enrichment
                .merged_tools
                .iter()
                .any(|t| t.eq_ignore_ascii_case(tool))
            {
                enrichment.merged_tools.push(tool.clone());
            }
        }
        if let Some(signal) = &event.emotional_signal {
            *enrichment
                .emotional_signals
                .entry(signal.clone())
                .or_default() += 1;
        }
        frequency_sum += event.frequency_score as u32;
        enrichment.total_pain_score += event.post_pain_score;

        if !enrichment
            .representative_problems
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&event.problem))
        {
            enrichment.representative_problems.push(event.problem.clone());
        }
        if let Some(workaround) = &event.current_workaround {
            if !enrichment
                .representative_workarounds
                .iter()
                .any(|w| w.eq_ignore_ascii_case(workaround))
            {
                enrichment
                    .representative_workarounds
                    .push(workaround.clone());
            }
        }
    }
    enrichment.representative_problems.truncate(5);
    enrichment.representative_workarounds.truncate(5);
    enrichment.avg_frequency_score = if events.is_empty() {
        0.0
    } else {
        frequency_sum as f32 / events.len() as f32
    };
    Ok(enrichment)
}

/// Model response for a real cluster.
#[derive(Debug, Deserialize)]
pub struct AiOpportunityResponse {
    #[serde(default)]
    pub current_tools: Vec<String>,
    #[serde(default)]
    pub missing_capability: String,
    #[serde(default)]
    pub why_existing_fail: String,
    pub opportunity: AiOpportunity,
}

#[derive(Debug, Deserialize)]
pub struct AiOpportunity {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_users: String,
    #[serde(default)]
    pub pain_frequency: f32,
    #[serde(default)]
    pub market_size: f32,
    #[serde(default)]
    pub mvp_complexity: f32,
    #[serde(default)]
    pub competition_risk: f32,
    #[serde(default)]
    pub integration_complexity: f32,
}

/// Mapper-internal quality rubric, capped at 1.0.
///
/// Low complexity and low competition score high; clusters of ten or
/// more earn the full size bonus.
pub fn quality_score(
    pain_frequency: f32,
    market_size: f32,
    mvp_complexity: f32,
    competition_risk: f32,
    integration_complexity: f32,
    cluster_size: usize,
) -> f32 {
    let size_bonus = 0.10 * (cluster_size.min(10) as f32 / 10.0);
    let score = 0.20 * (pain_frequency / 10.0)
        + 0.20 * (market_size / 10.0)
        + 0.25 * ((10.0 - mvp_complexity) / 10.0)
        + 0.20 * ((10.0 - competition_risk) / 10.0)
        + 0.15 * ((10.0 - integration_complexity) / 10.0)
        + size_bonus;
    score.min(1.0)
}

/// Rule-based tool extraction for aligned problems.
fn aligned_tools(problem: &crate::types::AlignedProblem) -> Vec<String> {
    let mut haystack = problem.core_problem.to_lowercase();
    for evidence in &problem.evidence {
        haystack.push(' ');
        haystack.push_str(&evidence.quote.to_lowercase());
    }
    ["slack", "email", "discord"]
        .iter()
        .filter(|tool| haystack.contains(**tool))
        .map(|tool| tool.to_string())
        .collect()
}

/// Synthesize the opportunity for an aligned virtual cluster.
fn synthesize_aligned(problem: &crate::types::AlignedProblem, supporting: usize) -> Opportunity {
    let insights = problem
        .sources
        .iter()
        .map(|s| format!("seen on {}", s))
        .collect::<Vec<_>>()
        .join(", ");
    Opportunity {
        id: None,
        cluster_id: problem.id.clone(),
        source_type: "aligned".into(),
        name: format!("Cross-platform: {}", problem.core_problem),
        description: format!(
            "{} The same problem surfaces independently across {} communities ({}), \
             backed by {} workflow clusters.",
            problem.core_problem,
            problem.sources.len(),
            insights,
            supporting
        ),
        target_users: format!("users across {}", problem.sources.join(" and ")),
        current_tools: aligned_tools(problem),
        missing_capability: problem.core_problem.clone(),
        why_existing_fail: problem.why_they_look_different.clone(),
        pain_frequency: ALIGNED_FREQUENCY,
        market_size: ALIGNED_MARKET,
        mvp_complexity: 5.0,
        competition_risk: 5.0,
        integration_complexity: 5.0,
        total_score: ALIGNED_QUALITY,
        killer_risks: vec![],
        recommendation: String::new(),
    }
}

/// Map every cluster (real or aligned virtual) to an opportunity.
pub async fn run_map<S, A>(
    store: &S,
    ai: &A,
    config: &MapperConfig,
    limit_clusters: usize,
) -> Result<MapStats>
where
    S: EventStore + ClusterStore + OpportunityStore,
    A: Ai,
{
    let started = Instant::now();
    let mut stats = MapStats::default();

    let clusters = store.clusters().await?;
    let problems = store.aligned_problems().await?;

    let mut worklist: Vec<ClusterLike> = Vec::new();
    // Aligned members are represented by their virtual cluster, not
    // individually.
    for cluster in &clusters {
        if cluster.alignment_status != AlignmentStatus::Aligned {
            worklist.push(ClusterLike::Real(cluster.clone()));
        }
    }
    for problem in &problems {
        let supporting: Vec<Cluster> = clusters
            .iter()
            .filter(|c| problem.cluster_ids.contains(&c.id))
            .cloned()
            .collect();
        worklist.push(ClusterLike::Aligned {
            problem: problem.clone(),
            supporting,
        });
    }
    worklist.truncate(limit_clusters);
    stats.clusters_considered = worklist.len();

    for item in &worklist {
        match item {
            ClusterLike::Real(cluster) => {
                match map_real_cluster(store, ai, config, cluster).await {
                    Ok(true) => stats.opportunities_persisted += 1,
                    Ok(false) => stats.dropped_below_quality += 1,
                    Err(err) => {
                        warn!(cluster = %cluster.id, "mapping failed: {err}");
                        stats.llm_errors += 1;
                    }
                }
            }
            ClusterLike::Aligned {
                problem,
                supporting,
            } => {
                let opportunity = synthesize_aligned(problem, supporting.len());
                store.upsert_opportunity(&opportunity).await?;
                stats.opportunities_persisted += 1;
            }
        }
    }

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        considered = stats.clusters_considered,
        persisted = stats.opportunities_persisted,
        dropped = stats.dropped_below_quality,
        "opportunity mapping complete"
    );
    Ok(stats)
}

async fn map_real_cluster<S, A>(
    store: &S,
    ai: &A,
    config: &MapperConfig,
    cluster: &Cluster,
) -> Result<bool>
where
    S: EventStore + OpportunityStore,
    A: Ai,
{
    let enrichment = enrich_cluster(store, cluster).await?;

    let prompt = fill(
        OPPORTUNITY_PROMPT,
        &[
            ("size", cluster.size.to_string()),
            ("summary", cluster.centroid_summary.clone()),
            (
                "problems",
                enrichment.representative_problems.join("\n- "),
            ),
            (
                "workarounds",
                enrichment.representative_workarounds.join("\n- "),
            ),
            ("tools", enrichment.merged_tools.join(", ")),
            (
                "communities",
                enrichment
                    .subreddit_distribution
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            (
                "avg_frequency",
                format!("{:.1}", enrichment.avg_frequency_score),
            ),
        ],
    );

    let response = ai.chat_json(ModelRole::Main, SYSTEM_PROMPT, &prompt).await?;
    let parsed: AiOpportunityResponse = serde_json::from_str(&response)?;
    let proposal = parsed.opportunity;

    // Required fields; a nameless proposal is an invariant violation.
    if proposal.name.trim().is_empty() || proposal.description.trim().is_empty() {
        return Ok(false);
    }

    let clamp = |v: f32| v.clamp(1.0, 10.0);
    let pain_frequency = clamp(proposal.pain_frequency);
    let market_size = clamp(proposal.market_size);
    let mvp_complexity = clamp(proposal.mvp_complexity);
    let competition_risk = clamp(proposal.competition_risk);
    let integration_complexity = clamp(proposal.integration_complexity);

    let quality = quality_score(
        pain_frequency,
        market_size,
        mvp_complexity,
        competition_risk,
        integration_complexity,
        cluster.size,
    );
    if quality < config.min_quality {
        return Ok(false);
    }

    let opportunity = Opportunity {
        id: None,
        cluster_id: cluster.id.clone(),
        source_type: cluster.source_type.clone(),
        name: proposal.name,
        description: proposal.description,
        target_users: proposal.target_users,
        current_tools: parsed.current_tools,
        missing_capability: parsed.missing_capability,
        why_existing_fail: parsed.why_existing_fail,
        pain_frequency,
        market_size,
        mvp_complexity,
        competition_risk,
        integration_complexity,
        total_score: quality,
        killer_risks: vec![],
        recommendation: String::new(),
    };
    store.upsert_opportunity(&opportunity).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::SqliteStore;
    use crate::testing::{self, MockAi};
    use crate::traits::store::{ClusterStore, EventStore, OpportunityStore, PostStore};

    const OPPORTUNITY_JSON: &str = r#"{
        "current_tools": ["excel"],
        "missing_capability": "resumable exports",
        "why_existing_fail": "built for small sheets",
        "opportunity": {
            "name": "Export Sentry",
            "description": "Watches long exports and resumes them on failure.",
            "target_users": "analysts",
            "pain_frequency": 8,
            "market_size": 7,
            "mvp_complexity": 3,
            "competition_risk": 4,
            "integration_complexity": 3
        }
    }"#;

    async fn seed_real_cluster(store: &SqliteStore, size: usize) -> Cluster {
        store
            .insert_post(&testing::fetched_post("reddit", "p1", 0))
            .await
            .unwrap();
        let events: Vec<_> = (0..size)
            .map(|i| testing::pain_event("reddit_p1", &format!("export problem number {}", i)))
            .collect();
        let ids = store.insert_events(&events).await.unwrap();
        let cluster = testing::cluster("reddit_00", "reddit", &ids);
        store.store_cluster(&cluster).await.unwrap();
        cluster
    }

    #[test]
    fn quality_rubric_matches_the_weights() {
        // All-perfect components with a big cluster cap at 1.0.
        assert_eq!(quality_score(10.0, 10.0, 1.0, 1.0, 1.0, 20), 1.0);
        // A mediocre proposal lands under the 0.4 gate.
        let weak = quality_score(2.0, 2.0, 9.0, 9.0, 9.0, 2);
        assert!(weak < 0.4);
        // The example from a balanced proposal stays in range.
        let mid = quality_score(8.0, 7.0, 4.0, 5.0, 5.0, 12);
        assert!((0.4..=1.0).contains(&mid));
    }

    #[tokio::test]
    async fn real_cluster_maps_through_the_model() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_real_cluster(&store, 4).await;

        let ai = MockAi::new().with_default_response(OPPORTUNITY_JSON);
        let stats = run_map(&store, &ai, &MapperConfig::default(), 100).await.unwrap();
        assert_eq!(stats.opportunities_persisted, 1);

        let all = store.opportunities(10).await.unwrap();
        assert_eq!(all.len(), 1);
        let opportunity = &all[0];
        assert_eq!(opportunity.name, "Export Sentry");
        assert_eq!(opportunity.cluster_id, "reddit_00");
        // Mapper-stage total_score is the 0-1 rubric value.
        assert!((0.0..=1.0).contains(&opportunity.total_score));
        assert!(opportunity.recommendation.is_empty());
        assert!(opportunity.killer_risks.is_empty());

        // The prompt carried the enrichment.
        let calls = ai.calls();
        assert!(calls[0].user_prompt.contains("export problem number"));
        assert!(calls[0].user_prompt.contains("excel"));
    }

    #[tokio::test]
    async fn weak_proposals_are_dropped() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_real_cluster(&store, 4).await;

        let weak = r#"{
            "opportunity": {
                "name": "Meh", "description": "A thing.", "target_users": "anyone",
                "pain_frequency": 2, "market_size": 2, "mvp_complexity": 9,
                "competition_risk": 9, "integration_complexity": 9
            }
        }"#;
        let ai = MockAi::new().with_default_response(weak);
        let stats = run_map(&store, &ai, &MapperConfig::default(), 100).await.unwrap();
        assert_eq!(stats.opportunities_persisted, 0);
        assert_eq!(stats.dropped_below_quality, 1);
        assert!(store.opportunities(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn aligned_problems_synthesize_without_the_model() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut reddit = testing::cluster("reddit_00", "reddit", &[1, 2, 3, 4]);
        reddit.alignment_status = AlignmentStatus::Aligned;
        reddit.aligned_problem_id = Some("AP_01".into());
        let mut hn = testing::cluster("hn_ask_00", "hn_ask", &[5, 6, 7, 8]);
        hn.alignment_status = AlignmentStatus::Aligned;
        hn.aligned_problem_id = Some("AP_01".into());
        store.store_cluster(&reddit).await.unwrap();
        store.store_cluster(&hn).await.unwrap();

        let mut problem = testing::aligned_problem("AP_01", &["reddit", "hn_ask"]);
        problem.core_problem = "notifications drown real alerts in slack and email".into();
        store.store_aligned_problem(&problem).await.unwrap();

        let ai = MockAi::new();
        let stats = run_map(&store, &ai, &MapperConfig::default(), 100).await.unwrap();
        assert_eq!(stats.opportunities_persisted, 1);
        assert!(ai.calls().is_empty());

        let all = store.opportunities(10).await.unwrap();
        let opportunity = &all[0];
        assert_eq!(opportunity.cluster_id, "AP_01");
        assert_eq!(opportunity.source_type, "aligned");
        assert_eq!(opportunity.pain_frequency, 9.0);
        assert_eq!(opportunity.market_size, 9.0);
        assert!((opportunity.total_score - 0.95).abs() < 1e-6);
        assert!(opportunity.current_tools.contains(&"slack".to_string()));
        assert!(opportunity.current_tools.contains(&"email".to_string()));
    }

    #[tokio::test]
    async fn rerun_overwrites_the_same_cluster() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_real_cluster(&store, 4).await;
        let ai = MockAi::new().with_default_response(OPPORTUNITY_JSON);

        run_map(&store, &ai, &MapperConfig::default(), 100).await.unwrap();
        run_map(&store, &ai, &MapperConfig::default(), 100).await.unwrap();
        assert_eq!(store.opportunities(10).await.unwrap().len(), 1);
    }
}
