//! Viability scoring stage - reconsider every persisted opportunity.
//!
//! A configurable pre-gate abandons whole clusters that are too thin
//! to bet on (few events, one author, one subreddit, low recurrence)
//! before any model call; decisions are memoized per cluster within a
//! run. Survivors get an LLM rubric blended with rule-derived signals
//! into a weighted 0-10 score and a recommendation. When the rubric
//! comes back unusable, the mapper's own factor scores are converted
//! instead - the stage never throws away an opportunity over a parse
//! error.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::prompts::{fill, SCORE_PROMPT, SYSTEM_PROMPT};
use crate::traits::ai::{Ai, ModelRole};
use crate::traits::store::{ClusterStore, EventStore, OpportunityStore};
use crate::types::{Opportunity, ScoreStats, ScorerConfig};

/// Final-combination weights, in rubric order.
const W_PAIN_FREQUENCY: f32 = 0.15;
const W_CLEAR_BUYER: f32 = 0.15;
const W_MVP_BUILDABLE: f32 = 0.20;
const W_CROWDED_MARKET: f32 = 0.15;
const W_INTEGRATION: f32 = 0.10;
const W_MARKET_SIZE: f32 = 0.10;
const W_CLUSTER_STRENGTH: f32 = 0.10;
const W_WORKFLOW_CONFIDENCE: f32 = 0.05;

/// Components below this feed the killer-risk list.
const RISK_FLOOR: f32 = 4.0;

/// LLM rubric response.
#[derive(Debug, Deserialize)]
pub struct AiScoreResponse {
    #[serde(default)]
    pub pain_frequency: f32,
    #[serde(default)]
    pub clear_buyer: f32,
    #[serde(default)]
    pub mvp_buildable: f32,
    #[serde(default)]
    pub crowded_market: f32,
    #[serde(default)]
    pub integration: f32,
    #[serde(default)]
    pub total_score: f32,
    #[serde(default)]
    pub killer_risks: Vec<String>,
}

/// Rule-derived view of the cluster behind an opportunity.
#[derive(Debug, Clone)]
pub struct ClusterMetrics {
    pub cluster_size: usize,
    pub unique_authors: usize,
    pub cross_subreddit_count: usize,
    pub avg_frequency_score: f32,
    pub workflow_confidence: f32,
    pub subreddits: Vec<String>,
    pub aligned: bool,
}

/// Gather cluster metrics for an opportunity (real or aligned).
pub async fn cluster_metrics<S>(store: &S, opportunity: &Opportunity) -> Result<ClusterMetrics>
where
    S: ClusterStore + EventStore,
{
    if let Some(cluster) = store.get_cluster(&opportunity.cluster_id).await? {
        let ids: Vec<i64> = cluster.pain_event_ids.iter().copied().collect();
        let events = store.events_by_ids(&ids).await?;
        let posts = store.posts_for_events(&ids).await?;

        let authors: HashSet<&str> = posts
            .iter()
            .map(|p| p.author.as_str())
            .filter(|a| !a.is_empty() && *a != "[deleted]")
            .collect();
        let subreddits: HashSet<String> = posts
            .iter()
            .map(|p| {
                p.subreddit()
                    .map(str::to_string)
                    .unwrap_or_else(|| p.source.clone())
            })
            .collect();
        let avg_frequency = if events.is_empty() {
            0.0
        } else {
            events.iter().map(|e| e.frequency_score as f32).sum::<f32>() / events.len() as f32
        };

        return Ok(ClusterMetrics {
            cluster_size: cluster.size,
            unique_authors: authors.len(),
            cross_subreddit_count: subreddits.len(),
            avg_frequency_score: avg_frequency,
            workflow_confidence: cluster.workflow_confidence,
            subreddits: subreddits.into_iter().collect(),
            aligned: false,
        });
    }

    // Aligned virtual cluster: breadth comes from the sources instead.
    let problems = store.aligned_problems().await?;
    let problem = problems
        .iter()
        .find(|p| p.id == opportunity.cluster_id)
        .ok_or_else(|| crate::error::MinerError::NotFound {
            what: format!("cluster {}", opportunity.cluster_id),
        })?;
    Ok(ClusterMetrics {
        cluster_size: problem.cluster_ids.len(),
        unique_authors: problem.cluster_ids.len(),
        cross_subreddit_count: problem.sources.len(),
        avg_frequency_score: 9.0,
        workflow_confidence: 0.95,
        subreddits: problem.sources.clone(),
        aligned: true,
    })
}

/// First pre-gate the metrics violate, if any.
pub fn pre_gate_violation(metrics: &ClusterMetrics, config: &ScorerConfig) -> Option<String> {
    let gate = &config.pre_gate;
    if !gate.enabled || metrics.aligned {
        return None;
    }
    if metrics.cluster_size < gate.min_cluster_size {
        return Some(format!("cluster too small ({})", metrics.cluster_size));
    }
    if metrics.unique_authors < gate.min_unique_authors {
        return Some(format!("too few unique authors ({})", metrics.unique_authors));
    }
    if metrics.cross_subreddit_count < gate.min_cross_subreddits {
        return Some(format!(
            "too few subreddits ({})",
            metrics.cross_subreddit_count
        ));
    }
    if metrics.avg_frequency_score < gate.min_avg_frequency_score {
        return Some(format!(
            "low recurrence ({:.1})",
            metrics.avg_frequency_score
        ));
    }
    None
}

/// Market tier (9/7/5/3) from estimated addressable users.
pub fn market_tier_score(subreddits: &[String], config: &ScorerConfig) -> f32 {
    let addressable: f64 = subreddits
        .iter()
        .map(|s| {
            config
                .subreddit_members
                .get(s)
                .copied()
                .unwrap_or(config.default_members)
                * config.penetration
        })
        .sum();
    if addressable >= config.tier_large {
        9.0
    } else if addressable >= config.tier_medium {
        7.0
    } else if addressable >= config.tier_small {
        5.0
    } else {
        3.0
    }
}

/// Convert the mapper's factor scores when the rubric is unusable.
///
/// Complexity-style factors invert (`10 - x`) so everything reads as
/// "higher is better".
fn fallback_rubric(opportunity: &Opportunity) -> AiScoreResponse {
    AiScoreResponse {
        pain_frequency: opportunity.pain_frequency,
        clear_buyer: opportunity.market_size,
        mvp_buildable: 10.0 - opportunity.mvp_complexity,
        crowded_market: 10.0 - opportunity.competition_risk,
        integration: 10.0 - opportunity.integration_complexity,
        total_score: 0.0,
        killer_risks: vec![],
    }
}

/// The weighted final combination, clipped to [0,10].
pub fn combine(rubric: &AiScoreResponse, metrics: &ClusterMetrics, market_score: f32) -> f32 {
    let cluster_score = metrics.cluster_size.min(10) as f32;
    let workflow_score = metrics.workflow_confidence * 10.0;
    let total = W_PAIN_FREQUENCY * rubric.pain_frequency
        + W_CLEAR_BUYER * rubric.clear_buyer
        + W_MVP_BUILDABLE * rubric.mvp_buildable
        + W_CROWDED_MARKET * rubric.crowded_market
        + W_INTEGRATION * rubric.integration
        + W_MARKET_SIZE * market_score
        + W_CLUSTER_STRENGTH * cluster_score
        + W_WORKFLOW_CONFIDENCE * workflow_score;
    total.clamp(0.0, 10.0)
}

/// Risks derived from weak components, appended to the model's list.
fn derived_risks(rubric: &AiScoreResponse, market_score: f32) -> Vec<String> {
    let components = [
        ("pain frequency", rubric.pain_frequency),
        ("buyer clarity", rubric.clear_buyer),
        ("mvp buildability", rubric.mvp_buildable),
        ("market crowding", rubric.crowded_market),
        ("integration fit", rubric.integration),
        ("market size", market_score),
    ];
    components
        .iter()
        .filter(|(_, value)| *value < RISK_FLOOR)
        .map(|(name, value)| format!("weak {} ({:.1})", name, value))
        .collect()
}

/// Score every persisted opportunity, updating rows in place.
pub async fn run_score<S, A>(
    store: &S,
    ai: &A,
    config: &ScorerConfig,
    limit: usize,
) -> Result<ScoreStats>
where
    S: ClusterStore + EventStore + OpportunityStore,
    A: Ai,
{
    let started = Instant::now();
    let mut stats = ScoreStats::default();
    let opportunities = store.opportunities(limit).await?;

    // Cluster-level pre-gate decisions are memoized within the run.
    let mut gate_decisions: HashMap<String, Option<String>> = HashMap::new();
    let mut score_sum = 0.0f32;

    for opportunity in opportunities {
        let metrics = match cluster_metrics(store, &opportunity).await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(cluster = %opportunity.cluster_id, "metrics unavailable: {err}");
                continue;
            }
        };

        let decision = gate_decisions
            .entry(opportunity.cluster_id.clone())
            .or_insert_with(|| pre_gate_violation(&metrics, config));

        if let Some(reason) = decision {
            let mut abandoned = opportunity.clone();
            abandoned.recommendation = format!("abandon - {}", reason);
            store.update_assessment(&abandoned).await?;
            stats.pre_gate_abandoned += 1;
            continue;
        }

        let prompt = fill(
            SCORE_PROMPT,
            &[
                ("name", opportunity.name.clone()),
                ("description", opportunity.description.clone()),
                ("target_users", opportunity.target_users.clone()),
                ("missing_capability", opportunity.missing_capability.clone()),
                ("cluster_size", metrics.cluster_size.to_string()),
            ],
        );

        let rubric = match ai.chat_json(ModelRole::Main, SYSTEM_PROMPT, &prompt).await {
            Ok(response) => match serde_json::from_str::<AiScoreResponse>(&response) {
                Ok(rubric) => rubric,
                Err(err) => {
                    warn!(opportunity = %opportunity.name, "unusable rubric, using factors: {err}");
                    stats.llm_errors += 1;
                    fallback_rubric(&opportunity)
                }
            },
            Err(err) => {
                warn!(opportunity = %opportunity.name, "rubric call failed, using factors: {err}");
                stats.llm_errors += 1;
                fallback_rubric(&opportunity)
            }
        };

        let market_score = market_tier_score(&metrics.subreddits, config);
        let total = combine(&rubric, &metrics, market_score);

        let mut killer_risks = rubric.killer_risks.clone();
        killer_risks.truncate(3);
        killer_risks.extend(derived_risks(&rubric, market_score));

        let mut scored = opportunity.clone();
        scored.total_score = total;
        scored.killer_risks = killer_risks;
        scored.recommendation = Opportunity::recommendation_for(total).to_string();
        store.update_assessment(&scored).await?;

        score_sum += total;
        stats.opportunities_scored += 1;
    }

    stats.avg_total_score = if stats.opportunities_scored > 0 {
        score_sum / stats.opportunities_scored as f32
    } else {
        0.0
    };
    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        scored = stats.opportunities_scored,
        abandoned = stats.pre_gate_abandoned,
        avg = stats.avg_total_score,
        "scoring complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::SqliteStore;
    use crate::testing::{self, MockAi};
    use crate::traits::store::{ClusterStore, EventStore, OpportunityStore, PostStore};
    use crate::types::Cluster;

    fn metrics(size: usize, confidence: f32) -> ClusterMetrics {
        ClusterMetrics {
            cluster_size: size,
            unique_authors: 5,
            cross_subreddit_count: 2,
            avg_frequency_score: 7.0,
            workflow_confidence: confidence,
            subreddits: vec!["excel".into()],
            aligned: false,
        }
    }

    #[test]
    fn balanced_opportunity_scores_in_the_pursue_band() {
        // Mirrors the mapper factors 8/7/4/5/5 with cluster_size=12,
        // workflow_confidence=0.8 via the factor conversion.
        let rubric = AiScoreResponse {
            pain_frequency: 8.0,
            clear_buyer: 8.0,
            mvp_buildable: 6.0,
            crowded_market: 5.0,
            integration: 5.0,
            total_score: 0.0,
            killer_risks: vec![],
        };
        let m = metrics(12, 0.8);
        let total = combine(&rubric, &m, 9.0);
        assert!(
            (7.0..=8.5).contains(&total),
            "total was {total}"
        );
        assert!(Opportunity::recommendation_for(total).starts_with("pursue"));
    }

    #[test]
    fn combine_is_clipped_to_ten() {
        let rubric = AiScoreResponse {
            pain_frequency: 10.0,
            clear_buyer: 10.0,
            mvp_buildable: 10.0,
            crowded_market: 10.0,
            integration: 10.0,
            total_score: 0.0,
            killer_risks: vec![],
        };
        let total = combine(&rubric, &metrics(50, 1.0), 9.0);
        assert!(total <= 10.0);
    }

    #[test]
    fn market_tiers_follow_addressable_users() {
        let mut config = ScorerConfig::default();
        config
            .subreddit_members
            .insert("excel".into(), 80_000_000.0);
        config.subreddit_members.insert("niche".into(), 100_000.0);

        // 80M * 0.1% = 80k addressable -> large
        assert_eq!(market_tier_score(&["excel".into()], &config), 9.0);
        // 100k * 0.1% = 100 -> niche
        assert_eq!(market_tier_score(&["niche".into()], &config), 3.0);
    }

    #[test]
    fn weak_components_become_risks() {
        let rubric = AiScoreResponse {
            pain_frequency: 3.0,
            clear_buyer: 8.0,
            mvp_buildable: 8.0,
            crowded_market: 8.0,
            integration: 8.0,
            total_score: 0.0,
            killer_risks: vec![],
        };
        let risks = derived_risks(&rubric, 9.0);
        assert_eq!(risks.len(), 1);
        assert!(risks[0].contains("pain frequency"));
    }

    async fn seed_cluster_with_posts(
        store: &SqliteStore,
        authors: &[&str],
        subreddits: &[&str],
    ) -> Cluster {
        let mut event_ids = Vec::new();
        for (i, (author, subreddit)) in authors.iter().zip(subreddits).enumerate() {
            let fetched = crate::types::FetchedPost {
                post: testing::post_builder("reddit", &format!("p{}", i))
                    .author(*author)
                    .subreddit(*subreddit)
                    .build(),
                comments: vec![],
            };
            store.insert_post(&fetched).await.unwrap();
            let ids = store
                .insert_events(&[testing::pain_event(
                    &format!("reddit_p{}", i),
                    &format!("export failure case {}", i),
                )])
                .await
                .unwrap();
            event_ids.extend(ids);
        }
        let cluster = testing::cluster("reddit_00", "reddit", &event_ids);
        store.store_cluster(&cluster).await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn pre_gate_abandons_thin_clusters() {
        let store = SqliteStore::in_memory().await.unwrap();
        // Four events, all by the same author: fails min_unique_authors.
        seed_cluster_with_posts(
            &store,
            &["alice", "alice", "alice", "alice"],
            &["excel", "excel", "excel", "excel"],
        )
        .await;
        store
            .upsert_opportunity(&testing::opportunity("reddit_00", "Export Sentry"))
            .await
            .unwrap();

        let config = ScorerConfig {
            pre_gate: crate::types::PreGateConfig {
                min_cluster_size: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let ai = MockAi::new();
        let stats = run_score(&store, &ai, &config, 100).await.unwrap();
        assert_eq!(stats.pre_gate_abandoned, 1);
        assert!(ai.calls().is_empty());

        let all = store.opportunities(10).await.unwrap();
        assert!(all[0].recommendation.starts_with("abandon - "));
    }

    #[tokio::test]
    async fn surviving_opportunities_get_rescored_in_place() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_cluster_with_posts(
            &store,
            &["alice", "bob", "carol", "dave", "erin"],
            &["excel", "excel", "datasets", "excel", "datasets"],
        )
        .await;
        store
            .upsert_opportunity(&testing::opportunity("reddit_00", "Export Sentry"))
            .await
            .unwrap();

        let ai = MockAi::new().with_default_response(
            r#"{"pain_frequency": 8, "clear_buyer": 8, "mvp_buildable": 8,
                "crowded_market": 7, "integration": 7, "total_score": 7.8,
                "killer_risks": ["a genuinely crowded adjacent market"]}"#,
        );
        let mut config = ScorerConfig::default();
        config.subreddit_members.insert("excel".into(), 30_000_000.0);
        config
            .subreddit_members
            .insert("datasets".into(), 30_000_000.0);

        let stats = run_score(&store, &ai, &config, 100).await.unwrap();
        assert_eq!(stats.opportunities_scored, 1);

        let all = store.opportunities(10).await.unwrap();
        let scored = &all[0];
        assert!(scored.total_score > 0.0 && scored.total_score <= 10.0);
        assert!(!scored.recommendation.is_empty());
        assert!(!scored.killer_risks.is_empty());
    }

    #[tokio::test]
    async fn rubric_garbage_falls_back_to_factor_conversion() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_cluster_with_posts(
            &store,
            &["alice", "bob", "carol", "dave"],
            &["excel", "excel", "datasets", "excel"],
        )
        .await;
        store
            .upsert_opportunity(&testing::opportunity("reddit_00", "Export Sentry"))
            .await
            .unwrap();

        let ai = MockAi::new().with_default_response("not json");
        let config = ScorerConfig {
            pre_gate: crate::types::PreGateConfig {
                min_cluster_size: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let stats = run_score(&store, &ai, &config, 100).await.unwrap();
        assert_eq!(stats.llm_errors, 1);
        assert_eq!(stats.opportunities_scored, 1);

        let all = store.opportunities(10).await.unwrap();
        assert!(all[0].total_score > 0.0);
    }
}
