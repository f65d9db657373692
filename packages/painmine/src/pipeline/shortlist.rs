//! Decision shortlist stage - the 3-5 items a human actually reads.
//!
//! Hard filters first (viability, cluster size, trust, ignore list),
//! then cross-source validation boosts, then a log-scaled final score
//! so a huge cluster cannot drown out everything else. Selection is
//! all-or-nothing: fewer than three survivors means an empty list and
//! a report naming the filter that bit hardest. Phrasing comes from
//! the small model with one retry and a template fallback.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::prompts::{fill, truncate_ellipsis, SHORTLIST_CONTENT_PROMPT, SYSTEM_PROMPT};
use crate::pipeline::score::{cluster_metrics, ClusterMetrics};
use crate::traits::ai::{Ai, ModelRole};
use crate::traits::store::{ClusterStore, EventStore, OpportunityStore};
use crate::types::{
    Opportunity, ShortlistConfig, ShortlistEntry, ShortlistReport, ShortlistStats,
};

/// Character caps for the generated strings.
const PROBLEM_MAX: usize = 200;
const MVP_MAX: usize = 150;
const WHY_NOW_MAX: usize = 150;

/// Cross-source validation boost levels.
const BOOST_ALIGNED: f32 = 2.0;
const BOOST_BROAD: f32 = 1.0;
const BOOST_MODERATE: f32 = 0.5;

#[derive(Debug, Deserialize)]
struct AiShortlistContent {
    problem: String,
    mvp: String,
    why_now: String,
}

/// One opportunity that survived the hard filters.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub opportunity: Opportunity,
    pub metrics: ClusterMetrics,
    pub trust_level: f32,
    pub boost: f32,
    pub final_score: f32,
}

/// Trust for an opportunity: dominant subreddit override, else source.
pub fn trust_level(
    opportunity: &Opportunity,
    metrics: &ClusterMetrics,
    config: &ShortlistConfig,
) -> f32 {
    for subreddit in &metrics.subreddits {
        if let Some(trust) = config.subreddit_trust.get(subreddit) {
            return *trust;
        }
    }
    config
        .source_trust
        .get(&opportunity.source_type)
        .copied()
        .unwrap_or(0.5)
}

/// Cross-source validation boost (0.0, 0.5, 1.0 or 2.0).
///
/// Aligned clusters earn Level 1 regardless of size; the size levels
/// reward breadth across communities.
pub fn cross_source_boost(
    opportunity: &Opportunity,
    metrics: &ClusterMetrics,
    aligned_member_ids: &[String],
) -> f32 {
    if opportunity.source_type == "aligned"
        || aligned_member_ids.iter().any(|id| id == &opportunity.cluster_id)
    {
        return BOOST_ALIGNED;
    }
    if metrics.cluster_size >= 10 && metrics.cross_subreddit_count >= 3 {
        return BOOST_BROAD;
    }
    if metrics.cluster_size >= 8 && metrics.cross_subreddit_count >= 2 {
        return BOOST_MODERATE;
    }
    0.0
}

/// Log-scaled final score, clamped to [0,10].
pub fn final_score(viability: f32, cluster_size: usize, trust: f32, boost: f32) -> f32 {
    let size_factor = (cluster_size.max(1) as f32).log10() * 2.5;
    let mut score = viability + size_factor + trust * 1.5;
    if boost > 0.0 {
        score += 5.0 * boost * 0.1;
    }
    score.clamp(0.0, 10.0)
}

/// Apply diversity penalties to an already-sorted candidate list.
fn diversity_pass(candidates: &mut [Candidate]) {
    for i in 1..candidates.len() {
        let mut penalty = 1.0f32;
        for j in 0..i {
            let (earlier, later) = (&candidates[j], &candidates[i]);
            if earlier.opportunity.cluster_id == later.opportunity.cluster_id {
                penalty *= 0.7;
            } else if earlier.opportunity.source_type == later.opportunity.source_type
                && keyword_overlap(&earlier.opportunity, &later.opportunity) >= 0.6
            {
                penalty *= 0.90;
            } else if same_pain_type(&earlier.opportunity, &later.opportunity) {
                penalty *= 0.85;
            }
        }
        candidates[i].final_score = (candidates[i].final_score * penalty).clamp(0.0, 10.0);
    }
    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn keyword_set(opportunity: &Opportunity) -> Vec<String> {
    format!("{} {}", opportunity.name, opportunity.missing_capability)
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect()
}

fn keyword_overlap(a: &Opportunity, b: &Opportunity) -> f32 {
    let set_a = keyword_set(a);
    let set_b = keyword_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let shared = set_a.iter().filter(|w| set_b.contains(w)).count();
    shared as f32 / set_a.len().min(set_b.len()) as f32
}

fn same_pain_type(a: &Opportunity, b: &Opportunity) -> bool {
    // Tool overlap is the observable proxy for pain-type overlap at
    // this stage; mapped opportunities carry their cluster's tools.
    !a.current_tools.is_empty()
        && a.current_tools
            .iter()
            .any(|t| b.current_tools.iter().any(|u| u.eq_ignore_ascii_case(t)))
}

/// Template fallback when content generation fails twice.
fn template_content(candidate: &Candidate) -> (String, String, String) {
    let opportunity = &candidate.opportunity;
    let communities = candidate.metrics.subreddits.join(", ");
    let problem = truncate_ellipsis(
        &format!(
            "Users in {} struggle with {} because existing tools fall short",
            communities, opportunity.missing_capability
        ),
        PROBLEM_MAX,
    );
    let mvp = truncate_ellipsis(
        &format!("A minimal tool that delivers {}", opportunity.missing_capability),
        MVP_MAX,
    );
    let why_now = truncate_ellipsis(
        &format!(
            "{} similar complaints across {} communities keep recurring",
            candidate.metrics.cluster_size,
            candidate.metrics.subreddits.len().max(1)
        ),
        WHY_NOW_MAX,
    );
    (problem, mvp, why_now)
}

async fn generate_content<A: Ai>(
    ai: &A,
    candidate: &Candidate,
) -> Option<(String, String, String)> {
    let opportunity = &candidate.opportunity;
    let prompt = fill(
        SHORTLIST_CONTENT_PROMPT,
        &[
            ("name", opportunity.name.clone()),
            ("description", opportunity.description.clone()),
            ("communities", candidate.metrics.subreddits.join(", ")),
            ("pain", opportunity.missing_capability.clone()),
        ],
    );

    // One retry on invalid JSON, then the caller falls back.
    for attempt in 0..2 {
        let response = match ai.chat_json(ModelRole::Small, SYSTEM_PROMPT, &prompt).await {
            Ok(response) => response,
            Err(err) => {
                warn!(attempt, "content generation failed: {err}");
                continue;
            }
        };
        match serde_json::from_str::<AiShortlistContent>(&response) {
            Ok(content) => {
                return Some((
                    truncate_ellipsis(&content.problem, PROBLEM_MAX),
                    truncate_ellipsis(&content.mvp, MVP_MAX),
                    truncate_ellipsis(&content.why_now, WHY_NOW_MAX),
                ));
            }
            Err(err) => warn!(attempt, "invalid content payload: {err}"),
        }
    }
    None
}

/// Build the decision shortlist.
pub async fn run_shortlist<S, A>(
    store: &S,
    ai: &A,
    config: &ShortlistConfig,
    report_limit: usize,
) -> Result<(ShortlistReport, ShortlistStats)>
where
    S: ClusterStore + EventStore + OpportunityStore,
    A: Ai,
{
    let started = Instant::now();
    let mut stats = ShortlistStats::default();

    let opportunities = store.opportunities(report_limit).await?;
    stats.considered = opportunities.len();

    let aligned_member_ids: Vec<String> = store
        .aligned_problems()
        .await?
        .into_iter()
        .flat_map(|p| p.cluster_ids)
        .collect();

    // 1. Hard filters, counting rejections per filter.
    let mut rejected_by: HashMap<&'static str, usize> = HashMap::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for opportunity in opportunities {
        let metrics = match cluster_metrics(store, &opportunity).await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(cluster = %opportunity.cluster_id, "metrics unavailable: {err}");
                *rejected_by.entry("missing_cluster").or_default() += 1;
                continue;
            }
        };

        if opportunity.total_score < config.min_viability {
            *rejected_by.entry("viability").or_default() += 1;
            continue;
        }
        if metrics.cluster_size < config.min_cluster_size {
            *rejected_by.entry("cluster_size").or_default() += 1;
            continue;
        }
        let trust = trust_level(&opportunity, &metrics, config);
        if trust < config.min_trust {
            *rejected_by.entry("trust_level").or_default() += 1;
            continue;
        }
        let cluster_name = store
            .get_cluster(&opportunity.cluster_id)
            .await?
            .map(|c| c.name)
            .unwrap_or_else(|| opportunity.name.clone());
        if config.ignore_clusters.iter().any(|n| n == &cluster_name) {
            *rejected_by.entry("ignore_list").or_default() += 1;
            continue;
        }

        // 2-3. Boost and log-scaled final score.
        let boost = cross_source_boost(&opportunity, &metrics, &aligned_member_ids);
        let score = final_score(opportunity.total_score, metrics.cluster_size, trust, boost);
        candidates.push(Candidate {
            opportunity,
            metrics,
            trust_level: trust,
            boost,
            final_score: score,
        });
    }
    stats.passed_filters = candidates.len();

    // 4. Selection: strictly 0 or min..=max items.
    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if config.diversity_pass {
        diversity_pass(&mut candidates);
    }

    let report = if candidates.len() < config.min_candidates {
        let binding_filter = rejected_by
            .iter()
            .max_by_key(|(_, count)| *count)
            .map(|(name, _)| name.to_string());
        ShortlistReport {
            entries: vec![],
            considered: stats.considered,
            passed_filters: stats.passed_filters,
            binding_filter,
            generated_at: chrono::Utc::now(),
        }
    } else {
        candidates.truncate(config.max_candidates);
        let mut entries = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            // 5. Content generation with fallback.
            let (problem, mvp, why_now) = match generate_content(ai, candidate).await {
                Some(content) => content,
                None => {
                    stats.content_fallbacks += 1;
                    template_content(candidate)
                }
            };
            entries.push(ShortlistEntry {
                cluster_id: candidate.opportunity.cluster_id.clone(),
                name: candidate.opportunity.name.clone(),
                viability_score: candidate.opportunity.total_score,
                cluster_size: candidate.metrics.cluster_size,
                trust_level: candidate.trust_level,
                cross_source_boost: candidate.boost,
                final_score: candidate.final_score,
                problem,
                mvp,
                why_now,
            });
        }
        ShortlistReport {
            entries,
            considered: stats.considered,
            passed_filters: stats.passed_filters,
            binding_filter: None,
            generated_at: chrono::Utc::now(),
        }
    };

    stats.selected = report.entries.len();
    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        considered = stats.considered,
        passed = stats.passed_filters,
        selected = stats.selected,
        "shortlist complete"
    );
    Ok((report, stats))
}
