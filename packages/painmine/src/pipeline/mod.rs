//! The nine-stage mining pipeline.
//!
//! Each stage is an independent, re-runnable transformer from one
//! table to the next; `Pipeline` is the facade that wires a store, an
//! AI client and the community sources together and dispatches stages.
//! Data flow is strictly forward; a backfill is just a rerun from the
//! earliest affected stage.

pub mod align;
pub mod cluster;
pub mod embed;
pub mod extract;
pub mod filter;
pub mod ingest;
pub mod map;
pub mod prompts;
pub mod score;
pub mod shortlist;

pub use align::{parse_alignments, run_align, AlignmentCache};
pub use cluster::{dbscan, run_cluster};
pub use embed::{run_embed, verify_embeddings};
pub use extract::{enrich_event, run_extract, validate_event};
pub use filter::{run_filter, SignalFilter, PASS_THRESHOLD};
pub use ingest::fetch_all;
pub use map::{enrich_cluster, quality_score, run_map};
pub use score::{cluster_metrics, market_tier_score, run_score};
pub use shortlist::{cross_source_boost, final_score, run_shortlist, trust_level};

use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{MinerError, Result};
use crate::traits::{ai::Ai, source::CommunitySource, store::Store};
use crate::types::{PipelineConfig, RunResults, ShortlistReport, SourceConfig};

/// A pipeline stage, as selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Filter,
    Extract,
    Embed,
    Cluster,
    Alignment,
    MapOpportunities,
    Score,
    DecisionShortlist,
    All,
}

impl FromStr for Stage {
    type Err = MinerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fetch" => Ok(Self::Fetch),
            "filter" => Ok(Self::Filter),
            "extract" => Ok(Self::Extract),
            "embed" => Ok(Self::Embed),
            "cluster" => Ok(Self::Cluster),
            "alignment" => Ok(Self::Alignment),
            "map_opportunities" => Ok(Self::MapOpportunities),
            "score" => Ok(Self::Score),
            "decision_shortlist" => Ok(Self::DecisionShortlist),
            "all" => Ok(Self::All),
            other => Err(MinerError::config(format!("unknown stage {other:?}"))),
        }
    }
}

/// Per-run item limits, mirroring the CLI flags.
#[derive(Debug, Clone, Copy)]
pub struct StageLimits {
    pub limit_sources: Option<usize>,
    pub limit_posts: usize,
    pub limit_events: usize,
    pub limit_clusters: usize,
    pub limit_opportunities: usize,
    pub report_limit: usize,
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            limit_sources: None,
            limit_posts: 500,
            limit_events: 2000,
            limit_clusters: 100,
            limit_opportunities: 200,
            report_limit: 200,
        }
    }
}

/// Facade wiring store, AI and sources into runnable stages.
pub struct Pipeline<S, A> {
    store: S,
    ai: A,
    config: PipelineConfig,
    sources: Vec<(Box<dyn CommunitySource>, SourceConfig)>,
    align_cache: Mutex<AlignmentCache>,
    /// When set, shortlist runs also write the report artifacts.
    export_reports: bool,
}

impl<S, A> Pipeline<S, A>
where
    S: Store,
    A: Ai,
{
    pub fn new(store: S, ai: A, config: PipelineConfig) -> Self {
        Self {
            store,
            ai,
            config,
            sources: Vec::new(),
            align_cache: Mutex::new(AlignmentCache::default()),
            export_reports: false,
        }
    }

    /// Register a community source with its configuration.
    pub fn add_source(&mut self, source: Box<dyn CommunitySource>, config: SourceConfig) {
        self.sources.push((source, config));
    }

    /// Write Markdown/JSON artifacts after shortlist runs.
    pub fn with_report_export(mut self) -> Self {
        self.export_reports = true;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn fetch(&self, limit_sources: Option<usize>) -> Result<crate::types::FetchStats> {
        fetch_all(&self.store, &self.sources, limit_sources).await
    }

    pub async fn filter(&self, limit: usize) -> Result<crate::types::FilterStats> {
        run_filter(&self.store, &self.config.filter, limit).await
    }

    pub async fn extract(&self, limit: usize) -> Result<crate::types::ExtractStats> {
        run_extract(&self.store, &self.ai, &self.config.extractor, limit).await
    }

    pub async fn embed(&self, limit: usize) -> Result<crate::types::EmbedStats> {
        run_embed(&self.store, &self.ai, &self.config.embed, limit).await
    }

    pub async fn verify_embeddings(&self) -> Result<crate::types::EmbedVerify> {
        verify_embeddings(&self.store).await
    }

    pub async fn cluster(&self) -> Result<crate::types::ClusterStats> {
        run_cluster(&self.store, &self.ai, &self.config.cluster).await
    }

    pub async fn align(&self) -> Result<crate::types::AlignStats> {
        let mut cache = self.align_cache.lock().await;
        run_align(&self.store, &self.ai, &self.config.align, &mut cache).await
    }

    pub async fn map_opportunities(&self, limit: usize) -> Result<crate::types::MapStats> {
        run_map(&self.store, &self.ai, &self.config.mapper, limit).await
    }

    pub async fn score(&self, limit: usize) -> Result<crate::types::ScoreStats> {
        run_score(&self.store, &self.ai, &self.config.scorer, limit).await
    }

    pub async fn shortlist(
        &self,
        report_limit: usize,
    ) -> Result<(ShortlistReport, crate::types::ShortlistStats)> {
        let (report, stats) =
            run_shortlist(&self.store, &self.ai, &self.config.shortlist, report_limit).await?;
        if self.export_reports {
            let (markdown, json) = crate::report::write_report(&report, &self.config.shortlist)?;
            info!(markdown = %markdown.display(), json = %json.display(), "report written");
        }
        Ok((report, stats))
    }

    /// Run one stage, or all of them in order.
    ///
    /// With `stop_on_error` unset, a failing stage is logged and the
    /// rest still run; only the stage's own orchestration failures
    /// count as failures here, never individual items.
    pub async fn run(
        &self,
        stage: Stage,
        limits: StageLimits,
        stop_on_error: bool,
    ) -> Result<RunResults> {
        let mut results = RunResults::default();
        let stages: Vec<Stage> = match stage {
            Stage::All => vec![
                Stage::Fetch,
                Stage::Filter,
                Stage::Extract,
                Stage::Embed,
                Stage::Cluster,
                Stage::Alignment,
                Stage::MapOpportunities,
                Stage::Score,
                Stage::DecisionShortlist,
            ],
            single => vec![single],
        };

        for stage in stages {
            let outcome: Result<()> = match stage {
                Stage::Fetch => self
                    .fetch(limits.limit_sources)
                    .await
                    .map(|s| results.fetch = Some(s)),
                Stage::Filter => self
                    .filter(limits.limit_posts)
                    .await
                    .map(|s| results.filter = Some(s)),
                Stage::Extract => self
                    .extract(limits.limit_posts)
                    .await
                    .map(|s| results.extract = Some(s)),
                Stage::Embed => self
                    .embed(limits.limit_events)
                    .await
                    .map(|s| results.embed = Some(s)),
                Stage::Cluster => self.cluster().await.map(|s| results.cluster = Some(s)),
                Stage::Alignment => self.align().await.map(|s| results.align = Some(s)),
                Stage::MapOpportunities => self
                    .map_opportunities(limits.limit_clusters)
                    .await
                    .map(|s| results.map = Some(s)),
                Stage::Score => self
                    .score(limits.limit_opportunities)
                    .await
                    .map(|s| results.score = Some(s)),
                Stage::DecisionShortlist => self
                    .shortlist(limits.report_limit)
                    .await
                    .map(|(_, s)| results.shortlist = Some(s)),
                Stage::All => unreachable!("expanded above"),
            };

            if let Err(err) = outcome {
                if stop_on_error {
                    return Err(err);
                }
                error!(?stage, "stage failed: {err}");
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_parse() {
        assert_eq!("fetch".parse::<Stage>().unwrap(), Stage::Fetch);
        assert_eq!(
            "map_opportunities".parse::<Stage>().unwrap(),
            Stage::MapOpportunities
        );
        assert_eq!(
            "decision_shortlist".parse::<Stage>().unwrap(),
            Stage::DecisionShortlist
        );
        assert!("bogus".parse::<Stage>().is_err());
    }
}
