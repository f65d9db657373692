//! Command-line entry point for the painmine pipeline.
//!
//! Thin by design: argument parsing, logging setup, credential
//! discovery and stage dispatch. All real behavior lives in the
//! library. Exit code 0 on success, 1 on fatal error or interrupt.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use painmine::sources::{HackerNewsSource, RedditSource};
use painmine::types::{FetchMethod, PipelineConfig, SourceConfig};
use painmine::{OpenAiClient, Pipeline, SqliteStore, Stage, StageLimits};

#[derive(Debug, Parser)]
#[command(name = "painmine", about = "Mine community pain into micro-product opportunities")]
struct Args {
    /// Stage to run: fetch, filter, extract, embed, cluster, alignment,
    /// map_opportunities, score, decision_shortlist, all
    #[arg(long, default_value = "all")]
    stage: String,

    /// SQLite database URL
    #[arg(long, default_value = "sqlite://painmine.db")]
    db: String,

    /// Only fetch from the first N configured sources
    #[arg(long)]
    limit_sources: Option<usize>,

    /// Max posts per filter/extract run
    #[arg(long, default_value_t = 500)]
    limit_posts: usize,

    /// Max events per embed run
    #[arg(long, default_value_t = 2000)]
    limit_events: usize,

    /// Max clusters per mapping run
    #[arg(long, default_value_t = 100)]
    limit_clusters: usize,

    /// Max opportunities per scoring run
    #[arg(long, default_value_t = 200)]
    limit_opportunities: usize,

    /// Max opportunities considered by the shortlist
    #[arg(long, default_value_t = 200)]
    report_limit: usize,

    /// Override the shortlist's minimum viability score
    #[arg(long)]
    min_score: Option<f32>,

    /// Abort the run when a stage fails instead of continuing
    #[arg(long)]
    stop_on_error: bool,

    /// Write per-stage stats to a JSON file
    #[arg(long)]
    save_results: bool,

    /// Where to write the stats JSON
    #[arg(long, default_value = "painmine_results.json")]
    results_file: String,

    /// Print per-stage stats to stdout as JSON
    #[arg(long)]
    enable_monitoring: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tokio::select! {
        result = run(&args) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("fatal: {err}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> painmine::Result<()> {
    let stage: Stage = args.stage.parse()?;

    let mut config = PipelineConfig {
        sources: default_sources(),
        ..PipelineConfig::default()
    };
    if let Some(min_score) = args.min_score {
        config.shortlist.min_viability = min_score;
    }

    let store = SqliteStore::new(&args.db).await?;
    let ai = build_ai(stage)?;
    let source_configs = config.sources.clone();
    let mut pipeline = Pipeline::new(store, ai, config).with_report_export();

    for source_config in source_configs {
        match connect_source(&source_config).await {
            Ok(source) => pipeline.add_source(source, source_config),
            Err(err) if stage == Stage::All => return Err(err),
            Err(err) => {
                warn!(source = %source_config.name, "source disabled: {err}");
            }
        }
    }

    let limits = StageLimits {
        limit_sources: args.limit_sources,
        limit_posts: args.limit_posts,
        limit_events: args.limit_events,
        limit_clusters: args.limit_clusters,
        limit_opportunities: args.limit_opportunities,
        report_limit: args.report_limit,
    };

    let results = pipeline.run(stage, limits, args.stop_on_error).await?;

    if args.enable_monitoring {
        println!("{}", serde_json::to_string_pretty(&results).map_err(painmine::MinerError::Json)?);
    }
    if args.save_results {
        let rendered =
            serde_json::to_string_pretty(&results).map_err(painmine::MinerError::Json)?;
        std::fs::write(&args.results_file, rendered)
            .map_err(|e| painmine::MinerError::config(format!("cannot write results: {e}")))?;
        info!(file = %args.results_file, "results saved");
    }
    Ok(())
}

/// Construct the AI client; fetch and filter can run without one.
fn build_ai(stage: Stage) -> painmine::Result<OpenAiClient> {
    match OpenAiClient::from_env() {
        Ok(client) => Ok(client),
        Err(err) if matches!(stage, Stage::Fetch | Stage::Filter) => {
            warn!("no LLM credentials; fine for this stage: {err}");
            Ok(OpenAiClient::new("unused"))
        }
        Err(err) => Err(err),
    }
}

async fn connect_source(
    config: &SourceConfig,
) -> painmine::Result<Box<dyn painmine::CommunitySource>> {
    match config.name.as_str() {
        "reddit" => {
            let source = RedditSource::from_env(config.requests_per_second).await?;
            Ok(Box::new(source))
        }
        "hn_ask" => {
            let source = HackerNewsSource::new(config.requests_per_second)?;
            Ok(Box::new(source))
        }
        other => Err(painmine::MinerError::config(format!(
            "unknown source {other:?}"
        ))),
    }
}

fn default_sources() -> Vec<SourceConfig> {
    let reddit = SourceConfig {
        name: "reddit".into(),
        category: "productivity".into(),
        communities: vec![
            "excel".into(),
            "productivity".into(),
            "smallbusiness".into(),
            "dataengineering".into(),
        ],
        methods: vec![
            FetchMethod::Hot,
            FetchMethod::New,
            FetchMethod::Top,
            FetchMethod::KeywordSearch,
        ],
        ..SourceConfig::default()
    };
    let hn = SourceConfig {
        name: "hn_ask".into(),
        category: "technical".into(),
        communities: vec![],
        methods: vec![],
        max_comments: 10,
        ..SourceConfig::default()
    };
    vec![reddit, hn]
}
