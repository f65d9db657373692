//! # Painmine
//!
//! Mines online technical communities (Reddit, Hacker News) for
//! recurring user pain and turns it into a short, decision-ready list
//! of micro-product opportunities scored for a one-person founder.
//!
//! ## Architecture
//!
//! ```text
//! FETCH → FILTER → EXTRACT → EMBED → CLUSTER → ALIGN → MAP → SCORE → SHORTLIST
//!
//! 1. Sources pull posts + comments into one SQLite store
//! 2. A rule gate keeps pain-bearing posts with a deterministic score
//! 3. An LLM lifts structured pain events out of each kept post
//! 4. Each event gets a dense embedding
//! 5. Density clustering + LLM validation form workflow clusters
//! 6. An LLM matches clusters across sources into aligned problems
//! 7. Each cluster (real or aligned) maps to one micro-tool proposal
//! 8. LLM judgment + rule signals combine into a 0-10 viability score
//! 9. Hard filters, boosts and log scaling emit 3-5 candidates
//! ```
//!
//! Every stage is independently re-runnable: persistence is keyed and
//! idempotent, progress lives in status columns, and restarting at a
//! stage boundary is always safe.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use painmine::{Pipeline, Stage, StageLimits, SqliteStore, OpenAiClient};
//! use painmine::sources::{HackerNewsSource, RedditSource};
//! use painmine::types::{PipelineConfig, SourceConfig};
//!
//! let store = SqliteStore::new("sqlite://painmine.db").await?;
//! let ai = OpenAiClient::from_env()?;
//! let mut pipeline = Pipeline::new(store, ai, PipelineConfig::default())
//!     .with_report_export();
//!
//! let reddit = RedditSource::from_env(1).await?;
//! pipeline.add_source(Box::new(reddit), SourceConfig::default());
//!
//! let results = pipeline.run(Stage::All, StageLimits::default(), false).await?;
//! ```
//!
//! ## Modules
//!
//! - [`traits`] - core abstractions (AI, community sources, storage)
//! - [`types`] - domain types, configuration, per-stage stats
//! - [`pipeline`] - the nine stages and the [`Pipeline`] facade
//! - [`stores`] - SQLite storage
//! - [`sources`] - Reddit and Hacker News clients
//! - [`ai`] - OpenAI-compatible client, retry and recovery plumbing
//! - [`report`] - Markdown/JSON shortlist artifacts
//! - [`testing`] - mock AI/source implementations and builders

pub mod ai;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod sources;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export the working surface at the crate root.
pub use ai::{OpenAiClient, TaskMapping};
pub use error::{MinerError, Result, SourceError};
pub use pipeline::{Pipeline, Stage, StageLimits};
pub use stores::SqliteStore;
pub use traits::{Ai, CommunitySource, ModelRole, Store};
pub use types::{PipelineConfig, RunResults, ShortlistReport};
