//! Domain types for the mining pipeline.

pub mod cluster;
pub mod config;
pub mod opportunity;
pub mod pain;
pub mod post;
pub mod stats;

pub use cluster::{
    AlignedProblem, AlignmentEvidence, AlignmentStatus, Cluster, ClusterLike,
};
pub use config::{
    AlignConfig, ClusterConfig, DensityParams, EmbedConfig, ExtractorConfig, FetchMethod,
    FilterConfig, MapperConfig, PipelineConfig, PreGateConfig, ScorerConfig, ShortlistConfig,
    SourceConfig, TypeThresholds,
};
pub use opportunity::{Opportunity, ShortlistEntry, ShortlistReport};
pub use pain::{EvidenceSource, PainEvent, PainType};
pub use post::{Comment, FetchedPost, FilterReason, FilteredPost, Post};
pub use stats::{
    AlignStats, ClusterStats, EmbedStats, EmbedVerify, ExtractStats, FetchStats, FilterStats,
    MapStats, RunResults, ScoreStats, ShortlistStats,
};
