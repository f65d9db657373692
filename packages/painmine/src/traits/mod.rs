//! Core trait abstractions: AI, community sources, storage.

pub mod ai;
pub mod source;
pub mod store;

pub use ai::{Ai, ModelRole};
pub use source::{CommunitySource, FetchOutcome};
pub use store::{
    cosine_distance, cosine_similarity, ClusterStore, EventStore, FilterStore, OpportunityStore,
    PostStore, Store,
};
