//! AI trait for LLM and embedding operations.
//!
//! One trait covers both chat and embeddings so a stage only carries a
//! single handle. Implementations wrap a specific provider and handle
//! retries, timeouts and degraded-output recovery internally; stages
//! receive either a JSON string they can deserialize or an error they
//! count and move past.

use async_trait::async_trait;

use crate::error::Result;

/// Which model tier a call should use.
///
/// Concrete model names are resolved by the implementation's task
/// mapping; stages only declare how much model they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    /// Heaviest reasoning: extraction, validation, mapping, scoring
    Main,
    /// Mid-tier: summarization, alignment
    Medium,
    /// Cheapest: shortlist phrasing
    Small,
}

/// AI trait for chat-completion and embedding calls.
#[async_trait]
pub trait Ai: Send + Sync {
    /// Chat completion expected to return a JSON document.
    ///
    /// Implementations should request JSON mode where the provider
    /// supports it and fall back to brace-slicing recovery when the
    /// response carries stray prose around the JSON.
    async fn chat_json(&self, role: ModelRole, system: &str, user: &str) -> Result<String>;

    /// Generate an embedding for one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch operation).
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Name of the embedding model, recorded next to stored vectors.
    fn embedding_model(&self) -> &str;
}
