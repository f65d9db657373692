//! OpenAI-compatible implementation of the `Ai` trait.
//!
//! Works against any endpoint speaking the chat-completions and
//! embeddings protocols (OpenAI, Azure, DeepSeek, proxies). Chat calls
//! request JSON mode and recover degraded output through brace
//! slicing; transient failures (timeouts, 429, 5xx) are retried with
//! exponential backoff.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ai::recover::recover_json;
use crate::ai::retry::{with_backoff, Backoff};
use crate::error::{MinerError, Result};
use crate::traits::ai::{Ai, ModelRole};

/// Concrete model per task tier.
#[derive(Debug, Clone)]
pub struct TaskMapping {
    pub main: String,
    pub medium: String,
    pub small: String,
}

impl Default for TaskMapping {
    fn default() -> Self {
        Self {
            main: "gpt-4o".into(),
            medium: "gpt-4o-mini".into(),
            small: "gpt-4o-mini".into(),
        }
    }
}

impl TaskMapping {
    fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Main => &self.main,
            ModelRole::Medium => &self.medium,
            ModelRole::Small => &self.small,
        }
    }
}

/// OpenAI-compatible chat + embeddings client.
pub struct OpenAiClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    task_mapping: std::sync::Arc<TaskMapping>,
    embedding_model: String,
    temperature: f32,
    max_tokens: u32,
    chat_timeout: Duration,
}

impl OpenAiClient {
    /// Create a client with the given API key and defaults.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: SecretString::from(api_key.into()),
            base_url: "https://api.openai.com/v1".to_string(),
            task_mapping: std::sync::Arc::new(TaskMapping::default()),
            embedding_model: "text-embedding-3-small".to_string(),
            temperature: 0.2,
            max_tokens: 4096,
            chat_timeout: Duration::from_secs(180),
        }
    }

    /// Create from `OPENAI_API_KEY`, honoring the per-role model
    /// overrides `PAINMINE_MODEL_MAIN` / `_MEDIUM` / `_SMALL` and
    /// `PAINMINE_EMBEDDING_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| MinerError::config("OPENAI_API_KEY not set"))?;
        let mut client = Self::new(api_key);

        let mut mapping = TaskMapping::default();
        if let Ok(model) = std::env::var("PAINMINE_MODEL_MAIN") {
            mapping.main = model;
        }
        if let Ok(model) = std::env::var("PAINMINE_MODEL_MEDIUM") {
            mapping.medium = model;
        }
        if let Ok(model) = std::env::var("PAINMINE_MODEL_SMALL") {
            mapping.small = model;
        }
        client.task_mapping = std::sync::Arc::new(mapping);

        if let Ok(model) = std::env::var("PAINMINE_EMBEDDING_MODEL") {
            client.embedding_model = model;
        }
        if let Ok(base) = std::env::var("OPENAI_BASE_URL") {
            client.base_url = base;
        }
        Ok(client)
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_task_mapping(mut self, mapping: TaskMapping) -> Self {
        self.task_mapping = std::sync::Arc::new(mapping);
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_chat_timeout(mut self, timeout: Duration) -> Self {
        self.chat_timeout = timeout;
        self
    }

    /// One chat-completions round trip, without retry.
    async fn chat_once(&self, model: &str, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .timeout(self.chat_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MinerError::AiTimeout {
                        seconds: self.chat_timeout.as_secs(),
                    }
                } else {
                    MinerError::Ai(e.to_string().into())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(MinerError::AiTransient {
                reason: format!("{}: {}", status, body),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MinerError::Ai(format!("{}: {}", status, body).into()));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| MinerError::Ai(e.to_string().into()))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| MinerError::AiResponse {
                reason: "empty choices".into(),
            })
    }

    async fn embed_once(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts.iter().map(|t| t.to_string()).collect(),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| MinerError::Embedding(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(MinerError::AiTransient {
                reason: format!("embeddings {}", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MinerError::Embedding(format!("{}: {}", status, body)));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MinerError::Embedding(e.to_string()))?;

        // The API may reorder; index restores input order.
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Ai for OpenAiClient {
    async fn chat_json(&self, role: ModelRole, system: &str, user: &str) -> Result<String> {
        let model = self.task_mapping.model_for(role).to_string();
        let content = with_backoff(Backoff::chat(), || {
            self.chat_once(&model, system, user)
        })
        .await?;
        Ok(recover_json(&content))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text]).await?;
        vectors.pop().ok_or_else(|| {
            MinerError::Embedding("embeddings endpoint returned no vectors".into())
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        with_backoff(Backoff::embedding(), || self.embed_once(texts)).await
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }
}

// Wire types for the OpenAI-compatible protocol.

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}
