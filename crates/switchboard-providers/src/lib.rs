//! Text-generation provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait to answer a single
//! non-streaming chat completion. Replies on a phone call are short, so one
//! round trip beats streaming tokens we could not speak early anyway.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use switchboard_core::config::GenerationConfig;

pub mod anthropic;
pub mod openai;

use anthropic::AnthropicProvider;
use openai::OpenAiProvider;

/// Supported LLM API protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelApi {
    AnthropicMessages,
    OpenAiCompletions,
}

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    #[serde(rename = "none")]
    None,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// A finished completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "anthropic", "openai").
    fn id(&self) -> &str;

    /// API protocol used by this provider.
    fn api(&self) -> ModelApi;

    /// Run one chat completion to the end.
    async fn complete(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<Completion>;
}

/// Build the provider and credentials named by a generation config.
pub fn build_provider(
    config: &GenerationConfig,
) -> anyhow::Result<(Arc<dyn LlmProvider>, Credentials)> {
    let base_url = config.base_url.as_deref();
    let provider: Arc<dyn LlmProvider> = match config.provider.as_str() {
        "openai" => Arc::new(OpenAiProvider::openai(base_url)),
        "groq" => Arc::new(OpenAiProvider::groq(base_url)),
        "ollama" => Arc::new(OpenAiProvider::ollama(base_url)),
        "anthropic" => Arc::new(AnthropicProvider::new(base_url)),
        other => anyhow::bail!("Unknown generation provider: {other}"),
    };

    let credentials = match config.resolve_api_key() {
        Some(api_key) => Credentials::ApiKey { api_key },
        None => Credentials::None,
    };

    Ok((provider, credentials))
}
