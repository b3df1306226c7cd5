//! Reply generation: utterance in, telephony audio out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use switchboard_core::config::Config;
use switchboard_core::error::{BridgeError, Result};
use switchboard_providers::{ChatMessage, CompletionRequest, Credentials, LlmProvider, build_provider};

use crate::tts::{DeepgramSynthesizer, SpeechSynthesizer, VoiceConfig, strip_container_header};

/// Turns a caller utterance into a spoken reply.
///
/// Both steps fail independently; the caller skips the turn on either error.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// One short, non-streaming completion for `utterance`.
    async fn generate_reply(&self, utterance: &str, persona_prompt: &str) -> Result<String>;

    /// Raw 8 kHz mu-law samples for `text`, container header removed.
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Vec<u8>>;
}

/// Reply generator backed by an LLM provider and a speech synthesizer.
pub struct ConversationalReplier {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    model: String,
    max_tokens: u32,
    temperature: Option<f64>,
    generation_timeout: Duration,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    synthesis_timeout: Duration,
}

impl ConversationalReplier {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        model: impl Into<String>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            provider,
            credentials,
            model: model.into(),
            max_tokens: 150,
            temperature: None,
            generation_timeout: Duration::from_secs(10),
            synthesizer,
            synthesis_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeouts(mut self, generation: Duration, synthesis: Duration) -> Self {
        self.generation_timeout = generation;
        self.synthesis_timeout = synthesis;
        self
    }

    /// Build from the `generation` and `synthesis` config sections.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let generation = config.generation();
        let synthesis = config.synthesis();

        let (provider, credentials) = build_provider(&generation)?;
        let synthesizer = Arc::new(DeepgramSynthesizer::from_config(&synthesis)?);

        info!(
            provider = provider.id(),
            model = generation.model(),
            voice = synthesis.voice(),
            "Reply generator ready"
        );

        Ok(Self::new(provider, credentials, generation.model(), synthesizer)
            .with_max_tokens(generation.max_tokens)
            .with_temperature(generation.temperature)
            .with_timeouts(
                Duration::from_secs(generation.timeout_secs),
                Duration::from_secs(synthesis.timeout_secs),
            ))
    }
}

#[async_trait]
impl ReplyGenerator for ConversationalReplier {
    async fn generate_reply(&self, utterance: &str, persona_prompt: &str) -> Result<String> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(utterance)],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: Some(persona_prompt.to_string()),
        };

        let completion = tokio::time::timeout(
            self.generation_timeout,
            self.provider.complete(&request, &self.credentials),
        )
        .await
        .map_err(|_| {
            BridgeError::Generation(format!("timed out after {:?}", self.generation_timeout))
        })?
        .map_err(|e| BridgeError::Generation(e.to_string()))?;

        let text = completion.text.trim();
        if text.is_empty() {
            return Err(BridgeError::Generation("empty reply".into()));
        }

        debug!(
            provider = self.provider.id(),
            stop_reason = ?completion.stop_reason,
            reply_len = text.len(),
            "Reply generated"
        );
        Ok(text.to_string())
    }

    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Vec<u8>> {
        let audio = tokio::time::timeout(self.synthesis_timeout, self.synthesizer.synthesize(text, voice))
            .await
            .map_err(|_| {
                BridgeError::Synthesis(format!("timed out after {:?}", self.synthesis_timeout))
            })?
            .map_err(|e| BridgeError::Synthesis(e.to_string()))?;

        Ok(strip_container_header(audio))
    }
}
