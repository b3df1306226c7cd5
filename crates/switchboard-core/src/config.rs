//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Switchboard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Public host the telephony side should dial back to. Defaults to the
    /// `Host` header of the call-setup request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,

    /// Spoken by the telephony side before the stream connects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

fn default_port() -> u16 {
    5050
}

/// Streaming speech-to-text settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider id (currently "deepgram").
    #[serde(default = "default_deepgram")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Silence (ms) after which a partial utterance is finalized.
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
    /// Override for the service URL (self-hosted deployments, tests).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_deepgram(),
            api_key: None,
            api_key_env: None,
            model: None,
            language: None,
            endpointing_ms: default_endpointing_ms(),
            base_url: None,
        }
    }
}

impl TranscriptionConfig {
    /// Resolve the API key, falling back to `DEEPGRAM_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_secret_field(&None, &Some(DEEPGRAM_API_KEY_ENV.into())))
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("nova-2-phonecall")
    }

    pub fn language(&self) -> &str {
        self.language.as_deref().unwrap_or("en-US")
    }
}

/// Text-generation settings for replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Provider id: "openai", "groq", "ollama", or "anthropic".
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Reply length cap; keeps synthesis and playout to a few seconds.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_prompt: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            model: None,
            max_tokens: default_max_tokens(),
            temperature: None,
            persona_prompt: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        let fallback_env = match self.provider.as_str() {
            "anthropic" => Some("ANTHROPIC_API_KEY"),
            "groq" => Some("GROQ_API_KEY"),
            "openai" => Some("OPENAI_API_KEY"),
            _ => None,
        };
        resolve_secret_field(&self.api_key, &self.api_key_env).or_else(|| {
            fallback_env.and_then(|env| resolve_secret_field(&None, &Some(env.into())))
        })
    }

    pub fn model(&self) -> &str {
        if let Some(model) = self.model.as_deref() {
            return model;
        }
        match self.provider.as_str() {
            "anthropic" => "claude-3-5-haiku-latest",
            "groq" => "llama-3.1-8b-instant",
            "ollama" => "llama3.2",
            _ => "gpt-4o-mini",
        }
    }

    pub fn persona_prompt(&self) -> &str {
        self.persona_prompt
            .as_deref()
            .unwrap_or(DEFAULT_PERSONA_PROMPT)
    }
}

pub const DEFAULT_PERSONA_PROMPT: &str = "You are a friendly voice assistant on a phone call. \
Answer in one or two short spoken sentences. Do not use lists, markdown, or emoji.";

/// Speech synthesis settings for replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Provider id (currently "deepgram").
    #[serde(default = "default_deepgram")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_deepgram(),
            api_key: None,
            api_key_env: None,
            voice: None,
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SynthesisConfig {
    /// Resolve the API key, falling back to `DEEPGRAM_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_secret_field(&None, &Some(DEEPGRAM_API_KEY_ENV.into())))
    }

    pub fn voice(&self) -> &str {
        self.voice.as_deref().unwrap_or("aura-asteria-en")
    }
}

/// Per-call bridge tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Capacity of the channel carrying transcripts into the session.
    #[serde(default = "default_transcript_channel_capacity")]
    pub transcript_channel_capacity: usize,
    /// First delay before reopening a lost transcription stream; doubles per attempt.
    #[serde(default = "default_reopen_backoff_ms")]
    pub reopen_backoff_ms: u64,
    /// Reopen attempts allowed without a transcript in between.
    #[serde(default = "default_reopen_attempts")]
    pub reopen_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transcript_channel_capacity: default_transcript_channel_capacity(),
            reopen_backoff_ms: default_reopen_backoff_ms(),
            reopen_attempts: default_reopen_attempts(),
        }
    }
}

fn default_transcript_channel_capacity() -> usize {
    16
}

fn default_reopen_backoff_ms() -> u64 {
    500
}

fn default_reopen_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "switchboard_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

fn default_deepgram() -> String {
    "deepgram".into()
}

fn default_generation_provider() -> String {
    "openai".into()
}

fn default_endpointing_ms() -> u32 {
    300
}

fn default_max_tokens() -> u32 {
    150
}

fn default_timeout_secs() -> u64 {
    10
}

const DEEPGRAM_API_KEY_ENV: &str = "DEEPGRAM_API_KEY";

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::BridgeError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::BridgeError::Config(e.to_string()))?;

        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(5050)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn greeting(&self) -> Option<&str> {
        self.gateway.as_ref().and_then(|g| g.greeting.as_deref())
    }

    pub fn transcription(&self) -> TranscriptionConfig {
        self.transcription.clone().unwrap_or_default()
    }

    pub fn generation(&self) -> GenerationConfig {
        self.generation.clone().unwrap_or_default()
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        self.synthesis.clone().unwrap_or_default()
    }

    pub fn bridge(&self) -> BridgeConfig {
        self.bridge.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let transcription = self.transcription();
        if transcription.provider != "deepgram" {
            errors.push(format!(
                "Unknown transcription provider '{}'",
                transcription.provider
            ));
        }
        if transcription.resolve_api_key().is_none() {
            errors.push("Transcription has no API key configured (set DEEPGRAM_API_KEY)".to_string());
        }

        let generation = self.generation();
        if !matches!(
            generation.provider.as_str(),
            "openai" | "groq" | "ollama" | "anthropic"
        ) {
            errors.push(format!(
                "Unknown generation provider '{}'",
                generation.provider
            ));
        } else if generation.provider != "ollama" && generation.resolve_api_key().is_none() {
            warnings.push(format!(
                "Generation provider '{}' has no API key configured; replies will be skipped",
                generation.provider
            ));
        }

        let synthesis = self.synthesis();
        if synthesis.provider != "deepgram" {
            errors.push(format!("Unknown synthesis provider '{}'", synthesis.provider));
        }
        if synthesis.resolve_api_key().is_none() {
            errors.push("Synthesis has no API key configured (set DEEPGRAM_API_KEY)".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if self.bridge().transcript_channel_capacity == 0 {
            errors.push("bridge.transcript_channel_capacity must be at least 1".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Switchboard data: `~/.switchboard/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SB_KEY", "dg-test-123") };
        let input = r#"{"key": "${TEST_SB_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("dg-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_SB_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_SB_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 5050);
        assert_eq!(config.transcription().endpointing_ms, 300);
        assert_eq!(config.transcription().model(), "nova-2-phonecall");
        assert_eq!(config.generation().max_tokens, 150);
        assert_eq!(config.generation().model(), "gpt-4o-mini");
        assert_eq!(config.synthesis().voice(), "aura-asteria-en");
        assert_eq!(config.bridge().transcript_channel_capacity, 16);
        assert_eq!(config.bridge().reopen_backoff_ms, 500);
        assert_eq!(config.bridge().reopen_attempts, 5);
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                gateway: { port: 8080, greeting: "Hi there" },
                transcription: { api_key: "dg-key", endpointing_ms: 500 },
                generation: { provider: "groq", max_tokens: 60 },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 8080);
        assert_eq!(config.greeting(), Some("Hi there"));
        assert_eq!(config.transcription().endpointing_ms, 500);
        assert_eq!(config.transcription().resolve_api_key().as_deref(), Some("dg-key"));
        assert_eq!(config.generation().model(), "llama-3.1-8b-instant");
        assert_eq!(config.generation().max_tokens, 60);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/switchboard/config.json")).unwrap();
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ gateway: ").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(crate::error::BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_secret_direct_wins() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SB_GEN_KEY", "from-env") };
        let from_env = GenerationConfig {
            api_key_env: Some("TEST_SB_GEN_KEY".into()),
            ..GenerationConfig::default()
        };
        assert_eq!(from_env.resolve_api_key(), Some("from-env".into()));

        let direct = GenerationConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_SB_GEN_KEY".into()),
            ..GenerationConfig::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_SB_GEN_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let config = Config {
            gateway: Some(GatewayConfig {
                port: 0,
                bind: None,
                public_host: None,
                greeting: None,
            }),
            transcription: Some(TranscriptionConfig {
                provider: "whisper".into(),
                api_key: Some("key".into()),
                ..TranscriptionConfig::default()
            }),
            generation: Some(GenerationConfig {
                provider: "mystery".into(),
                ..GenerationConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("port")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("whisper")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("mystery")), "{errors:?}");
    }

    #[test]
    fn test_validate_ollama_needs_no_key() {
        let config = Config {
            transcription: Some(TranscriptionConfig {
                api_key: Some("key".into()),
                ..TranscriptionConfig::default()
            }),
            generation: Some(GenerationConfig {
                provider: "ollama".into(),
                ..GenerationConfig::default()
            }),
            synthesis: Some(SynthesisConfig {
                api_key: Some("key".into()),
                ..SynthesisConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty(), "{errors:?}");
        assert!(warnings.is_empty(), "{warnings:?}");
    }
}
