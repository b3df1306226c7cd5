//! Speech synthesis for replies.

use async_trait::async_trait;
use tracing::debug;

use switchboard_core::config::SynthesisConfig;
use switchboard_core::types::{ENCODING, SAMPLE_RATE};

const DEEPGRAM_SPEAK_URL: &str = "https://api.deepgram.com/v1/speak";

/// Size of the canonical RIFF/WAVE header (RIFF + fmt + data chunk headers).
pub const WAV_HEADER_LEN: usize = 44;

/// Voice selection for a synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConfig {
    pub voice: String,
}

impl VoiceConfig {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
        }
    }
}

/// Text-to-speech backend producing 8 kHz mu-law audio.
///
/// The returned buffer may still be wrapped in a container; callers strip it
/// with [`strip_container_header`].
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> anyhow::Result<Vec<u8>>;
}

/// Deepgram Aura REST synthesis.
pub struct DeepgramSynthesizer {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl DeepgramSynthesizer {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or(DEEPGRAM_SPEAK_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> anyhow::Result<Self> {
        if config.provider != "deepgram" {
            anyhow::bail!("Unknown synthesis provider: {}", config.provider);
        }
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No synthesis API key configured"))?;
        Ok(Self::new(api_key, config.base_url.as_deref()))
    }

    /// Build the speak URL for a voice, requesting telephony-ready output.
    pub fn speak_url(&self, voice: &str) -> anyhow::Result<url::Url> {
        let mut url = url::Url::parse(&self.base_url)?;
        url.query_pairs_mut()
            .append_pair("model", voice)
            .append_pair("encoding", ENCODING)
            .append_pair("sample_rate", &SAMPLE_RATE.to_string())
            .append_pair("container", "none");
        Ok(url)
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> anyhow::Result<Vec<u8>> {
        let url = self.speak_url(&voice.voice)?;

        debug!(voice = %voice.voice, text_len = text.len(), "Requesting speech synthesis");

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

/// Return the raw samples of `audio`, dropping a RIFF/WAVE header if present.
///
/// Walks the chunk list to the `data` chunk; when the header is truncated or
/// malformed it falls back to skipping the fixed 44-byte header. Buffers
/// without a RIFF signature are returned unchanged.
pub fn strip_container_header(audio: Vec<u8>) -> Vec<u8> {
    if audio.len() < 12 || &audio[0..4] != b"RIFF" || &audio[8..12] != b"WAVE" {
        return audio;
    }

    let mut offset = 12;
    while offset + 8 <= audio.len() {
        let id = &audio[offset..offset + 4];
        let size = u32::from_le_bytes([
            audio[offset + 4],
            audio[offset + 5],
            audio[offset + 6],
            audio[offset + 7],
        ]) as usize;
        let body = offset + 8;

        if id == b"data" {
            // Streaming encoders write 0 or u32::MAX when the length is unknown.
            let end = if size == 0 {
                audio.len()
            } else {
                body.saturating_add(size).min(audio.len())
            };
            return audio[body..end].to_vec();
        }

        // Chunks are padded to an even length.
        offset = body.saturating_add(size).saturating_add(size & 1);
    }

    audio.get(WAV_HEADER_LEN..).map(<[u8]>::to_vec).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wrap mu-law samples in a WAV container (format tag 7).
    fn mulaw_to_wav(samples: &[u8], extra_chunk: Option<(&[u8; 4], &[u8])>) -> Vec<u8> {
        let mut chunks = Vec::new();

        chunks.extend_from_slice(b"fmt ");
        chunks.extend_from_slice(&16u32.to_le_bytes());
        chunks.extend_from_slice(&7u16.to_le_bytes()); // mu-law
        chunks.extend_from_slice(&1u16.to_le_bytes()); // mono
        chunks.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
        chunks.extend_from_slice(&SAMPLE_RATE.to_le_bytes()); // byte rate
        chunks.extend_from_slice(&1u16.to_le_bytes()); // block align
        chunks.extend_from_slice(&8u16.to_le_bytes()); // bits per sample

        if let Some((id, body)) = extra_chunk {
            chunks.extend_from_slice(id);
            chunks.extend_from_slice(&(body.len() as u32).to_le_bytes());
            chunks.extend_from_slice(body);
            if body.len() % 2 == 1 {
                chunks.push(0);
            }
        }

        chunks.extend_from_slice(b"data");
        chunks.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        chunks.extend_from_slice(samples);

        let mut wav = Vec::with_capacity(12 + chunks.len());
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(4 + chunks.len() as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(&chunks);
        wav
    }

    #[test]
    fn test_strip_canonical_header() {
        let samples = vec![0x11u8; 320];
        let wav = mulaw_to_wav(&samples, None);
        assert_eq!(wav.len(), WAV_HEADER_LEN + 320);
        assert_eq!(strip_container_header(wav), samples);
    }

    #[test]
    fn test_strip_header_with_extra_chunk() {
        let samples: Vec<u8> = (0..100).collect();
        let wav = mulaw_to_wav(&samples, Some((b"LIST", b"odd")));
        assert_eq!(strip_container_header(wav), samples);
    }

    #[test]
    fn test_raw_audio_is_untouched() {
        let raw = vec![0xFFu8, 0x7F, 0x00, 0x80];
        assert_eq!(strip_container_header(raw.clone()), raw);
        assert!(strip_container_header(Vec::new()).is_empty());
    }

    #[test]
    fn test_unknown_length_data_chunk_takes_rest() {
        let samples = vec![0x22u8; 50];
        let mut wav = mulaw_to_wav(&samples, None);
        // data chunk size lives at bytes 40..44
        wav[40..44].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(strip_container_header(wav), samples);
    }

    #[test]
    fn test_truncated_header_falls_back_to_fixed_size() {
        let mut wav = b"RIFF\0\0\0\0WAVEjunk\xff\xff\xff\x7f".to_vec();
        wav.resize(WAV_HEADER_LEN, 0);
        wav.extend_from_slice(&[1, 2, 3]);
        assert_eq!(strip_container_header(wav), vec![1, 2, 3]);
    }

    #[test]
    fn test_speak_url_requests_telephony_format() {
        let synth = DeepgramSynthesizer::new("key", None);
        let url = synth.speak_url("aura-asteria-en").unwrap();
        let query = url.query().unwrap();
        assert!(url.as_str().starts_with("https://api.deepgram.com/v1/speak"));
        assert!(query.contains("model=aura-asteria-en"));
        assert!(query.contains("encoding=mulaw"));
        assert!(query.contains("sample_rate=8000"));
        assert!(query.contains("container=none"));
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = SynthesisConfig {
            api_key_env: Some("SB_TEST_UNSET_SYNTH_KEY".into()),
            ..SynthesisConfig::default()
        };
        // Falls back to DEEPGRAM_API_KEY, so only assert when that is unset too.
        if std::env::var("DEEPGRAM_API_KEY").is_err() {
            assert!(DeepgramSynthesizer::from_config(&config).is_err());
        }
        let with_key = SynthesisConfig {
            api_key: Some("dg".into()),
            ..SynthesisConfig::default()
        };
        assert!(DeepgramSynthesizer::from_config(&with_key).is_ok());
    }

    #[tokio::test]
    async fn test_synthesize_against_local_server() {
        use axum::{Router, extract::RawQuery, http::HeaderMap, routing::post};

        async fn handler(headers: HeaderMap, RawQuery(query): RawQuery) -> Vec<u8> {
            assert_eq!(headers["authorization"], "Token dg-test");
            assert!(query.unwrap_or_default().contains("encoding=mulaw"));
            vec![0xFF; 480]
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/v1/speak", post(handler));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let synth = DeepgramSynthesizer::new("dg-test", Some(&format!("http://{addr}/v1/speak")));
        let audio = synth
            .synthesize("hello", &VoiceConfig::new("aura-asteria-en"))
            .await
            .unwrap();
        assert_eq!(audio.len(), 480);
    }
}
