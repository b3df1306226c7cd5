//! Streaming speech-to-text.
//!
//! A [`TranscriptionService`] opens one long-lived [`TranscriptionSink`] per
//! call. Audio goes in through the sink; finalized utterances come back as
//! [`TranscriptEvent`]s on a channel fed by the sink's own connection task,
//! independent of whoever is pushing audio.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use switchboard_core::config::TranscriptionConfig;
use switchboard_core::error::{BridgeError, Result};
use switchboard_core::types::{ENCODING, MediaFrame, SAMPLE_RATE, TranscriptEvent};

const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Deepgram closes idle streams after ~10 s without audio or a KeepAlive.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

/// How long `close` waits for the connection task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens streaming transcription sessions.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Open a session. Finalized utterances are delivered on `events`.
    async fn open(&self, events: mpsc::Sender<TranscriptEvent>) -> Result<Box<dyn TranscriptionSink>>;
}

/// One open transcription session.
#[async_trait]
pub trait TranscriptionSink: Send {
    /// Queue a frame of audio. Never blocks; fails once the stream is gone.
    fn send(&mut self, frame: MediaFrame) -> Result<()>;

    /// End the session. Safe to call more than once.
    async fn close(&mut self);
}

/// Deepgram live transcription over WebSocket.
pub struct DeepgramTranscriber {
    config: TranscriptionConfig,
    api_key: String,
}

impl DeepgramTranscriber {
    pub fn new(config: TranscriptionConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &TranscriptionConfig) -> anyhow::Result<Self> {
        if config.provider != "deepgram" {
            anyhow::bail!("Unknown transcription provider: {}", config.provider);
        }
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;
        Ok(Self::new(config.clone(), api_key))
    }

    /// Build the listen URL with the telephony audio format and endpointing.
    pub fn build_url(&self) -> anyhow::Result<Url> {
        let base = self.config.base_url.as_deref().unwrap_or(DEEPGRAM_LISTEN_URL);
        let mut url = Url::parse(base)?;
        url.query_pairs_mut()
            .append_pair("model", self.config.model())
            .append_pair("language", self.config.language())
            .append_pair("encoding", ENCODING)
            .append_pair("sample_rate", &SAMPLE_RATE.to_string())
            .append_pair("channels", "1")
            .append_pair("endpointing", &self.config.endpointing_ms.to_string())
            .append_pair("interim_results", "false")
            .append_pair("punctuate", "true")
            .append_pair("smart_format", "true");
        Ok(url)
    }
}

fn service_fault(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::TranscriptionServiceFault(e.to_string())
}

#[async_trait]
impl TranscriptionService for DeepgramTranscriber {
    async fn open(&self, events: mpsc::Sender<TranscriptEvent>) -> Result<Box<dyn TranscriptionSink>> {
        let url = self.build_url().map_err(service_fault)?;

        let mut request = url.as_str().into_client_request().map_err(service_fault)?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key)).map_err(service_fault)?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws, _) = connect_async(request).await.map_err(service_fault)?;
        info!(model = self.config.model(), endpointing_ms = self.config.endpointing_ms, "Transcription stream opened");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(ws, command_rx, events));

        Ok(Box::new(DeepgramSink {
            command_tx: Some(command_tx),
            task: Some(task),
        }))
    }
}

enum Command {
    Audio(Vec<u8>),
    Close,
}

/// Sink half of an open Deepgram stream.
pub struct DeepgramSink {
    command_tx: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl TranscriptionSink for DeepgramSink {
    fn send(&mut self, frame: MediaFrame) -> Result<()> {
        let tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| service_fault("transcription stream already closed"))?;
        tx.send(Command::Audio(frame.samples))
            .map_err(|_| service_fault("transcription stream ended"))
    }

    async fn close(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            // The task may already be gone; that is fine.
            let _ = tx.send(Command::Close);
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("Transcription stream did not close in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for DeepgramSink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_connection<S>(
    ws: S,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TranscriptEvent>,
) where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut assembler = UtteranceAssembler::default();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;
    let mut last_sent = Instant::now();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Audio(bytes)) => {
                    if let Err(e) = ws_tx.send(Message::Binary(bytes.into())).await {
                        warn!(%e, "Failed to send audio to transcription service");
                        break;
                    }
                    last_sent = Instant::now();
                }
                Some(Command::Close) | None => {
                    let _ = ws_tx.send(Message::Text(r#"{"type":"CloseStream"}"#.into())).await;
                    break;
                }
            },

            _ = keepalive.tick() => {
                if last_sent.elapsed() >= KEEPALIVE_INTERVAL {
                    if let Err(e) = ws_tx.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await {
                        warn!(%e, "Failed to send keepalive");
                        break;
                    }
                    last_sent = Instant::now();
                }
            }

            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = assembler.handle_text(&text) {
                        if events.send(event).await.is_err() {
                            debug!("Transcript receiver dropped, stopping stream");
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Transcription service closed the stream");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%e, "Transcription stream error");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = ws_tx.close().await;
    debug!("Transcription connection task finished");
}

// --- Deepgram response types ---

#[derive(Debug, Deserialize)]
struct DeepgramResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Stitches final segments into one utterance, released at the endpoint.
#[derive(Debug, Default)]
struct UtteranceAssembler {
    segments: Vec<String>,
    confidence: Option<f32>,
    duration: f64,
}

impl UtteranceAssembler {
    fn handle_text(&mut self, text: &str) -> Option<TranscriptEvent> {
        let response: DeepgramResponse = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!(%e, "Unparseable transcription message");
                return None;
            }
        };

        match response.kind.as_str() {
            "Results" => self.push_result(response),
            "UtteranceEnd" => self.take(),
            "Metadata" | "SpeechStarted" => None,
            "Error" => {
                warn!(description = ?response.description, "Transcription service reported an error");
                None
            }
            other => {
                debug!(kind = other, "Ignoring transcription message");
                None
            }
        }
    }

    fn push_result(&mut self, response: DeepgramResponse) -> Option<TranscriptEvent> {
        if response.is_final {
            if let Some(alt) = response
                .channel
                .as_ref()
                .and_then(|c| c.alternatives.first())
            {
                let words = alt.transcript.trim();
                if !words.is_empty() {
                    self.segments.push(words.to_string());
                    self.confidence = Some(match self.confidence {
                        Some(c) => c.min(alt.confidence),
                        None => alt.confidence,
                    });
                    self.duration += response.duration.unwrap_or_default();
                }
            }
        }

        if response.speech_final {
            self.take()
        } else {
            None
        }
    }

    fn take(&mut self) -> Option<TranscriptEvent> {
        if self.segments.is_empty() {
            return None;
        }
        let mut event = TranscriptEvent::new(self.segments.join(" "), self.confidence.unwrap_or_default());
        if self.duration > 0.0 {
            event.duration_secs = Some(self.duration);
        }
        self.segments.clear();
        self.confidence = None;
        self.duration = 0.0;
        Some(event)
    }
}
