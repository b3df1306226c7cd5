use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telephony sample rate (Hz).
pub const SAMPLE_RATE: u32 = 8000;

/// Wire encoding name used by the transcription and synthesis services.
pub const ENCODING: &str = "mulaw";

/// Duration of one playout frame in milliseconds.
pub const FRAME_MS: u64 = 20;

/// Bytes per playout frame: 8-bit mu-law at 8 kHz, 20 ms.
pub const FRAME_BYTES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

/// Mark name sent after the last chunk of a reply.
pub const REPLY_COMPLETE_MARK: &str = "reply_complete";

/// Which way a frame travels relative to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Raw 8-bit mu-law samples at 8 kHz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub samples: Vec<u8>,
    pub direction: Direction,
}

impl MediaFrame {
    pub fn inbound(samples: Vec<u8>) -> Self {
        Self {
            samples,
            direction: Direction::Inbound,
        }
    }

    pub fn outbound(samples: Vec<u8>) -> Self {
        Self {
            samples,
            direction: Direction::Outbound,
        }
    }

    /// Playback duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / SAMPLE_RATE as u64
    }
}

/// A finalized utterance from the transcription service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub confidence: f32,
    /// Audio time covered by the utterance, in seconds, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            duration_secs: None,
            received_at: Utc::now(),
        }
    }

    /// Whether the utterance carries any words at all.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}
