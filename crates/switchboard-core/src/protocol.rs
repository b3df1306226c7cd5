//! Telephony media-stream wire protocol.
//!
//! Every message on the duplex connection is a JSON object tagged by its
//! `event` field. Audio travels base64-encoded inside `media.payload`; the
//! codec transcodes it so callers only ever see raw mu-law bytes.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::types::{ENCODING, REPLY_COMPLETE_MARK, SAMPLE_RATE};

/// A media-stream envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Envelope {
    /// Stream opened by the telephony side.
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        start: StartPayload,
    },

    /// One frame of audio.
    #[serde(rename_all = "camelCase")]
    Media {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        media: MediaPayload,
    },

    /// Stream ended by the telephony side.
    #[serde(rename_all = "camelCase")]
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },

    /// Named position in the outbound audio.
    #[serde(rename_all = "camelCase")]
    Mark {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub stream_sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<String>,
    /// Informational only; a format that does not parse is dropped, not fatal.
    #[serde(
        default,
        deserialize_with = "lenient::media_format",
        skip_serializing_if = "Option::is_none"
    )]
    pub media_format: Option<MediaFormat>,
}

/// Audio format announced in the `start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

impl MediaFormat {
    /// Whether the announced format is the 8 kHz mono mu-law the bridge expects.
    pub fn is_mulaw_8k(&self) -> bool {
        self.encoding.to_ascii_lowercase().contains(ENCODING)
            && self.sample_rate == SAMPLE_RATE
            && self.channels == 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Raw mu-law bytes; base64 on the wire.
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    /// Peers send these as strings or numbers.
    #[serde(
        default,
        deserialize_with = "lenient::string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub chunk: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

impl Envelope {
    pub fn start(stream_sid: impl Into<String>) -> Self {
        Self::Start {
            stream_sid: None,
            start: StartPayload {
                stream_sid: stream_sid.into(),
                call_sid: None,
                account_sid: None,
                tracks: Vec::new(),
                media_format: None,
            },
        }
    }

    /// Outbound audio addressed to a stream.
    pub fn media(stream_sid: impl Into<String>, samples: Vec<u8>) -> Self {
        Self::Media {
            stream_sid: Some(stream_sid.into()),
            media: MediaPayload {
                payload: samples,
                track: None,
                chunk: None,
                timestamp: None,
            },
        }
    }

    pub fn stop() -> Self {
        Self::Stop { stream_sid: None }
    }

    pub fn mark(stream_sid: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Mark {
            stream_sid: Some(stream_sid.into()),
            mark: MarkPayload { name: name.into() },
        }
    }

    /// The end-of-playout mark for a stream.
    pub fn reply_complete(stream_sid: impl Into<String>) -> Self {
        Self::mark(stream_sid, REPLY_COMPLETE_MARK)
    }

    /// Wire name of the `event` tag.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Media { .. } => "media",
            Self::Stop { .. } => "stop",
            Self::Mark { .. } => "mark",
        }
    }

    /// Stream id carried by this envelope, if any.
    pub fn stream_sid(&self) -> Option<&str> {
        match self {
            Self::Start { start, .. } => Some(start.stream_sid.as_str()),
            Self::Media { stream_sid, .. }
            | Self::Stop { stream_sid }
            | Self::Mark { stream_sid, .. } => stream_sid.as_deref(),
        }
    }
}

/// Parse one text message from the duplex connection.
pub fn decode(raw: &str) -> Result<Envelope> {
    serde_json::from_str(raw).map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))
}

/// Serialize an envelope for the duplex connection.
pub fn encode(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Deserializers for informational fields whose shape varies between peers.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::MediaFormat;

    pub fn media_format<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<MediaFormat>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(serde_json::from_value(value).ok())
    }

    pub fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
