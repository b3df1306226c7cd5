use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Inbound text that is not a recognizable envelope. Ignored by the bridge.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Transcription service fault: {0}")]
    TranscriptionServiceFault(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// The duplex connection failed or went away. Ends the session.
    #[error("Connection fault: {0}")]
    ConnectionFault(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Whether this error ends the call session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionFault(_))
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::TranscriptionServiceFault(_) => "transcription_service",
            Self::Generation(_) => "generation",
            Self::Synthesis(_) => "synthesis",
            Self::ConnectionFault(_) => "connection",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
