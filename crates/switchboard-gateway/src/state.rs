//! Gateway shared state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

use switchboard_core::config::Config;
use switchboard_media::reply::{ConversationalReplier, ReplyGenerator};
use switchboard_media::stt::{DeepgramTranscriber, TranscriptionService};

use crate::bridge::{BridgeSettings, SessionBridge};

/// Shared gateway state accessible from all handlers and call sessions.
pub struct AppState {
    pub config: Arc<Config>,
    pub transcription: Arc<dyn TranscriptionService>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub settings: BridgeSettings,
    active_calls: AtomicUsize,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        transcription: Arc<dyn TranscriptionService>,
        replies: Arc<dyn ReplyGenerator>,
    ) -> Self {
        let settings = BridgeSettings::from_config(&config);
        Self {
            config,
            transcription,
            replies,
            settings,
            active_calls: AtomicUsize::new(0),
        }
    }

    /// Wire the configured transcription and reply backends.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let transcription = DeepgramTranscriber::from_config(&config.transcription())?;
        let replies = ConversationalReplier::from_config(&config)?;
        info!(
            provider = %config.transcription().provider,
            model = config.transcription().model(),
            "Transcription backend ready"
        );
        Ok(Self::new(
            Arc::new(config),
            Arc::new(transcription),
            Arc::new(replies),
        ))
    }

    /// A fresh bridge for one call.
    pub fn bridge(&self) -> SessionBridge {
        SessionBridge::new(
            self.transcription.clone(),
            self.replies.clone(),
            self.settings.clone(),
        )
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    /// Count a call as active until the returned guard drops.
    pub fn call_started(&self) -> CallGuard<'_> {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::metrics::record_call_start();
        CallGuard { state: self }
    }
}

pub struct CallGuard<'a> {
    state: &'a AppState,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.state.active_calls.fetch_sub(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::metrics::record_call_end();
    }
}
