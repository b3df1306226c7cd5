//! Per-call session bridge.
//!
//! One [`SessionBridge`] runs for each duplex connection. It walks the
//! `AwaitingStart -> Active -> Closed` state machine, forwards inbound audio
//! to the transcription sink, and hands finalized utterances to a reply task
//! that generates, synthesizes, and paces the answer back out. The reply
//! task runs beside ingestion so playout never stalls the inbound stream.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use switchboard_core::config::Config;
use switchboard_core::error::{BridgeError, Result};
use switchboard_core::protocol::{self, Envelope, MediaPayload, StartPayload};
use switchboard_core::types::{MediaFrame, TranscriptEvent};
use switchboard_media::pacer::{self, Outbound, PlayoutReport};
use switchboard_media::reply::ReplyGenerator;
use switchboard_media::stt::{TranscriptionService, TranscriptionSink};
use switchboard_media::tts::VoiceConfig;

/// Upper bound on a single transcription open, including the handshake.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest wait between reopen attempts.
const MAX_REOPEN_BACKOFF: Duration = Duration::from_secs(8);

/// Lifecycle of one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStart,
    Active,
    Closed,
}

/// What the bridge reads from the duplex connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// The peer closed the connection.
    Closed,
    /// The transport failed.
    Fault(String),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Stop,
    PeerClosed,
    ConnectionFault(String),
    SinkOpenFailed(String),
    Panicked,
}

impl CloseReason {
    /// Label for faults; `None` for an orderly end of call.
    pub fn fault_kind(&self) -> Option<&'static str> {
        match self {
            Self::Stop | Self::PeerClosed => None,
            Self::ConnectionFault(_) => Some("connection"),
            Self::SinkOpenFailed(_) => Some("transcription_service"),
            Self::Panicked => Some("panic"),
        }
    }
}

/// Static per-call settings taken from config.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub persona_prompt: String,
    pub voice: VoiceConfig,
    pub transcript_capacity: usize,
    pub reopen_backoff: Duration,
    pub reopen_attempts: u32,
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        let bridge = config.bridge();
        Self {
            persona_prompt: config.generation().persona_prompt().to_string(),
            voice: VoiceConfig::new(config.synthesis().voice()),
            transcript_capacity: bridge.transcript_channel_capacity.max(1),
            reopen_backoff: Duration::from_millis(bridge.reopen_backoff_ms),
            reopen_attempts: bridge.reopen_attempts,
        }
    }
}

/// Summary returned when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub stream_sid: Option<String>,
    pub transitions: Vec<(SessionState, SessionState)>,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    /// Transcription streams opened, the first included.
    pub transcription_opens: u64,
    pub envelopes_ignored: u64,
    pub transcripts_received: u64,
    pub transcripts_ignored: u64,
    pub transcripts_superseded: u64,
    pub replies_played: u64,
    pub replies_skipped: u64,
    pub close_reason: CloseReason,
}

/// State shared between the ingestion loop and the reply task.
struct SessionShared {
    stream_sid: String,
    /// Depth-1 queue: a newer utterance replaces one still waiting.
    pending: Mutex<Option<TranscriptEvent>>,
    wake: Notify,
    /// Set while the reply task is generating or playing an answer.
    in_flight: AtomicBool,
    superseded: AtomicU64,
    replies_played: AtomicU64,
    replies_skipped: AtomicU64,
}

impl SessionShared {
    fn new(stream_sid: String) -> Self {
        Self {
            stream_sid,
            pending: Mutex::new(None),
            wake: Notify::new(),
            in_flight: AtomicBool::new(false),
            superseded: AtomicU64::new(0),
            replies_played: AtomicU64::new(0),
            replies_skipped: AtomicU64::new(0),
        }
    }

    fn offer(&self, event: TranscriptEvent) {
        let replaced = {
            let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(event)
        };
        if let Some(old) = replaced {
            self.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(
                stream_sid = %self.stream_sid,
                dropped = %old.text,
                busy = self.in_flight.load(Ordering::Relaxed),
                "Pending utterance superseded"
            );
        }
        self.wake.notify_one();
    }

    fn take(&self) -> Option<TranscriptEvent> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Runs one call session over an abstract duplex connection.
pub struct SessionBridge {
    transcription: Arc<dyn TranscriptionService>,
    replies: Arc<dyn ReplyGenerator>,
    settings: BridgeSettings,
}

impl SessionBridge {
    pub fn new(
        transcription: Arc<dyn TranscriptionService>,
        replies: Arc<dyn ReplyGenerator>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            transcription,
            replies,
            settings,
        }
    }

    /// Drive a session until it closes.
    ///
    /// Never fails and never panics outward: every exit path, including a
    /// panic inside the session, ends in teardown, which closes the sink
    /// exactly once and stops the reply task.
    pub async fn run<S>(self, mut inbound: S, out: Outbound) -> SessionReport
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        let mut session = Session::new(self, out);

        let reason = match AssertUnwindSafe(session.drive(&mut inbound))
            .catch_unwind()
            .await
        {
            Ok(reason) => reason,
            Err(_) => {
                error!(stream_sid = ?session.stream_sid, "Session panicked, closing");
                CloseReason::Panicked
            }
        };

        session.teardown(reason).await
    }
}

struct Session {
    bridge: SessionBridge,
    out: Outbound,
    state: SessionState,
    stream_sid: Option<String>,
    sink: Option<Box<dyn TranscriptionSink>>,
    transcripts: Option<mpsc::Receiver<TranscriptEvent>>,
    /// Set once the transcription stream is lost; reopen is allowed from then.
    reopen_at: Option<Instant>,
    /// Reopens tried since the last transcript arrived.
    reopen_attempts: u32,
    shared: Option<Arc<SessionShared>>,
    reply_task: Option<JoinHandle<()>>,
    transitions: Vec<(SessionState, SessionState)>,
    frames_forwarded: u64,
    frames_dropped: u64,
    transcription_opens: u64,
    envelopes_ignored: u64,
    transcripts_received: u64,
    transcripts_ignored: u64,
}

impl Session {
    fn new(bridge: SessionBridge, out: Outbound) -> Self {
        Self {
            bridge,
            out,
            state: SessionState::AwaitingStart,
            stream_sid: None,
            sink: None,
            transcripts: None,
            reopen_at: None,
            reopen_attempts: 0,
            shared: None,
            reply_task: None,
            transitions: Vec::new(),
            frames_forwarded: 0,
            frames_dropped: 0,
            transcription_opens: 0,
            envelopes_ignored: 0,
            transcripts_received: 0,
            transcripts_ignored: 0,
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        debug!(stream_sid = ?self.stream_sid, from = ?self.state, to = ?to, "Session state change");
        self.transitions.push((self.state, to));
        self.state = to;
    }

    async fn drive<S>(&mut self, inbound: &mut S) -> CloseReason
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        loop {
            tokio::select! {
                message = inbound.next() => match message {
                    Some(Inbound::Text(text)) => {
                        if let Some(reason) = self.handle_text(&text).await {
                            return reason;
                        }
                    }
                    Some(Inbound::Closed) | None => return CloseReason::PeerClosed,
                    Some(Inbound::Fault(e)) => return CloseReason::ConnectionFault(e),
                },

                event = next_transcript(&mut self.transcripts) => match event {
                    Some(event) => self.handle_transcript(event),
                    None => self.lose_transcription("transcription stream ended").await,
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Option<CloseReason> {
        let envelope = match protocol::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(state = ?self.state, %e, "Ignoring malformed envelope");
                self.envelopes_ignored += 1;
                return None;
            }
        };

        match (self.state, envelope) {
            (SessionState::AwaitingStart, Envelope::Start { start, .. }) => self.begin(start).await,
            (SessionState::Active, Envelope::Media { media, .. }) => {
                self.forward(media).await;
                None
            }
            (SessionState::Active, Envelope::Stop { .. }) => {
                info!(stream_sid = ?self.stream_sid, "Stream stopped by peer");
                Some(CloseReason::Stop)
            }
            (SessionState::Active, Envelope::Mark { mark, .. }) => {
                debug!(stream_sid = ?self.stream_sid, name = %mark.name, "Playout mark acknowledged");
                None
            }
            (state, envelope) => {
                debug!(state = ?state, event = envelope.event_name(), "Ignoring unexpected envelope");
                self.envelopes_ignored += 1;
                None
            }
        }
    }

    async fn begin(&mut self, start: StartPayload) -> Option<CloseReason> {
        let stream_sid = start.stream_sid;
        self.stream_sid = Some(stream_sid.clone());

        if let Some(format) = start.media_format.as_ref().filter(|f| !f.is_mulaw_8k()) {
            warn!(
                stream_sid = %stream_sid,
                encoding = %format.encoding,
                sample_rate = format.sample_rate,
                "Unexpected media format, treating audio as 8 kHz mu-law"
            );
        }

        if let Err(e) = self.open_transcription().await {
            error!(stream_sid = %stream_sid, %e, "Failed to open transcription stream");
            return Some(CloseReason::SinkOpenFailed(e.to_string()));
        }

        let shared = Arc::new(SessionShared::new(stream_sid.clone()));
        self.reply_task = Some(tokio::spawn(reply_worker(
            shared.clone(),
            self.bridge.replies.clone(),
            self.bridge.settings.clone(),
            self.out.clone(),
        )));
        self.shared = Some(shared);

        self.transition(SessionState::Active);
        info!(stream_sid = %stream_sid, call_sid = ?start.call_sid, "Stream started");
        None
    }

    async fn open_transcription(&mut self) -> Result<()> {
        let (events_tx, events_rx) = mpsc::channel(self.bridge.settings.transcript_capacity);
        let sink = tokio::time::timeout(OPEN_TIMEOUT, self.bridge.transcription.open(events_tx))
            .await
            .map_err(|_| BridgeError::TranscriptionServiceFault("open timed out".into()))??;
        self.sink = Some(sink);
        self.transcripts = Some(events_rx);
        self.transcription_opens += 1;
        Ok(())
    }

    /// Close a dead transcription stream and schedule a reopen.
    ///
    /// Ingestion carries on meanwhile; frames that arrive without a stream
    /// are dropped.
    async fn lose_transcription(&mut self, why: &str) {
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
        self.transcripts = None;
        warn!(stream_sid = ?self.stream_sid, why, "Transcription stream lost");
        self.schedule_reopen();
    }

    fn schedule_reopen(&mut self) {
        let settings = &self.bridge.settings;
        if self.reopen_attempts >= settings.reopen_attempts {
            warn!(
                stream_sid = ?self.stream_sid,
                attempts = self.reopen_attempts,
                "Giving up on transcription for this call"
            );
            self.reopen_at = None;
            return;
        }
        let delay = settings
            .reopen_backoff
            .saturating_mul(1 << self.reopen_attempts.min(6))
            .min(MAX_REOPEN_BACKOFF);
        debug!(stream_sid = ?self.stream_sid, ?delay, "Transcription reopen scheduled");
        self.reopen_at = Some(Instant::now() + delay);
    }

    /// Reopen the transcription stream if one is due. Returns whether a sink is open.
    async fn ensure_transcription(&mut self) -> bool {
        if self.sink.is_some() {
            return true;
        }
        match self.reopen_at {
            Some(at) if Instant::now() >= at => {}
            _ => return false,
        }

        self.reopen_attempts += 1;
        match self.open_transcription().await {
            Ok(()) => {
                self.reopen_at = None;
                info!(stream_sid = ?self.stream_sid, attempt = self.reopen_attempts, "Transcription stream reopened");
                true
            }
            Err(e) => {
                warn!(stream_sid = ?self.stream_sid, attempt = self.reopen_attempts, %e, "Transcription reopen failed");
                self.schedule_reopen();
                false
            }
        }
    }

    async fn forward(&mut self, media: MediaPayload) {
        if !self.ensure_transcription().await {
            self.drop_frame();
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.send(MediaFrame::inbound(media.payload)) {
            Ok(()) => {
                self.frames_forwarded += 1;
                #[cfg(feature = "metrics")]
                crate::metrics::record_media_frame();
            }
            Err(e) => {
                self.drop_frame();
                self.lose_transcription(&e.to_string()).await;
            }
        }
    }

    fn drop_frame(&mut self) {
        if self.frames_dropped == 0 {
            warn!(stream_sid = ?self.stream_sid, "Dropping audio, transcription stream unavailable");
        }
        self.frames_dropped += 1;
    }

    fn handle_transcript(&mut self, event: TranscriptEvent) {
        self.transcripts_received += 1;
        self.reopen_attempts = 0;

        if event.is_empty() {
            self.transcripts_ignored += 1;
            debug!(stream_sid = ?self.stream_sid, "Ignoring empty transcript");
            return;
        }
        let Some(shared) = self.shared.as_ref() else {
            self.transcripts_ignored += 1;
            return;
        };

        info!(
            stream_sid = %shared.stream_sid,
            text = %event.text,
            confidence = event.confidence,
            busy = shared.in_flight.load(Ordering::Relaxed),
            "Caller said"
        );
        shared.offer(event);
    }

    async fn teardown(mut self, reason: CloseReason) -> SessionReport {
        if let Some(task) = self.reply_task.take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
        self.transcripts = None;
        self.transition(SessionState::Closed);

        if let Some(kind) = reason.fault_kind() {
            warn!(stream_sid = ?self.stream_sid, kind, reason = ?reason, "Session ended by fault");
            #[cfg(feature = "metrics")]
            crate::metrics::record_session_fault(kind);
        }

        let (superseded, played, skipped) = match self.shared.as_ref() {
            Some(shared) => (
                shared.superseded.load(Ordering::Relaxed),
                shared.replies_played.load(Ordering::Relaxed),
                shared.replies_skipped.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0),
        };

        let report = SessionReport {
            stream_sid: self.stream_sid,
            transitions: self.transitions,
            frames_forwarded: self.frames_forwarded,
            frames_dropped: self.frames_dropped,
            transcription_opens: self.transcription_opens,
            envelopes_ignored: self.envelopes_ignored,
            transcripts_received: self.transcripts_received,
            transcripts_ignored: self.transcripts_ignored,
            transcripts_superseded: superseded,
            replies_played: played,
            replies_skipped: skipped,
            close_reason: reason,
        };
        info!(
            stream_sid = ?report.stream_sid,
            frames = report.frames_forwarded,
            transcripts = report.transcripts_received,
            replies = report.replies_played,
            reason = ?report.close_reason,
            "Session closed"
        );
        report
    }
}

async fn next_transcript(rx: &mut Option<mpsc::Receiver<TranscriptEvent>>) -> Option<TranscriptEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Answers queued utterances one at a time for the life of the session.
async fn reply_worker(
    shared: Arc<SessionShared>,
    replies: Arc<dyn ReplyGenerator>,
    settings: BridgeSettings,
    out: Outbound,
) {
    loop {
        shared.wake.notified().await;

        while let Some(event) = shared.take() {
            shared.in_flight.store(true, Ordering::Relaxed);
            let outcome = AssertUnwindSafe(respond(
                replies.as_ref(),
                &settings,
                &out,
                &shared.stream_sid,
                &event.text,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(BridgeError::Other(anyhow::anyhow!("reply pipeline panicked"))));
            shared.in_flight.store(false, Ordering::Relaxed);

            match outcome {
                Ok(report) => {
                    shared.replies_played.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_reply("played");
                    info!(stream_sid = %shared.stream_sid, chunks = report.chunks, "Reply played");
                }
                Err(e) if e.is_terminal() => {
                    debug!(stream_sid = %shared.stream_sid, %e, "Connection gone, reply task stopping");
                    return;
                }
                Err(e) => {
                    shared.replies_skipped.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_reply(e.kind());
                    warn!(stream_sid = %shared.stream_sid, kind = e.kind(), %e, "Skipping reply");
                }
            }
        }
    }
}

async fn respond(
    replies: &dyn ReplyGenerator,
    settings: &BridgeSettings,
    out: &Outbound,
    stream_sid: &str,
    utterance: &str,
) -> Result<PlayoutReport> {
    let text = replies.generate_reply(utterance, &settings.persona_prompt).await?;
    info!(stream_sid, reply = %text, "Replying");
    let audio = replies.synthesize(&text, &settings.voice).await?;
    if out.is_closed() {
        return Err(BridgeError::ConnectionFault("outbound writer closed".into()));
    }
    pacer::play(out, stream_sid, &audio).await
}
