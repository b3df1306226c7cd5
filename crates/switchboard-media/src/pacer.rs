//! Playout pacing: sends synthesized audio at the rate the far end plays it.
//!
//! Audio is cut into 160-byte (20 ms) mu-law chunks and one `media`
//! envelope goes out per frame period, followed by a `reply_complete` mark.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use switchboard_core::error::{BridgeError, Result};
use switchboard_core::protocol::{self, Envelope};
use switchboard_core::types::{FRAME_BYTES, FRAME_MS};

/// Handle to the single writer that owns the outbound half of a connection.
///
/// Cloning is cheap; every clone feeds the same writer task, so writes are
/// serialized no matter how many senders exist.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Create an outbound handle plus the receiving end for the writer task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Encode and queue an envelope for the writer.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = protocol::encode(envelope)?;
        self.tx
            .send(text)
            .map_err(|_| BridgeError::ConnectionFault("outbound writer closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Summary of one playout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayoutReport {
    pub chunks: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// Number of `media` envelopes needed for `len` bytes of audio.
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(FRAME_BYTES)
}

/// Send `audio` to `stream_sid` one frame period at a time, then mark the end.
pub async fn play(out: &Outbound, stream_sid: &str, audio: &[u8]) -> Result<PlayoutReport> {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
    // A late tick pushes the schedule back instead of bursting to catch up.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut chunks = 0;
    for chunk in audio.chunks(FRAME_BYTES) {
        // The first tick completes immediately.
        ticker.tick().await;
        out.send(&Envelope::media(stream_sid, chunk.to_vec()))?;
        chunks += 1;
    }

    out.send(&Envelope::reply_complete(stream_sid))?;

    let report = PlayoutReport {
        chunks,
        bytes: audio.len(),
        elapsed: started.elapsed(),
    };
    debug!(stream_sid, chunks, bytes = report.bytes, elapsed = ?report.elapsed, "Playout finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::types::REPLY_COMPLETE_MARK;

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(protocol::decode(&text).unwrap());
        }
        out
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(160), 1);
        assert_eq!(chunk_count(161), 2);
        assert_eq!(chunk_count(325), 3);
    }

    #[tokio::test]
    async fn test_play_325_bytes() {
        let (out, mut rx) = Outbound::channel();
        let audio = vec![0x7Fu8; 325];

        let started = Instant::now();
        let report = play(&out, "MZ1", &audio).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.chunks, 3);
        assert_eq!(report.bytes, 325);
        assert!(elapsed >= Duration::from_millis(40), "paced too fast: {elapsed:?}");

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 4);
        let sizes: Vec<usize> = sent[..3]
            .iter()
            .map(|e| match e {
                Envelope::Media { stream_sid, media } => {
                    assert_eq!(stream_sid.as_deref(), Some("MZ1"));
                    media.payload.len()
                }
                other => panic!("expected media, got {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![160, 160, 5]);

        match &sent[3] {
            Envelope::Mark { stream_sid, mark } => {
                assert_eq!(stream_sid.as_deref(), Some("MZ1"));
                assert_eq!(mark.name, REPLY_COMPLETE_MARK);
            }
            other => panic!("expected mark, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_play_preserves_audio_bytes() {
        let (out, mut rx) = Outbound::channel();
        let audio: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        play(&out, "MZ2", &audio).await.unwrap();

        let mut reassembled = Vec::new();
        for envelope in drain(&mut rx) {
            if let Envelope::Media { media, .. } = envelope {
                reassembled.extend(media.payload);
            }
        }
        assert_eq!(reassembled, audio);
    }

    #[tokio::test]
    async fn test_play_empty_buffer_sends_only_mark() {
        let (out, mut rx) = Outbound::channel();
        let report = play(&out, "MZ3", &[]).await.unwrap();
        assert_eq!(report.chunks, 0);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_name(), "mark");
    }

    #[tokio::test]
    async fn test_play_to_closed_connection_is_connection_fault() {
        let (out, rx) = Outbound::channel();
        drop(rx);
        assert!(out.is_closed());
        let err = play(&out, "MZ4", &[0u8; 200]).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionFault(_)));
    }
}
