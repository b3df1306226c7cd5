//! Gateway integration tests: start a real gateway and drive it over HTTP and
//! WebSocket the way the telephony side does.
//!
//! Run with: `cargo test -p switchboard-gateway --test integration`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use switchboard_core::config::{Config, GatewayConfig};
use switchboard_core::error::Result;
use switchboard_core::types::{MediaFrame, TranscriptEvent};
use switchboard_gateway::AppState;
use switchboard_media::reply::ReplyGenerator;
use switchboard_media::stt::{TranscriptionService, TranscriptionSink};
use switchboard_media::tts::VoiceConfig;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Transcribes every fifth frame as "frame <n>".
struct EchoTranscription {
    closes: Arc<Mutex<u32>>,
}

struct EchoSink {
    events: mpsc::Sender<TranscriptEvent>,
    frames: u32,
    closes: Arc<Mutex<u32>>,
    closed: bool,
}

#[async_trait]
impl TranscriptionService for EchoTranscription {
    async fn open(&self, events: mpsc::Sender<TranscriptEvent>) -> Result<Box<dyn TranscriptionSink>> {
        Ok(Box::new(EchoSink {
            events,
            frames: 0,
            closes: self.closes.clone(),
            closed: false,
        }))
    }
}

#[async_trait]
impl TranscriptionSink for EchoSink {
    fn send(&mut self, _frame: MediaFrame) -> Result<()> {
        self.frames += 1;
        if self.frames % 5 == 0 {
            let _ = self
                .events
                .try_send(TranscriptEvent::new(format!("frame {}", self.frames), 0.9));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            *self.closes.lock().unwrap() += 1;
        }
    }
}

/// Answers with 400 bytes of audio (three chunks).
struct CannedReplies;

#[async_trait]
impl ReplyGenerator for CannedReplies {
    async fn generate_reply(&self, utterance: &str, _persona_prompt: &str) -> Result<String> {
        Ok(format!("You said {utterance}"))
    }

    async fn synthesize(&self, _text: &str, _voice: &VoiceConfig) -> Result<Vec<u8>> {
        Ok(vec![0x7F; 400])
    }
}

/// Start a gateway with fake backends and return its state, port, and a
/// counter of transcription sink closes.
async fn start_test_gateway(greeting: Option<&str>) -> (Arc<AppState>, u16, Arc<Mutex<u32>>) {
    let port = find_free_port();
    let config = Config {
        gateway: Some(GatewayConfig {
            port,
            bind: Some("127.0.0.1".into()),
            public_host: None,
            greeting: greeting.map(str::to_string),
        }),
        ..Config::default()
    };

    let closes = Arc::new(Mutex::new(0));
    let state = Arc::new(AppState::new(
        Arc::new(config),
        Arc::new(EchoTranscription {
            closes: closes.clone(),
        }),
        Arc::new(CannedReplies),
    ));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = switchboard_gateway::start_gateway(state_clone, port).await;
    });

    // Wait for gateway to be ready
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }

    (state, port, closes)
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("websocket ok");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn media(payload: &str) -> Message {
    Message::Text(
        json!({"event": "media", "sequenceNumber": "2", "media": {"track": "inbound", "chunk": "1", "timestamp": "5", "payload": payload}})
            .to_string()
            .into(),
    )
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, port, _) = start_test_gateway(None).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["active_calls"], 0);
}

#[tokio::test]
async fn test_incoming_call_returns_twiml() {
    let (_state, port, _) = start_test_gateway(Some("The line is listening.")).await;

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/incoming-call"))
        .send()
        .await
        .unwrap();

    assert!(resp.status().is_success());
    assert_eq!(resp.headers()["content-type"], "application/xml");
    let body = resp.text().await.unwrap();
    assert!(body.contains("<Say>The line is listening.</Say>"));
    assert!(body.contains(&format!(r#"<Stream url="wss://127.0.0.1:{port}/media-stream" />"#)));
}

#[tokio::test]
async fn test_media_stream_round_trip() {
    let (state, port, closes) = start_test_gateway(None).await;

    let url = format!("ws://127.0.0.1:{port}/media-stream");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");

    // Peers announce themselves before `start`; that must not end the call.
    ws.send(Message::Text(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        json!({
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "streamSid": "MZ-int-1",
                "callSid": "CA123",
                "accountSid": "AC123",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            },
            "streamSid": "MZ-int-1"
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    // 160 bytes of mu-law silence, base64.
    let silence = "/".repeat(212) + "/w==";
    for _ in 0..5 {
        ws.send(media(&silence)).await.unwrap();
    }

    let mut chunks = 0;
    loop {
        let msg = next_json(&mut ws).await;
        assert_eq!(msg["streamSid"], "MZ-int-1");
        match msg["event"].as_str() {
            Some("media") => chunks += 1,
            Some("mark") => {
                assert_eq!(msg["mark"]["name"], "reply_complete");
                break;
            }
            other => panic!("unexpected outbound event {other:?}"),
        }
    }
    assert_eq!(chunks, 3);
    assert_eq!(state.active_calls(), 1);

    ws.send(Message::Text(r#"{"event":"stop","streamSid":"MZ-int-1"}"#.into()))
        .await
        .unwrap();

    // The gateway closes the socket after `stop`.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*closes.lock().unwrap(), 1);
    assert_eq!(state.active_calls(), 0);
}

#[tokio::test]
async fn test_dropped_connection_closes_sink() {
    let (state, port, closes) = start_test_gateway(None).await;

    let url = format!("ws://127.0.0.1:{port}/media-stream");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");
    ws.send(Message::Text(r#"{"event":"start","start":{"streamSid":"MZ-int-2"}}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"foo":"bar"}"#.into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.active_calls(), 1);

    drop(ws);

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if state.active_calls() == 0 {
            break;
        }
    }
    assert_eq!(state.active_calls(), 0);
    assert_eq!(*closes.lock().unwrap(), 1);
}
