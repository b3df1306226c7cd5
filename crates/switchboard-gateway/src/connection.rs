//! Media-stream WebSocket lifecycle: writer task, read loop, session bridge.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_media::pacer::Outbound;

use crate::bridge::{Inbound, SessionReport};
use crate::state::AppState;

/// How long the writer gets to flush queued envelopes after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Map one WebSocket read into bridge input. `None` skips the message.
fn to_inbound(message: Result<Message, axum::Error>) -> Option<Inbound> {
    match message {
        Ok(Message::Text(text)) => Some(Inbound::Text(text.to_string())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Inbound::Text(text)),
            Err(_) => {
                debug!("Ignoring non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Close(_)) => Some(Inbound::Closed),
        // Axum answers pings itself.
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(e) => Some(Inbound::Fault(e.to_string())),
    }
}

/// Handle one media-stream connection until the call ends.
pub async fn handle_media_stream(state: Arc<AppState>, ws: WebSocket) -> SessionReport {
    let conn_id = Uuid::new_v4().to_string();
    let _call = state.call_started();
    info!(conn_id = %conn_id, active_calls = state.active_calls(), "Media stream connected");

    let (mut ws_tx, ws_rx) = ws.split();
    let (outbound, mut outbound_rx) = Outbound::channel();

    // Single writer: every envelope for this connection goes through here.
    let writer_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                debug!(conn_id = %writer_conn_id, %e, "Media stream writer stopped");
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let inbound = ws_rx.filter_map(|message| futures::future::ready(to_inbound(message)));
    let report = state.bridge().run(Box::pin(inbound), outbound).await;

    // The bridge dropped its outbound handle; the writer ends once drained.
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        warn!(conn_id = %conn_id, "Media stream writer did not drain, aborting");
        send_task.abort();
    }

    info!(
        conn_id = %conn_id,
        stream_sid = ?report.stream_sid,
        reason = ?report.close_reason,
        "Media stream closed"
    );
    report
}
