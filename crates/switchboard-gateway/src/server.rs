//! Axum HTTP and WebSocket server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::connection::handle_media_stream;
use crate::state::AppState;

/// Path the telephony side opens the media stream on.
pub const MEDIA_STREAM_PATH: &str = "/media-stream";

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let app = Router::new()
        .route("/incoming-call", post(incoming_call_handler))
        .route(MEDIA_STREAM_PATH, get(media_stream_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let app = match crate::metrics::install_prometheus_recorder() {
        Ok(handle) => app.route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        ),
        Err(e) => {
            tracing::warn!(%e, "Prometheus recorder unavailable, /metrics disabled");
            app
        }
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Start the gateway and serve until Ctrl+C.
pub async fn start_gateway(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();
    let app = router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    info!("Point the telephony webhook at http://{addr}/incoming-call");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn incoming_call_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let host = state
        .config
        .gateway
        .as_ref()
        .and_then(|g| g.public_host.clone())
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        });

    let Some(host) = host.filter(|h| !h.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing Host Header").into_response();
    };

    info!(%host, "Incoming call, connecting media stream");
    (
        [(header::CONTENT_TYPE, "application/xml")],
        twiml_connect(state.config.greeting(), &host),
    )
        .into_response()
}

/// TwiML that greets the caller and connects the call audio to our stream.
pub fn twiml_connect(greeting: Option<&str>, host: &str) -> String {
    let say = greeting
        .map(|g| format!("<Say>{}</Say>", xml_escape(g)))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response>{say}<Connect><Stream url="wss://{}{MEDIA_STREAM_PATH}" /></Connect></Response>"#,
        xml_escape(host)
    )
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_media_stream(state, socket).await;
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_calls": state.active_calls(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(%e, "Failed to listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
