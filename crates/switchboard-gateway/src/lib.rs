//! Telephony media gateway.
//!
//! Hosts the call-setup webhook and the media-stream WebSocket, and runs one
//! [`bridge::SessionBridge`] per connected call: inbound audio goes to
//! streaming transcription, finished utterances are answered by the reply
//! pipeline, and synthesized audio is paced back to the caller.

pub mod bridge;
pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use bridge::{BridgeSettings, CloseReason, SessionBridge, SessionReport, SessionState};
pub use server::{router, start_gateway};
pub use state::AppState;
