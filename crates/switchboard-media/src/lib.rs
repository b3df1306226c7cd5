//! Media pipeline for phone calls.
//!
//! Streaming transcription in, generated and synthesized replies out, paced
//! at the rate the caller's handset plays them.

pub mod pacer;
pub mod reply;
pub mod stt;
pub mod tts;
