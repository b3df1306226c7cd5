//! Core types, config, errors, and the telephony wire protocol for Switchboard.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
