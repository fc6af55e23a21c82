//! Shared utilities for Voxbridge: configuration, logging, signaling types, error types.
//!
//! This crate provides common infrastructure used by the RTP bridge, the peer session
//! layer and the server binary.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod protocol;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use protocol::*;

/// Identifier of a user connected over the native voice protocol.
///
/// Stable for the lifetime of one native connection and never reused while live.
pub type SessionId = u32;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
