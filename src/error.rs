//! Error types for flightdeck.
//!
//! One variant per error kind in the taxonomy: configuration errors are
//! raised synchronously at construction time and never deferred; transport,
//! timeout, and RPC errors are dispatched to a `Transfer`'s observer hooks
//! and never propagated as a `Result` out of [`crate::engine::Engine::run`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid HTTP method, unsupported content-type for a mapping body, or
    /// JSON-encode failure of a mapping body (spec §7, "Configuration error").
    #[error("configuration error: {0}")]
    Config(String),

    /// DNS failure, connection refused, TLS failure, or other transport-level
    /// failure surfaced with the backend-native code and message.
    #[error("transport error ({code}): {message}")]
    Transport { code: i32, message: String },

    /// A well-formed JSON-RPC error object received through the MCP message
    /// hook (spec §7, "RPC error").
    #[error("rpc error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// An RPC error received on the automatic-initialize transfer, wrapped
    /// with context before being forwarded to the main transfer's hooks.
    #[error("MCP initialization error: {0}")]
    McpInit(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url error: {0}")]
    Url(#[from] url::ParseError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The two flavors of timeout the Engine distinguishes via the backend's
/// timing info (spec §4.5, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connection,
    Total,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Connection => write!(f, "connection"),
            TimeoutKind::Total => write!(f, "total"),
        }
    }
}
