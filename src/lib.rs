//! Flightdeck: a bounded-concurrency HTTP transfer engine with deferred
//! submissions, per-transfer timeouts, streaming with early abort, SSE
//! framing, and an MCP "Streamable HTTP" JSON-RPC 2.0 transport with
//! automatic session initialization and recovery.

pub mod backend;
pub mod backlog;
pub mod buffer;
pub mod delay_queue;
pub mod engine;
pub mod error;
pub mod rpc;
pub mod transfer;

pub use backend::{Backend, Outcome, RequestSpec};
pub use buffer::StreamBuffer;
pub use engine::{Engine, Submitter};
pub use error::{Error, Result, TimeoutKind};
pub use rpc::RpcMessage;
pub use transfer::{AnyTransfer, CompletionInfo, HttpTransfer, McpTransfer, SseTransfer};

/// Installs a `tracing-subscriber` `fmt` layer driven by `RUST_LOG`
/// (defaulting to `info`), matching the teacher's `init_tracing` shape.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
