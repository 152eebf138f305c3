//! MCP "Streamable HTTP" transport binding (spec §4.4): automatic session
//! initialization, dual-mode (buffered-JSON / SSE) response handling, and
//! invalid-session recovery.
//!
//! Grounded on the teacher's `StreamableHttpTransport` (`transport/streamable_http.rs`)
//! for the session-id capture / propagation shape, generalized from a
//! pooled-connection client into a `Transfer` whose lifecycle the Engine
//! drives.

use super::http::{Body, HttpTransfer};
use super::sse::SseTransfer;
use super::{AnyTransfer, CompletionInfo};
use crate::buffer::StreamBuffer;
use crate::engine::Submitter;
use crate::error::{Error, Result};
use crate::rpc::RpcMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Delivers one decoded JSON-RPC message from a completed MCP response,
/// buffered or SSE alike (spec §4.4 "dual-mode response handling").
/// Returning `false` stops processing the rest of the batch.
pub type McpMessageHook = Box<dyn FnMut(&RpcMessage, &Submitter) -> bool + Send>;

/// Fires once a session id becomes known to this transfer, either from its
/// own response or propagated forward from an initialize transfer ahead of
/// it in the chain (spec §4.4 "enable_auto_initialize(... on_initialized?)").
pub type OnInitializedHook = Box<dyn FnMut(&str) + Send>;

/// Matches the common "session ... not found" / "session ... expired" / "no
/// valid session" phrasing MCP servers use in a body when a session id has
/// been invalidated, reproducing the spec's documented pattern verbatim:
/// `/session.*?(not found|expired)|no valid session/i` (spec §4.4
/// "Invalid-session recovery").
static INVALID_SESSION_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)session.*?(not found|expired)|no valid session").unwrap()
});

/// MCP-flavored transfer, composed on top of [`SseTransfer`] (which is
/// itself composed on top of [`HttpTransfer`]), per the Design Notes.
pub struct McpTransfer {
    pub sse: SseTransfer,
    pub message: RpcMessage,
    pub session_id: Option<String>,
    retried_after_invalid_session: bool,
    /// Set by [`McpTransfer::enable_auto_initialize`] and never consumed:
    /// the Engine reads it both at submission time (to decide whether to
    /// wire an initialize chain ahead of a session-less transfer) and
    /// again on invalid-session recovery (spec §4.4 steps 1-3).
    auto_initialize: Option<(Option<Value>, Option<Value>)>,
    /// True only for the synthetic `initialize` transfer built by
    /// [`McpTransfer::build_initialize_chain`]; marks it as the one whose
    /// decoded RPC error should be raised as a domain exception and
    /// forwarded to the main transfer rather than delivered to an
    /// application-installed message hook (spec §4.4 step 2a).
    pub(crate) is_initialize_transfer: bool,
    pub(crate) on_mcp_message: Option<McpMessageHook>,
    pub(crate) on_initialized: Option<OnInitializedHook>,
}

impl McpTransfer {
    pub fn new(url: impl Into<String>, message: RpcMessage) -> Result<Self> {
        let mut http = HttpTransfer::new(url);
        http.set_method("POST")?;
        http.set_content_type(Some("application/json"));
        http.set_header("accept", Some("application/json, text/event-stream"));
        let sse = SseTransfer::from_http(http);
        Ok(Self {
            sse,
            message,
            session_id: None,
            retried_after_invalid_session: false,
            auto_initialize: None,
            is_initialize_transfer: false,
            on_mcp_message: None,
            on_initialized: None,
        })
    }

    /// Installs the MCP message hook (spec §4.4 dual-mode dispatch).
    pub fn set_on_mcp_message(&mut self, hook: McpMessageHook) {
        self.on_mcp_message = Some(hook);
    }

    /// Installs the `on_initialized(session_id)` callback (spec §4.4
    /// `enable_auto_initialize`'s third argument).
    pub fn set_on_initialized(&mut self, hook: OnInitializedHook) {
        self.on_initialized = Some(hook);
    }

    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id.clone();
        self.sse.http.set_header("mcp-session-id", session_id.as_deref());
    }

    /// Keeps the request body and the `Last-Event-ID` resumption header
    /// (spec §3 "last_event_id", §6 "MCP wire contract") in sync with the
    /// current RPC message and SSE parser state.
    fn sync_body(&mut self) -> Result<()> {
        let value = serde_json::to_value(&self.message)?;
        self.sse.http.set_body(Some(Body::Mapping(value)))?;
        let last_id = self.sse.last_id.clone();
        self.sse.http.set_header("last-event-id", last_id.as_deref());
        Ok(())
    }

    /// Enables automatic initialization (spec §4.4 steps 1-3): when this
    /// transfer is submitted without a session id, the Engine wires an
    /// `initialize -> notifications/initialized` chain ahead of it via
    /// [`McpTransfer::build_initialize_chain`]. The same option also backs
    /// invalid-session recovery, which re-initializes using the same
    /// `client_info`/`capabilities` rather than defaults.
    pub fn enable_auto_initialize(&mut self, client_info: Option<Value>, capabilities: Option<Value>) {
        self.auto_initialize = Some((client_info, capabilities));
    }

    pub fn has_auto_initialize(&self) -> bool {
        self.auto_initialize.is_some()
    }

    /// Builds the `initialize -> notifications/initialized` chain (spec
    /// §4.4 steps 1-2b). Returns `None` if auto-initialize was never
    /// enabled. Returns the `initialize` transfer with the notification
    /// already appended as its `next`; the caller appends the real
    /// (hook-bearing) transfer after that via [`AnyTransfer::set_before`]
    /// with `set_this_as_next = true`.
    pub fn build_initialize_chain(&self) -> Result<Option<AnyTransfer>> {
        let Some((client_info, capabilities)) = self.auto_initialize.clone() else {
            return Ok(None);
        };

        let mut initialize = self.clone_for_request();
        initialize.is_initialize_transfer = true;
        initialize.message = RpcMessage::mcp_initialize(client_info, capabilities);
        initialize.sync_body()?;

        let mut notification = self.clone_for_request();
        notification.message = RpcMessage::mcp_initialized_notification();
        notification.sync_body()?;

        initialize
            .sse
            .http
            .core
            .append_next(AnyTransfer::Mcp(notification));

        Ok(Some(AnyTransfer::Mcp(initialize)))
    }

    /// Whether this response's body, given its status and payload, signals
    /// that the session id has been invalidated server-side and the
    /// request should be retried exactly once with a fresh session
    /// (spec §4.4 "Invalid-session recovery").
    pub fn is_invalid_session_response(&self, info: &CompletionInfo, body: &[u8]) -> bool {
        if self.retried_after_invalid_session || !self.has_auto_initialize() {
            return false;
        }
        if self.session_id.is_none() {
            return false;
        }
        info.http_status == 404 || INVALID_SESSION_BODY.is_match(&String::from_utf8_lossy(body))
    }

    pub fn mark_retried_after_invalid_session(&mut self) {
        self.retried_after_invalid_session = true;
        self.set_session_id(None);
    }

    /// Decode a completed (non-streaming) response body per the response's
    /// `Content-Type` (spec §4.4 "Dual-mode response handling"):
    /// `application/json` decodes directly; `text/event-stream` decodes by
    /// running the buffered bytes through the SSE line parser and taking
    /// the `data` payload of each event as a JSON-RPC message.
    pub fn decode_response(&mut self, content_type: Option<&str>, mut body: StreamBuffer) -> Result<Vec<RpcMessage>> {
        let is_sse = content_type
            .map(|ct| ct.to_ascii_lowercase().starts_with("text/event-stream"))
            .unwrap_or(false);
        if is_sse {
            let events = self.sse.feed(&mut body);
            events
                .into_iter()
                .filter(|e| !e.data.is_empty())
                .map(|e| serde_json::from_str::<RpcMessage>(&e.data).map_err(Error::from))
                .collect()
        } else {
            crate::rpc::parse_body(body.peek()).map_err(Error::from)
        }
    }

    pub fn to_request_spec(&mut self) -> Result<crate::backend::RequestSpec> {
        self.sync_body()?;
        self.sse.http.to_request_spec()
    }

    /// A cloned transfer is a fresh outgoing request (spec §4.2 "on clone"):
    /// it keeps the URL, headers, and session id, but drops hooks, the
    /// auto-initialize option, and the initialize-transfer marker.
    pub fn clone_for_request(&self) -> Self {
        Self {
            sse: self.sse.clone_for_request(),
            message: self.message.clone(),
            session_id: self.session_id.clone(),
            retried_after_invalid_session: false,
            auto_initialize: None,
            is_initialize_transfer: false,
            on_mcp_message: None,
            on_initialized: None,
        }
    }
}

impl From<McpTransfer> for AnyTransfer {
    fn from(t: McpTransfer) -> Self {
        AnyTransfer::Mcp(t)
    }
}
