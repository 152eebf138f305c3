//! Base [`Transfer`] descriptor: URL, per-transfer options, observer hooks,
//! and the follow-up (`next`) / predecessor (`before`) chain (spec §3, §4.2).
//!
//! The three transfer flavors (`HttpTransfer`, `SseTransfer`, `McpTransfer`)
//! are *composed*, not inherited, per the Design Notes: each embeds the one
//! below it and forwards to it, with [`AnyTransfer`] as the sum type the
//! Engine actually schedules.

pub mod http;
pub mod mcp;
pub mod sse;

use crate::buffer::StreamBuffer;
use crate::engine::Submitter;
use crate::error::TimeoutKind;

pub use http::HttpTransfer;
pub use mcp::McpTransfer;
pub use sse::SseTransfer;

/// Timing and status snapshot handed to `on_ready` / `on_error`, the Rust
/// analogue of curl's `info` block (spec §3, §4.5).
#[derive(Debug, Clone, Default)]
pub struct CompletionInfo {
    pub http_status: u16,
    pub connect_time_ms: u64,
    pub pretransfer_time_ms: u64,
    pub total_time_ms: u64,
    pub response_headers: Vec<(String, String)>,
    pub content_type: Option<String>,
}

impl CompletionInfo {
    /// Case-insensitive response header lookup, used to recover
    /// `Mcp-Session-Id` (spec §4.4).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub type ReadyHook = Box<dyn FnMut(&CompletionInfo, &StreamBuffer, &Submitter) + Send>;
pub type TimeoutHook = Box<dyn FnMut(TimeoutKind, u64, &Submitter) + Send>;
pub type ErrorHook = Box<dyn FnMut(&str, i32, &CompletionInfo, &Submitter) + Send>;
pub type StreamHook = Box<dyn FnMut(&[u8], &Submitter) -> bool + Send>;
pub type CompleteHook = Box<dyn FnMut(&Submitter) + Send>;

/// The sum type the Engine actually schedules. Follow-up chains may mix
/// flavors (an MCP auto-initialize chain is all-MCP; a plain HTTP crawl
/// chain is all-HTTP) because `next`/`before` hold `AnyTransfer`.
pub enum AnyTransfer {
    Http(HttpTransfer),
    Sse(SseTransfer),
    Mcp(McpTransfer),
}

impl AnyTransfer {
    pub fn core(&self) -> &TransferCore {
        match self {
            AnyTransfer::Http(t) => &t.core,
            AnyTransfer::Sse(t) => &t.http.core,
            AnyTransfer::Mcp(t) => &t.sse.http.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut TransferCore {
        match self {
            AnyTransfer::Http(t) => &mut t.core,
            AnyTransfer::Sse(t) => &mut t.http.core,
            AnyTransfer::Mcp(t) => &mut t.sse.http.core,
        }
    }

    pub fn url(&self) -> &str {
        &self.core().url
    }
}

/// Base descriptor carried by every transfer flavor (spec §3 "Transfer").
pub struct TransferCore {
    pub url: String,
    pub connection_timeout_ms: Option<u64>,
    pub total_timeout_ms: Option<u64>,
    streamable: bool,
    pub stream_aborted: bool,
    pub stream_buffer: StreamBuffer,

    before: Option<Box<AnyTransfer>>,
    next: Option<Box<AnyTransfer>>,

    pub(crate) on_ready: Option<ReadyHook>,
    pub(crate) on_timeout: Option<TimeoutHook>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_stream: Option<StreamHook>,
    pub(crate) on_complete: Option<CompleteHook>,
}

impl TransferCore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_timeout_ms: None,
            total_timeout_ms: None,
            streamable: false,
            stream_aborted: false,
            stream_buffer: StreamBuffer::new(),
            before: None,
            next: None,
            on_ready: None,
            on_timeout: None,
            on_error: None,
            on_stream: None,
            on_complete: None,
        }
    }

    /// Default timeout used for reporting when none was set (spec §3).
    pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

    pub fn effective_connection_timeout_ms(&self) -> u64 {
        self.connection_timeout_ms.unwrap_or(Self::DEFAULT_TIMEOUT_MS)
    }

    pub fn effective_total_timeout_ms(&self) -> u64 {
        self.total_timeout_ms.unwrap_or(Self::DEFAULT_TIMEOUT_MS)
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn is_streamable(&self) -> bool {
        self.streamable
    }

    pub fn force_streamable(&mut self, value: bool) {
        self.streamable = value;
    }

    pub fn set_on_ready(&mut self, hook: ReadyHook) {
        self.on_ready = Some(hook);
    }

    pub fn set_on_timeout(&mut self, hook: TimeoutHook) {
        self.on_timeout = Some(hook);
    }

    pub fn set_on_error(&mut self, hook: ErrorHook) {
        self.on_error = Some(hook);
    }

    /// Installing a stream observer implicitly marks the transfer
    /// streamable (spec §4.2).
    pub fn set_on_stream(&mut self, hook: StreamHook) {
        self.streamable = true;
        self.on_stream = Some(hook);
    }

    pub fn set_on_complete(&mut self, hook: CompleteHook) {
        self.on_complete = Some(hook);
    }

    /// Walks the `next` chain to its tail and attaches `t` there. O(chain
    /// length); chains are expected to stay short (≤ 4), per spec §4.2.
    pub fn append_next(&mut self, t: AnyTransfer) {
        let mut cursor = self;
        while cursor.next.is_some() {
            cursor = cursor.next.as_mut().unwrap().core_mut();
        }
        cursor.next = Some(Box::new(t));
    }

    /// Attaches `b` as predecessor. If `set_this_as_next`, appends the
    /// transfer `self` belongs to onto the tail of `b`'s `next` chain, so
    /// that control returns to it after `b` (and its existing successors)
    /// run. Because `self` can't be moved out of a `&mut self` method, the
    /// caller passes its own `AnyTransfer` in as `this` when the flag is
    /// set; see [`AnyTransfer::set_before`] for the ergonomic wrapper.
    pub fn set_before(&mut self, b: AnyTransfer) {
        self.before = Some(Box::new(b));
    }

    pub fn pop_next(&mut self) -> Option<AnyTransfer> {
        self.next.take().map(|b| *b)
    }

    pub fn pop_before(&mut self) -> Option<AnyTransfer> {
        self.before.take().map(|b| *b)
    }

    /// Mutable access to the `next` link without detaching it, used to
    /// propagate state (e.g. an MCP session id) forward along a follow-up
    /// chain that is still expected to run (spec §4.4 "Auto-init session
    /// propagation").
    pub fn next_mut(&mut self) -> Option<&mut AnyTransfer> {
        self.next.as_deref_mut()
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    pub fn has_before(&self) -> bool {
        self.before.is_some()
    }
}

impl AnyTransfer {
    /// Ergonomic wrapper over [`TransferCore::set_before`] that honors
    /// `set_this_as_next` by moving `self` onto the tail of `b`'s `next`
    /// chain first.
    pub fn set_before(mut self, mut b: AnyTransfer, set_this_as_next: bool) -> AnyTransfer {
        if set_this_as_next {
            b.core_mut().append_next(self);
            b
        } else {
            let core = self.core_mut();
            core.set_before(b);
            self
        }
    }
}
