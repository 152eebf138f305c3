//! The scheduler: bounded concurrency, deferred submissions, the low
//! watermark refill hook, and per-transfer hook dispatch (spec §4.1, §4.5).
//!
//! Modeled on the teacher's pooled-connection-manager event loop, but here
//! the pool bounds *concurrent transfers* rather than *physical
//! connections* — `reqwest::Client` manages its own connection pool
//! beneath this layer.

use crate::backend::{Backend, Outcome, RequestSpec};
use crate::backlog::Backlog;
use crate::delay_queue::DelayQueue;
use crate::error::Result;
use crate::rpc::RpcMessage;
use crate::transfer::http::HttpTransfer;
use crate::transfer::{AnyTransfer, CompletionInfo};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

struct SubmitRequest {
    transfer: AnyTransfer,
    due: Option<Instant>,
    front_insert: bool,
}

/// Handle for reentrant submission from inside an observer hook (spec
/// §4.2 "hooks may submit further work"). Cheap to clone; every clone
/// shares the same channel back into the owning [`Engine`].
#[derive(Clone)]
pub struct Submitter {
    tx: mpsc::UnboundedSender<SubmitRequest>,
}

impl Submitter {
    pub fn submit(&self, transfer: AnyTransfer) {
        let _ = self.tx.send(SubmitRequest {
            transfer,
            due: None,
            front_insert: false,
        });
    }

    pub fn submit_after(&self, transfer: AnyTransfer, delay: Duration) {
        let _ = self.tx.send(SubmitRequest {
            transfer,
            due: Some(Instant::now() + delay),
            front_insert: false,
        });
    }

    pub fn submit_front(&self, transfer: AnyTransfer) {
        let _ = self.tx.send(SubmitRequest {
            transfer,
            due: None,
            front_insert: true,
        });
    }
}

/// The bounded-concurrency HTTP transfer engine (spec §4.1 "Engine").
pub struct Engine {
    backend: Backend,
    max_concurrency: usize,
    low_watermark_factor: u32,
    backlog: Backlog,
    delay_queue: DelayQueue,
    refill_hook: Option<Box<dyn FnMut(&Submitter) + Send>>,
    submit_tx: mpsc::UnboundedSender<SubmitRequest>,
    submit_rx: mpsc::UnboundedReceiver<SubmitRequest>,
}

impl Engine {
    pub fn new(backend: Backend, max_concurrency: usize) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            max_concurrency: max_concurrency.max(1),
            low_watermark_factor: 2,
            backlog: Backlog::new(),
            delay_queue: DelayQueue::new(),
            refill_hook: None,
            submit_tx,
            submit_rx,
        }
    }

    /// Sets `low_watermark_factor` (spec §3: an integer, default 2).
    pub fn with_low_watermark_factor(mut self, factor: u32) -> Self {
        self.low_watermark_factor = factor;
        self
    }

    /// Installs the refill hook, invoked synchronously whenever the backlog
    /// size drops below `max_concurrency * low_watermark_factor` (spec §4.5
    /// "low watermark refill", Glossary "Low watermark").
    pub fn set_refill_hook(&mut self, hook: Box<dyn FnMut(&Submitter) + Send>) {
        self.refill_hook = Some(hook);
    }

    /// Handle usable to submit work before [`Engine::run`] is called, or
    /// to give to a refill hook / observer hook for reentrant submission.
    pub fn submitter(&self) -> Submitter {
        Submitter {
            tx: self.submit_tx.clone(),
        }
    }

    pub fn submit(&mut self, transfer: AnyTransfer) -> Result<()> {
        self.enqueue(transfer, None, false)
    }

    pub fn submit_after(&mut self, transfer: AnyTransfer, delay: Duration) -> Result<()> {
        self.enqueue(transfer, Some(Instant::now() + delay), false)
    }

    pub fn submit_front(&mut self, transfer: AnyTransfer) -> Result<()> {
        self.enqueue(transfer, None, true)
    }

    fn enqueue(&mut self, transfer: AnyTransfer, due: Option<Instant>, front_insert: bool) -> Result<()> {
        let transfer = wire_mcp_auto_initialize(transfer)?;
        match due {
            Some(at) => self.delay_queue.push(transfer, front_insert, at),
            None if front_insert => self.backlog.push_front(transfer),
            None => self.backlog.push_back(transfer),
        }
        Ok(())
    }

    fn low_watermark(&self) -> usize {
        self.max_concurrency * self.low_watermark_factor as usize
    }

    /// Drives the backlog/delay-queue/in-flight machinery until every
    /// transfer (including follow-ups submitted along the way) has
    /// completed (spec §4.5 "Scheduling loop").
    pub async fn run(mut self) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

        loop {
            while let Ok(req) = self.submit_rx.try_recv() {
                if let Err(e) = self.enqueue(req.transfer, req.due, req.front_insert) {
                    tracing::warn!(error = %e, "dropping malformed reentrant submission");
                }
            }

            let now = Instant::now();
            let next_due_in_us = self.delay_queue.process(now, &mut self.backlog);

            if self.backlog.len() < self.low_watermark() {
                if let Some(hook) = self.refill_hook.as_mut() {
                    let submitter = self.submitter();
                    hook(&submitter);
                }
            }

            while in_flight.len() < self.max_concurrency {
                let Some(transfer) = self.backlog.pop_front() else {
                    break;
                };
                let transfer = materialize(transfer);
                let backend = self.backend.clone();
                let submitter = self.submitter();
                in_flight.push(Box::pin(run_transfer(transfer, backend, submitter)));
            }

            if in_flight.is_empty() {
                if self.backlog.is_empty() && self.delay_queue.is_empty() {
                    // Reentrant submissions drain at the top of the loop;
                    // nothing left anywhere means the run is genuinely done.
                    break;
                }
                if let Some(delay_us) = next_due_in_us {
                    tokio::time::sleep(Duration::from_micros(delay_us)).await;
                }
                continue;
            }

            in_flight.next().await;
        }
    }
}

/// Resolves a `before` predecessor chain (spec §4.5 "top-up rule"): if the
/// popped transfer has a predecessor, the predecessor runs in its place,
/// with the original transfer preserved by appending it to the tail of the
/// predecessor's own `next` chain so it still runs afterward.
fn materialize(mut transfer: AnyTransfer) -> AnyTransfer {
    match transfer.core_mut().pop_before() {
        Some(mut before) => {
            before.core_mut().append_next(transfer);
            materialize(before)
        }
        None => transfer,
    }
}

/// Attaches the automatic-initialization chain ahead of an MCP transfer
/// that was submitted without a session id and has one pending (spec §4.4
/// steps 1-3). A no-op for every other transfer flavor.
fn wire_mcp_auto_initialize(transfer: AnyTransfer) -> Result<AnyTransfer> {
    let chain = match &transfer {
        AnyTransfer::Mcp(m) if m.session_id.is_none() && m.has_auto_initialize() => {
            m.build_initialize_chain()?
        }
        _ => None,
    };
    Ok(match chain {
        Some(chain) => transfer.set_before(chain, true),
        None => transfer,
    })
}

fn build_spec(transfer: &mut AnyTransfer) -> Result<RequestSpec> {
    match transfer {
        AnyTransfer::Http(t) => t.to_request_spec(),
        AnyTransfer::Sse(t) => t.http.to_request_spec(),
        AnyTransfer::Mcp(t) => t.to_request_spec(),
    }
}

async fn run_transfer(mut transfer: AnyTransfer, backend: Backend, submitter: Submitter) {
    let spec = match build_spec(&mut transfer) {
        Ok(spec) => spec,
        Err(e) => {
            fire_error(&mut transfer, &e.to_string(), &CompletionInfo::default(), &submitter);
            finish(transfer, &submitter);
            return;
        }
    };

    match backend.execute(&spec).await {
        Outcome::Timeout { kind, elapsed_ms } => {
            if let Some(mut hook) = transfer.core_mut().on_timeout.take() {
                hook(kind, elapsed_ms, &submitter);
            }
            finish(transfer, &submitter);
        }
        Outcome::Error { message, info } => {
            fire_error(&mut transfer, &message, &info, &submitter);
            finish(transfer, &submitter);
        }
        Outcome::Ready { info, response } => {
            read_body(&mut transfer, response, &submitter).await;

            if let Some(retried) = try_mcp_session_recovery(&mut transfer, &info) {
                submitter.submit_front(retried);
                return;
            }

            if matches!(&transfer, AnyTransfer::Mcp(m) if m.is_initialize_transfer) && info.http_status >= 400 {
                // The initialize transfer itself failed at the HTTP level:
                // abort the chain the same way an RPC-level initialize
                // error does (spec §4.4 step 2a), rather than letting
                // `finish` hand the notification/main transfers off as if
                // initialization had succeeded.
                let wrapped = format!(
                    "MCP initialization error: HTTP request failed with status {}",
                    info.http_status
                );
                abort_init_chain_with_error(&mut transfer, wrapped, &submitter);
                finish(transfer, &submitter);
                return;
            }

            if matches!(transfer, AnyTransfer::Mcp(_)) && info.http_status >= 400 {
                // Buffered-mode MCP failure (spec §4.4, §7): the Engine
                // does not synthesize HTTP-status errors for plain HTTP
                // transfers, but an MCP transfer's buffered-JSON mode
                // (content type isn't SSE, or status >= 400 regardless of
                // content type) does, with the backend-native
                // "HTTP returned error" code.
                fire_mcp_http_failure(&mut transfer, &info, &submitter);
                finish(transfer, &submitter);
                return;
            }

            if dispatch_mcp_messages(&mut transfer, &info, &submitter) {
                // Initialize transfer carried an RPC error: already raised
                // to the main transfer's error hook and the rest of the
                // chain cut short (spec §4.4 step 2a).
                finish(transfer, &submitter);
                return;
            }
            propagate_mcp_session_id(&mut transfer);

            if let Some(mut hook) = transfer.core_mut().on_ready.take() {
                let buffer = transfer.core().stream_buffer.clone();
                hook(&info, &buffer, &submitter);
            }
            finish(transfer, &submitter);
        }
    }
}

fn fire_error(transfer: &mut AnyTransfer, message: &str, info: &CompletionInfo, submitter: &Submitter) {
    if let Some(mut hook) = transfer.core_mut().on_error.take() {
        hook(message, info.http_status as i32, info, submitter);
    }
}

/// The backend-native code the Engine reports for a synthesized MCP
/// buffered-mode HTTP failure, matching curl's `CURLE_HTTP_RETURNED_ERROR`
/// (spec §4.4, §7: "the error hook with the backend-native 'HTTP returned
/// error' code").
const HTTP_RETURNED_ERROR_CODE: i32 = 22;

fn fire_mcp_http_failure(transfer: &mut AnyTransfer, info: &CompletionInfo, submitter: &Submitter) {
    let message = format!("The requested URL returned error: {}", info.http_status);
    if let Some(mut hook) = transfer.core_mut().on_error.take() {
        hook(&message, HTTP_RETURNED_ERROR_CODE, info, submitter);
    }
}

fn finish(mut transfer: AnyTransfer, submitter: &Submitter) {
    if let Some(mut hook) = transfer.core_mut().on_complete.take() {
        hook(submitter);
    }
    if let Some(next) = transfer.core_mut().pop_next() {
        submitter.submit(next);
    }
}

/// Reads the response body, honoring streaming + early abort (spec §4.2
/// "on_stream may abort") for a streamable transfer, or buffering the full
/// body otherwise.
async fn read_body(transfer: &mut AnyTransfer, response: reqwest::Response, submitter: &Submitter) {
    if !transfer.core().is_streamable() {
        if let Ok(bytes) = response.bytes().await {
            transfer.core_mut().stream_buffer.append(&bytes);
        }
        return;
    }

    let mut stream = response.bytes_stream();
    loop {
        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            _ => break,
        };
        transfer.core_mut().stream_buffer.append(&chunk);

        let hook = transfer.core_mut().on_stream.take();
        let Some(mut hook) = hook else { continue };
        let keep_going = hook(&chunk, submitter);
        transfer.core_mut().on_stream = Some(hook);

        if !keep_going {
            transfer.core_mut().stream_aborted = true;
            break;
        }
    }
}

/// Captures a minted `Mcp-Session-Id` and detects an invalidated one (spec
/// §4.4). On detection, consumes `transfer`, wires a fresh initialize
/// chain, and returns it for the caller to resubmit at the front of the
/// backlog; otherwise returns `None` and leaves `transfer` untouched aside
/// from the captured session id.
fn try_mcp_session_recovery(transfer: &mut AnyTransfer, info: &CompletionInfo) -> Option<AnyTransfer> {
    let AnyTransfer::Mcp(m) = transfer else {
        return None;
    };
    if let Some(session_id) = info.header("mcp-session-id") {
        m.set_session_id(Some(session_id.to_string()));
    }
    let body_snapshot = m.sse.http.core.stream_buffer.peek().to_vec();
    if !m.is_invalid_session_response(info, &body_snapshot) {
        return None;
    }

    m.mark_retried_after_invalid_session();

    let placeholder = AnyTransfer::Http(HttpTransfer::new(String::new()));
    let owned = std::mem::replace(transfer, placeholder);
    let AnyTransfer::Mcp(mcp) = owned else {
        unreachable!("matched Mcp above")
    };
    match mcp.build_initialize_chain() {
        Ok(Some(chain)) => Some(AnyTransfer::Mcp(mcp).set_before(chain, true)),
        _ => Some(AnyTransfer::Mcp(mcp)),
    }
}

/// Decodes and dispatches the JSON-RPC messages carried by a completed MCP
/// response to its `on_mcp_message` hook (spec §4.4 "dual-mode response
/// handling"). Returns `true` if the initialize transfer's response carried
/// an RPC error, in which case the rest of the auto-init chain has already
/// been cut short and the caller must skip the generic `on_ready` dispatch.
fn dispatch_mcp_messages(transfer: &mut AnyTransfer, info: &CompletionInfo, submitter: &Submitter) -> bool {
    let AnyTransfer::Mcp(m) = transfer else {
        return false;
    };
    let is_init = m.is_initialize_transfer;
    let body = m.sse.http.core.stream_buffer.clone();
    if body.is_empty() {
        // A notification response (e.g. HTTP 202 to `notifications/initialized`)
        // carries no JSON-RPC payload to decode.
        return false;
    }
    let messages = match m.decode_response(info.content_type.as_deref(), body) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode MCP response body");
            return false;
        }
    };

    for message in &messages {
        if is_init && message.is_error() {
            if let RpcMessage::Error { error, .. } = message {
                let wrapped = format!("MCP initialization error: {} (Code: {})", error.message, error.code);
                abort_init_chain_with_error(transfer, wrapped, submitter);
            }
            return true;
        }

        let AnyTransfer::Mcp(m) = transfer else {
            unreachable!("matched Mcp above")
        };
        let Some(mut hook) = m.on_mcp_message.take() else {
            continue;
        };
        let keep_going = hook(message, submitter);
        m.on_mcp_message = Some(hook);
        if !keep_going {
            break;
        }
    }
    false
}

/// Detaches the rest of the follow-up chain (notification, then main),
/// fires the *main* transfer's error hook with the wrapped initialization
/// exception, and drops the notification/main transfers without running
/// them (spec §4.4 step 2a: initialize failure aborts the chain).
fn abort_init_chain_with_error(transfer: &mut AnyTransfer, wrapped: String, submitter: &Submitter) {
    let Some(mut rest) = transfer.core_mut().pop_next() else {
        return;
    };
    while let Some(next) = rest.core_mut().pop_next() {
        rest = next;
    }
    if let Some(mut hook) = rest.core_mut().on_error.take() {
        let info = CompletionInfo::default();
        hook(&wrapped, -1, &info, submitter);
    }
}

/// Propagates a newly-captured session id forward along the `next` chain
/// (initialize -> notification -> main) without disturbing it, and fires
/// each node's `on_initialized` callback exactly once, the first time its
/// session id becomes known (spec §4.4 "Auto-init session propagation",
/// testable property 8).
fn propagate_mcp_session_id(transfer: &mut AnyTransfer) {
    let session_id = match transfer {
        AnyTransfer::Mcp(m) => m.session_id.clone(),
        _ => None,
    };
    let Some(session_id) = session_id else {
        return;
    };
    let mut cursor = transfer.core_mut().next_mut();
    while let Some(next) = cursor {
        if let AnyTransfer::Mcp(m) = next {
            m.set_session_id(Some(session_id.clone()));
            if let Some(mut hook) = m.on_initialized.take() {
                hook(&session_id);
            }
        }
        cursor = next.core_mut().next_mut();
    }
}
