//! Integration tests for the MCP Streamable HTTP binding: automatic
//! session initialization and invalid-session recovery (spec §4.4).

use flightdeck::backend::Backend;
use flightdeck::engine::Engine;
use flightdeck::rpc::RpcMessage;
use flightdeck::transfer::mcp::McpTransfer;
use flightdeck::AnyTransfer;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Stands in for a real MCP server: branches on the JSON-RPC `method` field
/// rather than matching request bodies verbatim, since `initialize`'s id is
/// auto-assigned and therefore not known up front.
struct McpServer {
    session_id: &'static str,
    main_calls_before_session_is_honored: AtomicUsize,
    reject_main_calls: usize,
}

impl Respond for McpServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let method = body.get("method").and_then(Value::as_str).unwrap_or("");

        match method {
            "initialize" => ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .insert_header("mcp-session-id", self.session_id)
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"protocolVersion": "2025-06-18", "capabilities": {}, "serverInfo": {"name": "test", "version": "0"}}
                })),
            "notifications/initialized" => ResponseTemplate::new(202),
            _ => {
                let session_header = request
                    .headers
                    .get("mcp-session-id")
                    .and_then(|v| v.to_str().ok());
                let attempt = self.main_calls_before_session_is_honored.fetch_add(1, Ordering::SeqCst);
                if attempt < self.reject_main_calls || session_header != Some(self.session_id) {
                    return ResponseTemplate::new(404)
                        .insert_header("content-type", "application/json")
                        .set_body_string("Session not found");
                }
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(json!({
                        "jsonrpc": "2.0",
                        "id": body["id"],
                        "result": {"tools": []}
                    }))
            }
        }
    }
}

#[tokio::test]
async fn auto_initialize_runs_before_the_main_request() {
    let mock_server = MockServer::start().await;
    Mock::given(wiremock::matchers::path("/mcp"))
        .respond_with(McpServer {
            session_id: "sess-abc",
            main_calls_before_session_is_honored: AtomicUsize::new(0),
            reject_main_calls: 0,
        })
        .mount(&mock_server)
        .await;

    let result: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let result_clone = result.clone();

    let message = RpcMessage::request("tools/list", json!({}), Some(json!("1")));
    let mut transfer = McpTransfer::new(format!("{}/mcp", mock_server.uri()), message).unwrap();
    transfer.enable_auto_initialize(None, None);
    transfer.sse.http.core.set_on_ready(Box::new(move |_info, buffer, _submitter| {
        let value: Value = serde_json::from_slice(buffer.peek()).unwrap();
        *result_clone.lock().unwrap() = Some(value);
    }));

    let mut engine = Engine::new(Backend::new().unwrap(), 4);
    engine.submit(AnyTransfer::Mcp(transfer)).unwrap();
    engine.run().await;

    let result = result.lock().unwrap();
    let result = result.as_ref().expect("main request should have completed");
    assert_eq!(result["result"]["tools"], json!([]));
}

#[tokio::test]
async fn on_mcp_message_hook_receives_decoded_result_and_on_initialized_fires() {
    let mock_server = MockServer::start().await;
    Mock::given(wiremock::matchers::path("/mcp"))
        .respond_with(McpServer {
            session_id: "sess-hook",
            main_calls_before_session_is_honored: AtomicUsize::new(0),
            reject_main_calls: 0,
        })
        .mount(&mock_server)
        .await;

    let initialized_session: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let initialized_clone = initialized_session.clone();
    let tools_seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let tools_seen_clone = tools_seen.clone();

    let message = RpcMessage::request("tools/list", json!({}), Some(json!("1")));
    let mut transfer = McpTransfer::new(format!("{}/mcp", mock_server.uri()), message).unwrap();
    transfer.enable_auto_initialize(None, None);
    transfer.set_on_initialized(Box::new(move |session_id| {
        *initialized_clone.lock().unwrap() = Some(session_id.to_string());
    }));
    transfer.set_on_mcp_message(Box::new(move |msg, _submitter| {
        if let RpcMessage::Response { result, .. } = msg {
            tools_seen_clone.lock().unwrap().push(result.clone());
        }
        true
    }));

    let mut engine = Engine::new(Backend::new().unwrap(), 4);
    engine.submit(AnyTransfer::Mcp(transfer)).unwrap();
    engine.run().await;

    assert_eq!(initialized_session.lock().unwrap().as_deref(), Some("sess-hook"));
    assert_eq!(tools_seen.lock().unwrap().as_slice(), [json!({"tools": []})]);
}

#[tokio::test]
async fn invalid_session_is_retried_exactly_once() {
    let mock_server = MockServer::start().await;
    Mock::given(wiremock::matchers::path("/mcp"))
        .respond_with(McpServer {
            session_id: "sess-xyz",
            main_calls_before_session_is_honored: AtomicUsize::new(0),
            reject_main_calls: 1,
        })
        .mount(&mock_server)
        .await;

    let ready_count = Arc::new(Mutex::new(0usize));
    let ready_count_clone = ready_count.clone();

    let message = RpcMessage::request("tools/list", json!({}), Some(json!("1")));
    let mut transfer = McpTransfer::new(format!("{}/mcp", mock_server.uri()), message).unwrap();
    transfer.set_session_id(Some("stale-session".to_string()));
    transfer.enable_auto_initialize(None, None);
    transfer.sse.http.core.set_on_ready(Box::new(move |_info, _buffer, _submitter| {
        *ready_count_clone.lock().unwrap() += 1;
    }));

    let mut engine = Engine::new(Backend::new().unwrap(), 4);
    engine.submit(AnyTransfer::Mcp(transfer)).unwrap();
    engine.run().await;

    // The stale-session main request is rejected once, a fresh initialize
    // chain runs, and the retried main request succeeds exactly once.
    assert_eq!(*ready_count.lock().unwrap(), 1);
}

#[tokio::test]
async fn buffered_mode_http_failure_invokes_error_hook_not_ready() {
    let mock_server = MockServer::start().await;
    Mock::given(wiremock::matchers::path("/mcp"))
        .respond_with(
            ResponseTemplate::new(500)
                .insert_header("content-type", "application/json")
                .set_body_json(json!({"error": "internal"})),
        )
        .mount(&mock_server)
        .await;

    let error_seen: Arc<Mutex<Option<(String, i32)>>> = Arc::new(Mutex::new(None));
    let error_seen_clone = error_seen.clone();
    let ready_fired = Arc::new(Mutex::new(false));
    let ready_fired_clone = ready_fired.clone();

    let message = RpcMessage::request("tools/list", json!({}), Some(json!("1")));
    let mut transfer = McpTransfer::new(format!("{}/mcp", mock_server.uri()), message).unwrap();
    transfer
        .sse
        .http
        .core
        .set_on_error(Box::new(move |msg, code, _info, _submitter| {
            *error_seen_clone.lock().unwrap() = Some((msg.to_string(), code));
        }));
    transfer.sse.http.core.set_on_ready(Box::new(move |_info, _buffer, _submitter| {
        *ready_fired_clone.lock().unwrap() = true;
    }));

    let mut engine = Engine::new(Backend::new().unwrap(), 4);
    engine.submit(AnyTransfer::Mcp(transfer)).unwrap();
    engine.run().await;

    assert!(!*ready_fired.lock().unwrap(), "on_ready must not fire for a buffered-mode MCP HTTP failure");
    let (message, code) = error_seen.lock().unwrap().clone().expect("on_error should have fired");
    assert!(message.contains("500"));
    assert_eq!(code, 22);
}
