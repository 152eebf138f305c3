//! Server-Sent Events transfer: SSE framing state and dispatch (spec §4 "SSE
//! Transfer"), grounded on the line-buffering idiom of the reference SSE
//! parser (`other_examples` pierre_mcp_server `sse_parser.rs`).

use super::http::HttpTransfer;
use super::AnyTransfer;
use crate::buffer::StreamBuffer;

/// One decoded SSE event, dispatched to the message hook at a blank-line
/// boundary (spec §4.4 "SSE Framing").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
    pub data: String,
}

/// Accumulator for an in-progress SSE event, reset after each dispatch.
#[derive(Debug, Default, Clone)]
struct PendingEvent {
    event: Option<String>,
    id: Option<String>,
    retry_ms: Option<u64>,
    data_lines: Vec<String>,
}

impl PendingEvent {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.id.is_none() && self.retry_ms.is_none() && self.data_lines.is_empty()
    }

    fn finish(&mut self) -> SseEvent {
        // Per the SSE spec, a single trailing newline is stripped from the
        // concatenated data, not one per field line.
        let data = self.data_lines.join("\n");
        let event = SseEvent {
            event: self.event.take(),
            id: self.id.take(),
            retry_ms: self.retry_ms.take(),
            data,
        };
        self.data_lines.clear();
        event
    }
}

/// SSE parsing state layered on top of an [`HttpTransfer`]. `last_id`
/// persists across events for use as `Last-Event-ID` on session recovery;
/// `retry_ms` likewise persists as the server's most recently requested
/// reconnect interval, defaulting to 3000 (spec §3 "SSE parser state").
pub struct SseTransfer {
    pub http: HttpTransfer,
    pending: PendingEvent,
    pub last_id: Option<String>,
    pub retry_ms: u64,
}

const DEFAULT_RETRY_MS: u64 = 3000;

impl SseTransfer {
    pub fn new(url: impl Into<String>) -> Self {
        let mut http = HttpTransfer::new(url);
        http.set_header("accept", Some("text/event-stream"));
        http.core.force_streamable(true);
        Self {
            http,
            pending: PendingEvent::default(),
            last_id: None,
            retry_ms: DEFAULT_RETRY_MS,
        }
    }

    pub fn from_http(mut http: HttpTransfer) -> Self {
        http.set_header("accept", Some("text/event-stream"));
        http.core.force_streamable(true);
        Self {
            http,
            pending: PendingEvent::default(),
            last_id: None,
            retry_ms: DEFAULT_RETRY_MS,
        }
    }

    /// Feed newly-arrived bytes into the line buffer and drain as many
    /// complete events as are available. Per spec §4.4: a line beginning
    /// with `:` is a comment and ignored; a blank line dispatches the
    /// pending event (if non-empty) and resets the accumulator.
    pub fn feed(&mut self, buffer: &mut StreamBuffer) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(raw_line) = buffer.consume_line() {
            if raw_line.is_empty() {
                if !self.pending.is_empty() {
                    let event = self.pending.finish();
                    if let Some(id) = &event.id {
                        self.last_id = Some(id.clone());
                    }
                    events.push(event);
                }
                continue;
            }
            let line = String::from_utf8_lossy(&raw_line);
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line.as_ref(), ""),
            };
            match field {
                "event" => self.pending.event = Some(value.to_string()),
                "data" => self.pending.data_lines.push(value.to_string()),
                "id" if !value.contains('\0') => self.pending.id = Some(value.to_string()),
                "retry" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        self.pending.retry_ms = Some(ms);
                        self.retry_ms = ms;
                    }
                }
                _ => {}
            }
        }
        events
    }

    pub fn clone_for_request(&self) -> Self {
        Self {
            http: self.http.clone_for_request(),
            pending: PendingEvent::default(),
            last_id: self.last_id.clone(),
            retry_ms: self.retry_ms,
        }
    }
}

impl From<SseTransfer> for AnyTransfer {
    fn from(t: SseTransfer) -> Self {
        AnyTransfer::Sse(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event_on_blank_line() {
        let mut t = SseTransfer::new("http://example.com/events");
        let mut buf = StreamBuffer::new();
        buf.append(b"event: update\ndata: hello\nid: 1\n\n");
        let events = t.feed(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("update"));
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].id.as_deref(), Some("1"));
        assert_eq!(t.last_id.as_deref(), Some("1"));
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut t = SseTransfer::new("http://example.com/events");
        let mut buf = StreamBuffer::new();
        buf.append(b"data: line one\ndata: line two\n\n");
        let events = t.feed(&mut buf);
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut t = SseTransfer::new("http://example.com/events");
        let mut buf = StreamBuffer::new();
        buf.append(b": keep-alive\ndata: x\n\n");
        let events = t.feed(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn partial_event_across_chunks_waits_for_blank_line() {
        let mut t = SseTransfer::new("http://example.com/events");
        let mut buf = StreamBuffer::new();
        buf.append(b"data: partial");
        assert!(t.feed(&mut buf).is_empty());
        buf.append(b"\n\n");
        let events = t.feed(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn retry_field_updates_reconnect_interval() {
        let mut t = SseTransfer::new("http://example.com/events");
        let mut buf = StreamBuffer::new();
        buf.append(b"retry: 5000\ndata: x\n\n");
        let events = t.feed(&mut buf);
        assert_eq!(events[0].retry_ms, Some(5000));
    }

    #[test]
    fn retry_ms_persists_across_events_and_defaults_to_3000() {
        let mut t = SseTransfer::new("http://example.com/events");
        assert_eq!(t.retry_ms, 3000);
        let mut buf = StreamBuffer::new();
        buf.append(b"retry: 7000\ndata: x\n\ndata: y\n\n");
        let events = t.feed(&mut buf);
        assert_eq!(t.retry_ms, 7000);
        assert_eq!(events[1].retry_ms, None, "second event sent no retry field of its own");
    }
}
