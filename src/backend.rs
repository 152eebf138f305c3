//! HTTP backend: translates a [`RequestSpec`] into a `reqwest` request and
//! classifies failures into the taxonomy the Engine dispatches to observer
//! hooks (spec §4.5, §5, §7).
//!
//! `reqwest` has no equivalent of curl's `connect_time`/`pretransfer_time`
//! introspection, so a plain outer timeout can't tell a connection-phase
//! timeout (spec E2) from a total-transfer timeout (spec E3). Instead this
//! module races a bare TCP connect against `connection_timeout_ms` before
//! issuing the real request, then wraps the whole request in an outer
//! `tokio::time::timeout` bounded by `total_timeout_ms`. Whichever fires
//! first determines [`TimeoutKind`].

use crate::error::{Error, Result, TimeoutKind};
use crate::transfer::CompletionInfo;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use url::Url;

/// Fully-resolved, typed request description, composed from a `Transfer`'s
/// accumulated options at schedule time (spec §4.3 "Option composition").
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: String,
    pub is_post: bool,
    pub custom_method: Option<String>,
    pub headers: Vec<String>,
    pub body: Option<Vec<u8>>,
    pub connection_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub follow_redirects: bool,
    pub max_redirects: Option<u32>,
    pub basic_auth: Option<(String, String)>,
}

/// The result of running a [`RequestSpec`] to completion, prior to any
/// streaming or MCP-specific decoding (spec §4.5 "Outcome").
pub enum Outcome {
    Ready {
        info: CompletionInfo,
        response: reqwest::Response,
    },
    Timeout {
        kind: TimeoutKind,
        elapsed_ms: u64,
    },
    Error {
        message: String,
        info: CompletionInfo,
    },
}

/// Outcome of the pre-connect TCP probe (spec §7 distinguishing a
/// connection-phase timeout from a transport error).
enum ProbeOutcome {
    /// The connect budget elapsed before a socket was established.
    TimedOut(u64),
    /// The budget did not elapse — either the socket connected, or it
    /// failed outright (bad URL, DNS failure, connection refused); either
    /// way `send()` performs the real attempt and reports it.
    NotTimedOut,
}

/// Extracts `(host, port)` from a request URL for the connect probe.
/// Returns `None` for a malformed URL or one with no resolvable host.
fn parse_host_port(raw_url: &str) -> Option<(String, u16)> {
    let url = Url::parse(raw_url).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default()?;
    Some((host, port))
}

/// Thin wrapper over a shared `reqwest::Client`. One `Backend` per `Engine`;
/// cheap to clone (`reqwest::Client` is internally `Arc`-backed), matching
/// the teacher's pooled-connection-manager shape but without the explicit
/// pool bookkeeping `bb8` required for a non-HTTP protocol.
#[derive(Clone)]
pub struct Backend {
    client: Client,
}

impl Backend {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(Error::Http)?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Executes `spec`, classifying timeouts via the pre-connect-probe
    /// scheme described at module level.
    pub async fn execute(&self, spec: &RequestSpec) -> Outcome {
        let started = Instant::now();

        if let ProbeOutcome::TimedOut(elapsed_ms) = self.probe_connection(spec).await {
            return Outcome::Timeout {
                kind: TimeoutKind::Connection,
                elapsed_ms,
            };
        }
        // A connect error (DNS failure, connection refused, ...) is not a
        // timeout: fall through to `send()` so `reqwest` performs the real
        // connect attempt and surfaces its native transport error/code
        // (spec §7 "Transport error", E4).
        let connect_time_ms = started.elapsed().as_millis() as u64;

        let total_budget = Duration::from_millis(spec.total_timeout_ms);
        match tokio::time::timeout(total_budget, self.send(spec)).await {
            Ok(Ok(response)) => {
                let info = CompletionInfo {
                    http_status: response.status().as_u16(),
                    connect_time_ms,
                    pretransfer_time_ms: connect_time_ms,
                    total_time_ms: started.elapsed().as_millis() as u64,
                    response_headers: response
                        .headers()
                        .iter()
                        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                        .collect(),
                    content_type: response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string()),
                };
                Outcome::Ready { info, response }
            }
            Ok(Err(e)) => Outcome::Error {
                message: e.to_string(),
                info: CompletionInfo {
                    connect_time_ms,
                    pretransfer_time_ms: connect_time_ms,
                    total_time_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                },
            },
            Err(_) => Outcome::Timeout {
                kind: TimeoutKind::Total,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    /// Races a bare TCP connect against `connection_timeout_ms`, distinguishing
    /// the timer expiring from the connect attempt itself failing (spec §7:
    /// DNS/refused/TLS are transport errors, not connection timeouts — only
    /// the budget actually elapsing is). A malformed URL, or any connect
    /// failure short of the timer firing, is reported as
    /// [`ProbeOutcome::NotTimedOut`] so the caller proceeds to `send()` and
    /// lets `reqwest` perform (and report) the real connect attempt; the
    /// probe socket itself is always dropped afterward, never reused.
    async fn probe_connection(&self, spec: &RequestSpec) -> ProbeOutcome {
        let started = Instant::now();
        let Some((host, port)) = parse_host_port(&spec.url) else {
            return ProbeOutcome::NotTimedOut;
        };
        let budget = Duration::from_millis(spec.connection_timeout_ms);
        match tokio::time::timeout(budget, TcpStream::connect((host.as_str(), port))).await {
            Err(_) => ProbeOutcome::TimedOut(started.elapsed().as_millis() as u64),
            Ok(_) => ProbeOutcome::NotTimedOut,
        }
    }

    async fn send(&self, spec: &RequestSpec) -> reqwest::Result<reqwest::Response> {
        let method = match (&spec.custom_method, spec.is_post) {
            (Some(m), _) => reqwest::Method::from_bytes(m.as_bytes()).unwrap_or(reqwest::Method::GET),
            (None, true) => reqwest::Method::POST,
            (None, false) => reqwest::Method::GET,
        };
        let mut builder = self.client.request(method, &spec.url);
        for line in &spec.headers {
            if let Some((name, value)) = line.split_once(':') {
                builder = builder.header(name.trim(), value.trim());
            }
        }
        if let Some(body) = &spec.body {
            builder = builder.body(body.clone());
        }
        if let Some((user, pass)) = &spec.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        let mut response = builder.send().await?;
        if spec.follow_redirects {
            response = self.follow_redirects(response, spec).await?;
        }
        Ok(response)
    }

    /// Manual redirect following bounded by `max_redirects` (spec §4.3):
    /// the client is built with `redirect::Policy::none()` so every hop is
    /// visible here for the cap to apply.
    async fn follow_redirects(
        &self,
        mut response: reqwest::Response,
        spec: &RequestSpec,
    ) -> reqwest::Result<reqwest::Response> {
        let limit = spec.max_redirects.unwrap_or(10);
        let mut hops = 0u32;
        while response.status().is_redirection() && hops < limit {
            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
            else {
                break;
            };
            let next_url = match Url::parse(&location) {
                Ok(u) => u,
                Err(_) => match Url::parse(&spec.url).and_then(|base| base.join(&location)) {
                    Ok(u) => u,
                    Err(_) => break,
                },
            };
            response = self.client.get(next_url).send().await?;
            hops += 1;
        }
        Ok(response)
    }
}
