//! HTTP transfer: method, body serialization, header table, auth helpers,
//! redirect policy, and the request-option composition rules of spec §4.3.

use super::{AnyTransfer, TransferCore};
use crate::backend::RequestSpec;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            other => Err(Error::Config(format!("unsupported HTTP method: {other}"))),
        }
    }
}

/// Request body, either raw bytes or a JSON value to encode per
/// `content_type` at construction time (spec §3 "HTTP Transfer").
#[derive(Debug, Clone)]
pub enum Body {
    Raw(Vec<u8>),
    Mapping(Value),
}

/// Case-insensitive header table. Keys are stored lower-cased; a value of
/// `None` removes the header entirely (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: BTreeMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let key = name.to_ascii_lowercase();
        match value {
            Some(v) => {
                self.entries.insert(key, v.to_string());
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// Serialize to `"<lower-name>: <value>"` lines, as pushed into the
    /// backend's header-list option on every mutation (spec §3).
    pub fn to_lines(&self) -> Vec<String> {
        self.entries.iter().map(|(k, v)| format!("{k}: {v}")).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// HTTP-flavored transfer (spec §3/§4.3). Embeds [`TransferCore`] by
/// composition rather than inheritance, per the Design Notes.
pub struct HttpTransfer {
    pub core: TransferCore,
    pub method: Method,
    pub body: Option<Body>,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub follow_redirects: bool,
    pub max_redirects: Option<u32>,
    pub basic_auth: Option<(String, String)>,
}

impl HttpTransfer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            core: TransferCore::new(url),
            method: Method::Get,
            body: None,
            headers: HeaderMap::new(),
            content_type: None,
            follow_redirects: true,
            max_redirects: None,
            basic_auth: None,
        }
    }

    pub fn set_method(&mut self, method: &str) -> Result<()> {
        self.method = Method::parse(method)?;
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: Option<&str>) {
        self.headers.set(name, value);
    }

    /// Sets a non-empty `Content-Type` header automatically when one is
    /// supplied (spec §4.3).
    pub fn set_content_type(&mut self, content_type: Option<&str>) {
        self.content_type = content_type.map(|s| s.to_string());
        if let Some(ct) = &self.content_type {
            if !ct.is_empty() {
                self.headers.set("content-type", Some(ct));
            }
        }
    }

    pub fn set_basic_auth(&mut self, user: &str, password: &str) {
        self.basic_auth = Some((user.to_string(), password.to_string()));
    }

    /// Sets `Authorization: Bearer <token>` directly via the header table
    /// (spec §6 "MCP wire contract": `Authorization: Bearer …`), rather than
    /// through the backend's basic-auth option.
    pub fn set_bearer_auth(&mut self, token: &str) {
        self.headers.set("authorization", Some(&format!("Bearer {token}")));
    }

    /// Sets the RFC 8707 `Resource-Indicator` header identifying the target
    /// resource server to an authorization server (spec §6).
    pub fn set_resource_indicator(&mut self, resource: &str) {
        self.headers.set("resource-indicator", Some(resource));
    }

    /// Sets the body, encoding a mapping per `content_type` (spec §3):
    /// - `application/json` / `text/json` (case-insensitive): JSON.
    /// - `application/x-www-form-urlencoded`: form encoding with bracketed
    ///   nesting for mapping values.
    /// - unset content type + mapping: defaults to JSON.
    /// - any other content type + mapping: configuration error.
    pub fn set_body(&mut self, body: Option<Body>) -> Result<()> {
        if let Some(Body::Mapping(ref value)) = body {
            self.validate_mapping_body(value)?;
        }
        self.body = body;
        Ok(())
    }

    fn validate_mapping_body(&self, _value: &Value) -> Result<()> {
        match self.content_type.as_deref() {
            None => Ok(()),
            Some(ct)
                if ct.eq_ignore_ascii_case("application/json")
                    || ct.eq_ignore_ascii_case("text/json")
                    || ct.eq_ignore_ascii_case("application/x-www-form-urlencoded") =>
            {
                Ok(())
            }
            Some(other) => Err(Error::Config(format!(
                "unsupported content type for mapping body: {other}"
            ))),
        }
    }

    fn encode_body(&self) -> Result<Option<Vec<u8>>> {
        match &self.body {
            None => Ok(None),
            Some(Body::Raw(bytes)) => Ok(Some(bytes.clone())),
            Some(Body::Mapping(value)) => {
                let is_form = self
                    .content_type
                    .as_deref()
                    .map(|ct| ct.eq_ignore_ascii_case("application/x-www-form-urlencoded"))
                    .unwrap_or(false);
                if is_form {
                    Ok(Some(encode_form_urlencoded(value).into_bytes()))
                } else {
                    serde_json::to_vec(value)
                        .map(Some)
                        .map_err(|e| Error::Config(format!("failed to JSON-encode body: {e}")))
                }
            }
        }
    }

    /// Option composition at schedule time (spec §4.3): POST moves the body
    /// into the post-fields option; GET with a non-empty body sends a
    /// custom-method GET carrying the body.
    pub fn to_request_spec(&self) -> Result<RequestSpec> {
        let body = self.encode_body()?;
        let custom_method = match (self.method, &body) {
            (Method::Get, Some(_)) => Some("GET".to_string()),
            _ => None,
        };
        Ok(RequestSpec {
            url: self.core.url.clone(),
            is_post: matches!(self.method, Method::Post),
            custom_method,
            headers: self.headers.to_lines(),
            body,
            connection_timeout_ms: self.core.effective_connection_timeout_ms(),
            total_timeout_ms: self.core.effective_total_timeout_ms(),
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            basic_auth: self.basic_auth.clone(),
        })
    }

    /// Clone semantics (spec §4.3): drops body, method override, and any
    /// custom-request option, and (spec §4.2) resets stream buffer,
    /// `stream_aborted`, handle state, and both follow-up links. URL and
    /// headers survive.
    pub fn clone_for_request(&self) -> Self {
        Self {
            core: TransferCore::new(self.core.url.clone()),
            method: Method::Get,
            body: None,
            headers: self.headers.clone(),
            content_type: None,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            basic_auth: self.basic_auth.clone(),
        }
    }
}

/// Encodes a JSON mapping as `application/x-www-form-urlencoded`, nesting
/// object/array values with bracket notation (`parent[child]=value`),
/// matching common form-encoding conventions (spec §3). `serde_urlencoded`
/// only flattens one level on its own, so nested object/array values are
/// resolved by hand into a flat pair list first, then handed to
/// `serde_urlencoded` for the actual percent-encoding.
fn encode_form_urlencoded(value: &Value) -> String {
    let mut pairs = Vec::new();
    flatten_form(None, value, &mut pairs);
    serde_urlencoded::to_string(&pairs).unwrap_or_default()
}

fn flatten_form(prefix: Option<&str>, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = match prefix {
                    Some(p) => format!("{p}[{k}]"),
                    None => k.clone(),
                };
                flatten_form(Some(&key), v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let key = match prefix {
                    Some(p) => format!("{p}[{i}]"),
                    None => i.to_string(),
                };
                flatten_form(Some(&key), v, out);
            }
        }
        Value::Null => {}
        other => {
            let key = prefix.unwrap_or("").to_string();
            let val = match other {
                Value::String(s) => s.clone(),
                _ => other.to_string(),
            };
            out.push((key, val));
        }
    }
}

/// A shared-default factory replacing the prototype-cloning pattern (Design
/// Notes §9): holds defaults for `build(url)` rather than a mutable global.
#[derive(Clone, Default)]
pub struct HttpTransferBuilder {
    headers: HeaderMap,
    follow_redirects: bool,
    max_redirects: Option<u32>,
    basic_auth: Option<(String, String)>,
}

impl HttpTransferBuilder {
    pub fn new() -> Self {
        Self {
            headers: HeaderMap::new(),
            follow_redirects: true,
            max_redirects: None,
            basic_auth: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, Some(value));
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, n: u32) -> Self {
        self.max_redirects = Some(n);
        self
    }

    pub fn basic_auth(mut self, user: &str, password: &str) -> Self {
        self.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn build(
        &self,
        url: impl Into<String>,
        method: Option<&str>,
        body: Option<Body>,
        content_type: Option<&str>,
    ) -> Result<HttpTransfer> {
        let mut t = HttpTransfer::new(url);
        t.headers = self.headers.clone();
        t.follow_redirects = self.follow_redirects;
        t.max_redirects = self.max_redirects;
        t.basic_auth = self.basic_auth.clone();
        if let Some(m) = method {
            t.set_method(m)?;
        }
        t.set_content_type(content_type);
        t.set_body(body)?;
        Ok(t)
    }
}

impl From<HttpTransfer> for AnyTransfer {
    fn from(t: HttpTransfer) -> Self {
        AnyTransfer::Http(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.set("Content-Type", Some("application/json"));
        assert_eq!(h.get("content-type"), Some("application/json"));
        h.set("CONTENT-TYPE", None);
        assert!(h.get("content-type").is_none());
    }

    #[test]
    fn json_body_defaults_when_content_type_unset() {
        let mut t = HttpTransfer::new("http://example.com");
        t.set_body(Some(Body::Mapping(serde_json::json!({"a": 1})))).unwrap();
        let spec = t.to_request_spec().unwrap();
        assert_eq!(spec.body.unwrap(), br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn form_encoding_nests_brackets() {
        let mut t = HttpTransfer::new("http://example.com");
        t.set_content_type(Some("application/x-www-form-urlencoded"));
        t.set_body(Some(Body::Mapping(serde_json::json!({"a": {"b": "c d"}}))))
            .unwrap();
        let spec = t.to_request_spec().unwrap();
        let body = String::from_utf8(spec.body.unwrap()).unwrap();
        assert_eq!(body, "a%5Bb%5D=c+d");
    }

    #[test]
    fn unsupported_content_type_with_mapping_fails() {
        let mut t = HttpTransfer::new("http://example.com");
        t.set_content_type(Some("application/xml"));
        let err = t.set_body(Some(Body::Mapping(serde_json::json!({"a": 1})))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn get_with_body_sets_custom_method() {
        let mut t = HttpTransfer::new("http://example.com");
        t.set_body(Some(Body::Raw(b"hi".to_vec()))).unwrap();
        let spec = t.to_request_spec().unwrap();
        assert_eq!(spec.custom_method.as_deref(), Some("GET"));
        assert_eq!(spec.body.as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn clone_drops_body_and_method_state() {
        let mut t = HttpTransfer::new("http://example.com");
        t.set_method("POST").unwrap();
        t.set_body(Some(Body::Raw(b"x".to_vec()))).unwrap();
        t.set_header("Authorization", Some("Bearer z"));
        let cloned = t.clone_for_request();
        assert!(cloned.body.is_none());
        assert_eq!(cloned.method, Method::Get);
        assert_eq!(cloned.headers.get("authorization"), Some("Bearer z"));
        assert_eq!(cloned.core.url, t.core.url);
    }

    #[test]
    fn invalid_method_is_configuration_error() {
        let mut t = HttpTransfer::new("http://example.com");
        let err = t.set_method("DELETE").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bearer_auth_and_resource_indicator_set_headers() {
        let mut t = HttpTransfer::new("http://example.com");
        t.set_bearer_auth("secret-token");
        t.set_resource_indicator("https://mcp.example.com/server");
        assert_eq!(t.headers.get("authorization"), Some("Bearer secret-token"));
        assert_eq!(
            t.headers.get("resource-indicator"),
            Some("https://mcp.example.com/server")
        );
    }
}
