//! Request and response structures handed over by the front end
//!
//! The web server parses the wire format; the engine only sees these
//! already-parsed values and fills in the response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::status;
use crate::session::SharedSession;

/// Inbound request as delivered by the front end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_method")]
    pub method: String,

    /// Value of the `Host` header, port included if the client sent one
    pub host: String,

    /// Raw request URI (path plus optional query)
    pub uri: String,

    /// Header map, keys are lower-cased on access
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: String,

    /// `/<application>` once the request is bound to an application
    #[serde(skip)]
    pub context_path: String,

    /// Path used for servlet matching
    #[serde(skip)]
    pub servlet_path: String,

    /// Set by a valve that fully answered the request
    #[serde(skip)]
    pub dispatched: bool,

    /// Authenticated user name, if any
    #[serde(skip)]
    pub remote_user: Option<String>,

    /// Session bound while the request is processed
    #[serde(skip)]
    pub session: Option<SharedSession>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Request {
    pub fn new(host: &str, uri: &str) -> Self {
        Self {
            method: default_method(),
            host: host.to_string(),
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    /// Parse a request from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Host name with any `:port` suffix removed
    pub fn host_name(&self) -> &str {
        strip_port(&self.host)
    }

    /// URI path without the query string
    pub fn path(&self) -> &str {
        self.uri.split(['?', '#']).next().unwrap_or("")
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    /// Value of a cookie sent in the `Cookie` header
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.trim())
    }
}

/// Strip a trailing `:port` from a host value
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal, keep the brackets
        return host.split_once("]:").map(|(h, _)| &host[..h.len() + 1]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

/// Where the response is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseState {
    #[default]
    Pending,
    Dispatched,
}

/// Outbound response filled in by valves and servlets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,

    pub headers: Vec<(String, String)>,

    pub body: String,

    pub state: ResponseState,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: status::OK,
            headers: Vec::new(),
            body: String::new(),
            state: ResponseState::Pending,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// Append a header, repeated names are kept (e.g. `Set-Cookie`)
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Replace every header with this name
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.add_header(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn write(&mut self, text: &str) {
        self.body.push_str(text);
    }

    pub fn mark_dispatched(&mut self) {
        self.state = ResponseState::Dispatched;
    }

    pub fn is_dispatched(&self) -> bool {
        self.state == ResponseState::Dispatched
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":500,"headers":[],"body":"serialization error","state":"DISPATCHED"}"#
                .to_string()
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
