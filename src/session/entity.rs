//! The session entity
//!
//! A session starts life empty inside the pool, receives its identity and
//! cookie attributes when it is initialized, and is torn down by `destroy`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::SessionSettings;
use crate::error::{EngineError, EngineResult};
use crate::token::generate_session_id;

/// Session shared between the store, the sweeps and the request being served
pub type SharedSession = Arc<Mutex<Session>>;

/// Current time in unix seconds
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Per-client state
#[derive(Debug, Clone, Default)]
pub struct Session {
    id: Option<String>,

    name: String,

    /// Absolute cookie expiry, unix seconds
    lifetime: i64,

    maximum_age: Option<i64>,

    domain: Option<String>,

    path: String,

    secure: bool,

    http_only: bool,

    /// Values kept in their serialized form, keyed by name
    data: BTreeMap<String, String>,

    last_activity: i64,

    tags: BTreeSet<String>,

    started: bool,
}

/// Initialization parameters, unset values fall back to the settings
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    pub lifetime: Option<i64>,
    pub max_age: Option<i64>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
}

impl SessionOptions {
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// On-disk layout, every data value is itself a JSON string
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    id: Option<String>,
    name: String,
    lifetime: i64,
    maximum_age: Option<i64>,
    domain: Option<String>,
    path: String,
    secure: bool,
    http_only: bool,
    data: BTreeMap<String, String>,
}

impl Session {
    /// Empty, uninitialized session as kept by the pool
    pub fn empty() -> Self {
        Self::default()
    }

    /// Give a pooled session its identity and cookie attributes
    pub fn initialize(&mut self, options: SessionOptions, settings: &SessionSettings) {
        let now = now();
        self.id = options.id;
        self.name = options.name.unwrap_or_else(|| settings.name.clone());
        self.lifetime = options.lifetime.unwrap_or(now + settings.lifetime);
        self.maximum_age = options.max_age.or(settings.max_age);
        self.domain = options.domain.or_else(|| settings.domain.clone());
        self.path = options.path.unwrap_or_else(|| settings.path.clone());
        self.secure = options.secure.unwrap_or(settings.secure);
        self.http_only = options.http_only.unwrap_or(settings.http_only);
        self.last_activity = now;
    }

    /// Mark the session started, generating an ID if none was assigned
    pub fn start(&mut self) -> &str {
        self.started = true;
        if self.last_activity == 0 {
            self.last_activity = now();
        }
        self.id.get_or_insert_with(generate_session_id)
    }

    pub fn is_started(&self) -> bool {
        self.started && self.id.is_some()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Replace the ID; the caller re-attaches the session under it
    pub fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifetime(&self) -> i64 {
        self.lifetime
    }

    pub fn maximum_age(&self) -> Option<i64> {
        self.maximum_age
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity
    }

    pub fn set_last_activity(&mut self, timestamp: i64) {
        self.last_activity = timestamp;
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.lifetime, 0).single()
    }

    /// Seconds since the last activity
    pub fn inactivity(&self, now: i64) -> i64 {
        (now - self.last_activity).max(0)
    }

    /// A session can be resumed while started, within its cookie lifetime
    /// and not idle for longer than `inactivity_timeout` (0 disables the check)
    pub fn can_be_resumed(&self, inactivity_timeout: i64, now: i64) -> bool {
        if !self.is_started() {
            return false;
        }
        if self.lifetime > 0 && now > self.lifetime {
            return false;
        }
        inactivity_timeout == 0 || self.inactivity(now) <= inactivity_timeout
    }

    /// Record activity, returning the seconds since the previous one
    pub fn resume(&mut self, now: i64) -> i64 {
        let idle = self.inactivity(now);
        self.last_activity = now;
        idle
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        self.ensure_started()?;
        self.data
            .get(key)
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| EngineError::SessionDataNotReadable(format!("{key}: {e}")))
            })
            .transpose()
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> EngineResult<()> {
        self.ensure_started()?;
        if key.is_empty() {
            return Err(EngineError::InvalidArgument("empty session key".to_string()));
        }
        let raw = serde_json::to_string(value)
            .map_err(|e| EngineError::DataNotSerializable(format!("{key}: {e}")))?;
        self.data.insert(key.to_string(), raw);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> EngineResult<bool> {
        self.ensure_started()?;
        Ok(self.data.remove(key).is_some())
    }

    pub fn contains(&self, key: &str) -> EngineResult<bool> {
        self.ensure_started()?;
        Ok(self.data.contains_key(key))
    }

    pub fn keys(&self) -> EngineResult<Vec<String>> {
        self.ensure_started()?;
        Ok(self.data.keys().cloned().collect())
    }

    pub fn add_tag(&mut self, tag: &str) {
        self.tags.insert(tag.to_string());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }

    /// Clear all data and drop the identity
    pub fn destroy(&mut self) {
        self.data.clear();
        self.tags.clear();
        self.id = None;
        self.started = false;
    }

    /// Whether `destroy` already ran on a started session
    pub fn is_destroyed(&self) -> bool {
        self.id.is_none() && self.data.is_empty()
    }

    /// Hex SHA-256 over the serialized data map, recomputed on every call
    pub fn checksum(&self) -> String {
        let serialized = serde_json::to_vec(&self.data).unwrap_or_default();
        hex::encode(Sha256::digest(&serialized))
    }

    /// Serialize the full session state for storage
    pub fn marshall(&self) -> EngineResult<String> {
        let envelope = Envelope {
            id: self.id.clone(),
            name: self.name.clone(),
            lifetime: self.lifetime,
            maximum_age: self.maximum_age,
            domain: self.domain.clone(),
            path: self.path.clone(),
            secure: self.secure,
            http_only: self.http_only,
            data: self.data.clone(),
        };
        serde_json::to_string(&envelope).map_err(|e| EngineError::DataNotSerializable(e.to_string()))
    }

    /// Restore state written by `marshall` into this (empty) session
    pub fn unmarshall(&mut self, raw: &str) -> EngineResult<()> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| EngineError::SessionDataNotReadable(e.to_string()))?;

        if let Some((key, _)) = envelope
            .data
            .iter()
            .find(|(_, v)| serde_json::from_str::<serde_json::Value>(v).is_err())
        {
            return Err(EngineError::SessionDataNotReadable(format!(
                "value for {key} is not valid JSON"
            )));
        }

        self.started = envelope.id.is_some();
        self.id = envelope.id;
        self.name = envelope.name;
        self.lifetime = envelope.lifetime;
        self.maximum_age = envelope.maximum_age;
        self.domain = envelope.domain;
        self.path = envelope.path;
        self.secure = envelope.secure;
        self.http_only = envelope.http_only;
        self.data = envelope.data;
        if self.last_activity == 0 {
            self.last_activity = now();
        }
        Ok(())
    }

    /// `Set-Cookie` header value carrying this session's ID
    pub fn cookie_header(&self) -> EngineResult<String> {
        let id = self.id.as_deref().ok_or(EngineError::SessionNotStarted)?;
        let mut cookie = format!("{}={}", self.name, id);

        if let Some(expires) = self.expires_at() {
            cookie.push_str(&format!(
                "; Expires={}",
                expires.format("%a, %d %b %Y %H:%M:%S GMT")
            ));
        }
        if let Some(max_age) = self.maximum_age {
            cookie.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(domain) = &self.domain {
            cookie.push_str(&format!("; Domain={domain}"));
        }
        cookie.push_str(&format!("; Path={}", self.path));
        if self.secure {
            cookie.push_str("; Secure");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        Ok(cookie)
    }

    fn ensure_started(&self) -> EngineResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(EngineError::SessionNotStarted)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
