//! Engine configuration management
//!
//! Loads settings from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Session cookie, timing and storage settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Cookie name carrying the session ID
    pub name: String,

    /// Cookie path
    pub path: String,

    /// Cookie domain (host-only cookie when unset)
    pub domain: Option<String>,

    /// Seconds added to "now" to compute the cookie expiry
    pub lifetime: i64,

    /// Optional cookie Max-Age
    pub max_age: Option<i64>,

    pub secure: bool,

    pub http_only: bool,

    /// Seconds of inactivity after which a session is expired
    pub inactivity_timeout: i64,

    /// Chance (0.0..=1.0) that a collection pass actually sweeps
    pub gc_probability: f64,

    /// Seconds between background collection passes, 0 collects inline per request
    pub gc_interval: u64,

    /// Seconds between persistence sweeps
    pub persist_interval: u64,

    /// Directory holding one file per session
    pub save_path: PathBuf,

    /// File name prefix, the session ID is appended
    pub file_prefix: String,

    /// Pre-allocated sessions kept ready by the pool filler
    pub pool_size: usize,

    /// Pool refill is requested once fewer sessions than this remain
    pub pool_low_water: usize,
}

impl SessionSettings {
    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval > 0).then(|| Duration::from_secs(self.gc_interval))
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval.max(1))
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: "SESSID".to_string(),
            path: "/".to_string(),
            domain: None,
            lifetime: 86_400,
            max_age: None,
            secure: false,
            http_only: false,
            inactivity_timeout: 1_800,
            gc_probability: 0.25,
            gc_interval: 5,
            persist_interval: 1,
            save_path: PathBuf::from("./sessions"),
            file_prefix: "sess_".to_string(),
            pool_size: 32,
            pool_low_water: 8,
        }
    }
}

/// Engine configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    /// Long-lived workers per deployed application
    pub workers_per_app: usize,

    /// Requests served before a worker asks to be replaced (0 = never)
    pub worker_max_requests: u64,

    /// Wait slice while every worker of an application is busy
    pub admission_backoff: Duration,

    /// Secret key for HMAC nonce generation
    pub digest_secret: String,

    /// Seconds a Digest nonce is accepted after issue
    pub nonce_max_age: i64,

    pub session: SessionSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = SessionSettings::default();
        let session = SessionSettings {
            name: env::var("ENGINE_SESSION_NAME").unwrap_or(defaults.name),
            path: env::var("ENGINE_SESSION_PATH").unwrap_or(defaults.path),
            domain: env::var("ENGINE_SESSION_DOMAIN").ok().filter(|d| !d.is_empty()),
            lifetime: parse_var("ENGINE_SESSION_LIFETIME", defaults.lifetime),
            max_age: env::var("ENGINE_SESSION_MAX_AGE")
                .ok()
                .and_then(|v| v.parse().ok()),
            secure: parse_var("ENGINE_SESSION_SECURE", defaults.secure),
            http_only: parse_var("ENGINE_SESSION_HTTP_ONLY", defaults.http_only),
            inactivity_timeout: parse_var(
                "ENGINE_SESSION_INACTIVITY_TIMEOUT",
                defaults.inactivity_timeout,
            ),
            gc_probability: parse_var("ENGINE_SESSION_GC_PROBABILITY", defaults.gc_probability),
            gc_interval: parse_var("ENGINE_SESSION_GC_INTERVAL", defaults.gc_interval),
            persist_interval: parse_var(
                "ENGINE_SESSION_PERSIST_INTERVAL",
                defaults.persist_interval,
            ),
            save_path: env::var("ENGINE_SESSION_SAVE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.save_path),
            file_prefix: env::var("ENGINE_SESSION_FILE_PREFIX").unwrap_or(defaults.file_prefix),
            pool_size: parse_var("ENGINE_SESSION_POOL_SIZE", defaults.pool_size),
            pool_low_water: parse_var("ENGINE_SESSION_POOL_LOW_WATER", defaults.pool_low_water),
        };

        Self {
            workers_per_app: parse_var("ENGINE_WORKERS_PER_APP", 4),
            worker_max_requests: parse_var("ENGINE_WORKER_MAX_REQUESTS", 0),
            admission_backoff: Duration::from_millis(parse_var("ENGINE_ADMISSION_BACKOFF_MS", 10)),
            digest_secret: env::var("ENGINE_DIGEST_SECRET").unwrap_or_else(|_| {
                tracing::warn!("ENGINE_DIGEST_SECRET not set! Using insecure default.");
                "insecure-dev-secret-change-me-in-production".to_string()
            }),
            nonce_max_age: parse_var("ENGINE_NONCE_MAX_AGE", 300),
            session,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.workers_per_app == 0 {
            return Err(EngineError::Config(
                "At least one worker per application is required".to_string(),
            ));
        }

        if self.digest_secret.len() < 16 {
            return Err(EngineError::Config(
                "Digest secret must be at least 16 characters".to_string(),
            ));
        }

        let session = &self.session;
        if session.name.trim().is_empty() {
            return Err(EngineError::Config("Session cookie name is empty".to_string()));
        }

        if !(0.0..=1.0).contains(&session.gc_probability) {
            return Err(EngineError::Config(format!(
                "Garbage collection probability out of range: {}",
                session.gc_probability
            )));
        }

        if session.pool_low_water > session.pool_size {
            return Err(EngineError::Config(format!(
                "Session pool low-water mark {} exceeds pool size {}",
                session.pool_low_water, session.pool_size
            )));
        }

        if session.inactivity_timeout < 0 {
            return Err(EngineError::Config(
                "Inactivity timeout cannot be negative".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// TESTS
// ============================================================================
