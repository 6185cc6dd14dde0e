//! Servlet Engine Library
//!
//! Core of a multi-threaded application server: routes parsed requests to
//! deployed applications, runs them through a valve pipeline on per-application
//! worker pools and manages persistent, garbage-collected sessions.

pub mod application;
pub mod auth;
pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod router;
pub mod servlet;
pub mod session;
pub mod supervisor;
pub mod token;
pub mod valve;
pub mod worker;

// Re-exports for convenience
pub use application::{Application, ApplicationBuilder, ApplicationRegistry, VirtualHost};
pub use auth::{AuthScheme, AuthenticationManager, Authenticator, Credentials, SecuredUrl};
pub use config::{Config, SessionSettings};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use http::{Request, Response, ResponseState};
pub use router::Router;
pub use servlet::{Servlet, ServletRegistry};
pub use session::{Session, SessionManager, SessionOptions, SharedSession};
pub use valve::{Pipeline, Valve};
pub use worker::WorkerPool;
