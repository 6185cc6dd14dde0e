//! Deployed applications, their virtual hosts and the registry holding them

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{AuthenticationManager, SecuredUrl};
use crate::config::{Config, SessionSettings};
use crate::error::{EngineError, EngineResult};
use crate::http::{Request, Response};
use crate::servlet::{Servlet, ServletRegistry};
use crate::session::{FileBackend, SessionBackend, SessionManager, SessionOptions, SessionPool, SharedSession};
use crate::valve::{Pipeline, Valve};

/// Domain name bound to an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    name: String,
    app_base: PathBuf,
}

impl VirtualHost {
    pub fn new(name: &str, app_base: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            app_base: app_base.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app_base(&self) -> &Path {
        &self.app_base
    }
}

/// A deployed web application
pub struct Application {
    name: String,
    webapp_path: PathBuf,
    virtual_hosts: Vec<VirtualHost>,
    servlets: ServletRegistry,
    sessions: Arc<SessionManager>,
    auth: AuthenticationManager,
    pipeline: Pipeline,
}

impl Application {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn webapp_path(&self) -> &Path {
        &self.webapp_path
    }

    pub fn virtual_hosts(&self) -> &[VirtualHost] {
        &self.virtual_hosts
    }

    pub fn servlets(&self) -> &ServletRegistry {
        &self.servlets
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn auth(&self) -> &AuthenticationManager {
        &self.auth
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn context_path(&self) -> String {
        format!("/{}", self.name)
    }

    pub fn is_virtual_host(&self, host: &str) -> bool {
        self.virtual_hosts
            .iter()
            .any(|vhost| vhost.name.eq_ignore_ascii_case(host))
    }

    /// Set the context path and derive the servlet path
    ///
    /// Requests arriving on one of our virtual hosts keep the full path;
    /// anything else had the context path prefixed and gets it stripped.
    pub fn bind_request(&self, request: &mut Request) {
        let context_path = self.context_path();
        let path = request.path().to_string();

        let servlet_path = if self.is_virtual_host(request.host_name()) {
            path
        } else {
            match path.strip_prefix(&context_path) {
                Some(rest) if rest.is_empty() => "/".to_string(),
                Some(rest) if rest.starts_with('/') => rest.to_string(),
                _ => path,
            }
        };

        request.context_path = context_path;
        request.servlet_path = if servlet_path.is_empty() {
            "/".to_string()
        } else {
            servlet_path
        };
    }

    /// Session bound to the request, creating one (and its cookie) if needed
    pub fn start_session(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> EngineResult<SharedSession> {
        if let Some(session) = &request.session {
            return Ok(Arc::clone(session));
        }

        let session = self.sessions.create(SessionOptions::default())?;
        let cookie = session.lock().cookie_header()?;
        response.add_header("Set-Cookie", &cookie);
        request.session = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Destroy the request's session and expire its cookie
    pub fn end_session(&self, request: &mut Request, response: &mut Response) -> bool {
        let Some(session) = request.session.take() else {
            return false;
        };
        let Some(id) = session.lock().id().map(str::to_string) else {
            return false;
        };

        let settings = self.sessions.settings();
        response.add_header(
            "Set-Cookie",
            &format!(
                "{}=; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path={}",
                settings.name, settings.path
            ),
        );
        self.sessions.invalidate(&id)
    }

    /// Stop session background work, flushing dirty sessions
    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("webapp_path", &self.webapp_path)
            .field("virtual_hosts", &self.virtual_hosts)
            .field("servlets", &self.servlets)
            .finish()
    }
}

/// Deployment description of one application
pub struct ApplicationBuilder {
    name: String,
    webapp_path: PathBuf,
    virtual_hosts: Vec<VirtualHost>,
    servlets: Vec<(String, Arc<dyn Servlet>, Option<SecuredUrl>)>,
    valves: Vec<Box<dyn Valve>>,
    session_settings: Option<SessionSettings>,
    backend: Option<Option<Arc<dyn SessionBackend>>>,
}

impl ApplicationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            webapp_path: PathBuf::from(name),
            virtual_hosts: Vec::new(),
            servlets: Vec::new(),
            valves: Vec::new(),
            session_settings: None,
            backend: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn webapp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.webapp_path = path.into();
        self
    }

    pub fn virtual_host(mut self, domain: &str) -> Self {
        let base = self.webapp_path.clone();
        self.virtual_hosts.push(VirtualHost::new(domain, base));
        self
    }

    pub fn servlet(mut self, pattern: &str, servlet: Arc<dyn Servlet>) -> Self {
        self.servlets.push((pattern.to_string(), servlet, None));
        self
    }

    pub fn secured_servlet(
        mut self,
        pattern: &str,
        servlet: Arc<dyn Servlet>,
        secured: SecuredUrl,
    ) -> Self {
        self.servlets.push((pattern.to_string(), servlet, Some(secured)));
        self
    }

    /// Extra valve run after the session valve and before servlet dispatch
    pub fn valve(mut self, valve: Box<dyn Valve>) -> Self {
        self.valves.push(valve);
        self
    }

    pub fn session_settings(mut self, settings: SessionSettings) -> Self {
        self.session_settings = Some(settings);
        self
    }

    /// Store sessions in `backend` instead of the default file directory
    pub fn session_backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = Some(Some(backend));
        self
    }

    /// Keep sessions in memory only
    pub fn memory_sessions(mut self) -> Self {
        self.backend = Some(None);
        self
    }

    pub fn build(self, config: &Config, pool: Arc<SessionPool>) -> EngineResult<Application> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(EngineError::InvalidArgument(format!(
                "invalid application name: {:?}",
                self.name
            )));
        }

        let settings = self.session_settings.unwrap_or_else(|| config.session.clone());
        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                let dir = settings.save_path.join(&self.name);
                let backend: Arc<dyn SessionBackend> =
                    Arc::new(FileBackend::new(dir, &settings.file_prefix)?);
                Some(backend)
            }
        };

        let sessions = Arc::new(SessionManager::new(settings, pool, backend)?);
        sessions.start_background(&self.name)?;

        let mut servlets = ServletRegistry::new();
        for (pattern, servlet, secured) in self.servlets {
            servlets.register(&pattern, servlet, secured)?;
        }
        if servlets.is_empty() {
            warn!(app = %self.name, "application deployed without servlets");
        }

        info!(
            app = %self.name,
            servlets = servlets.len(),
            vhosts = self.virtual_hosts.len(),
            "application deployed"
        );

        Ok(Application {
            name: self.name,
            webapp_path: self.webapp_path,
            virtual_hosts: self.virtual_hosts,
            servlets,
            sessions,
            auth: AuthenticationManager::new(&config.digest_secret, config.nonce_max_age),
            pipeline: Pipeline::standard(self.valves),
        })
    }
}

/// All deployed applications in deployment order
#[derive(Debug, Default)]
pub struct ApplicationRegistry {
    applications: Vec<Arc<Application>>,
    by_name: HashMap<String, usize>,
    domains: HashMap<String, String>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an application; names and virtual-host domains must be unique
    pub fn register(&mut self, app: Application) -> EngineResult<Arc<Application>> {
        if self.by_name.contains_key(app.name()) {
            return Err(EngineError::InvalidArgument(format!(
                "application already deployed: {}",
                app.name()
            )));
        }
        if let Some(vhost) = app
            .virtual_hosts()
            .iter()
            .find(|vhost| self.domains.contains_key(vhost.name()))
        {
            return Err(EngineError::InvalidArgument(format!(
                "virtual host {} already bound to {}",
                vhost.name(),
                self.domains[vhost.name()]
            )));
        }

        for vhost in app.virtual_hosts() {
            self.domains.insert(vhost.name().to_string(), app.name().to_string());
        }
        let app = Arc::new(app);
        self.by_name.insert(app.name().to_string(), self.applications.len());
        self.applications.push(Arc::clone(&app));
        Ok(app)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Application>> {
        self.by_name.get(name).map(|&i| &self.applications[i])
    }

    /// Application bound to a domain name
    pub fn by_domain(&self, domain: &str) -> Option<&Arc<Application>> {
        self.domains
            .get(&domain.to_ascii_lowercase())
            .and_then(|name| self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Application>> {
        self.applications.iter()
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
