//! Engine entry point
//!
//! Wires the session pool, applications, router, worker pools and the
//! request handler manager together and exposes the single `process` call
//! used by the front end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::application::{Application, ApplicationBuilder, ApplicationRegistry};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::http::{Request, Response};
use crate::router::Router;
use crate::session::SessionPool;
use crate::supervisor::{RequestHandlerManager, RestartSignal};
use crate::worker::WorkerPool;

/// Deployment description of a whole engine
pub struct EngineBuilder {
    config: Config,
    applications: Vec<ApplicationBuilder>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            applications: Vec::new(),
        }
    }

    pub fn application(mut self, app: ApplicationBuilder) -> Self {
        self.applications.push(app);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        if self.applications.is_empty() {
            return Err(EngineError::Config("no applications to deploy".into()));
        }

        let session_pool = SessionPool::new(
            self.config.session.pool_size,
            self.config.session.pool_low_water,
        )?;

        let mut registry = ApplicationRegistry::new();
        for builder in self.applications {
            let app = builder.build(&self.config, Arc::clone(&session_pool))?;
            registry.register(app)?;
        }

        let router = Router::new(&registry)?;

        let signal = RestartSignal::new();
        let mut pools = HashMap::new();
        for app in registry.iter() {
            let pool = WorkerPool::new(
                Arc::clone(app),
                self.config.workers_per_app,
                self.config.worker_max_requests,
                self.config.admission_backoff,
                signal.clone(),
            )?;
            pools.insert(app.name().to_string(), pool);
        }

        let supervisor = RequestHandlerManager::spawn(signal, pools.values().cloned().collect())?;

        info!(
            applications = registry.len(),
            workers_per_app = self.config.workers_per_app,
            "engine started"
        );

        Ok(Engine {
            config: self.config,
            registry,
            router,
            pools,
            supervisor,
            session_pool,
            stopped: AtomicBool::new(false),
        })
    }
}

pub struct Engine {
    config: Config,
    registry: ApplicationRegistry,
    router: Router,
    pools: HashMap<String, Arc<WorkerPool>>,
    supervisor: RequestHandlerManager,
    session_pool: Arc<SessionPool>,
    stopped: AtomicBool,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Serve one request; the returned response is always dispatched
    ///
    /// Blocks while every worker of the target application is busy.
    ///
    /// # Arguments
    /// * `request` - Inbound request; `host` and `uri` select the application
    /// * `response` - Response to fill, usually `Response::new()`
    ///
    /// # Returns
    /// The servlet's response, or an error response: 400 for an unknown
    /// application, 404 for an unknown servlet, 500 when the servlet fails
    /// and 503 once the engine is shut down.
    pub fn process(&self, request: Request, response: Response) -> Response {
        let app = match self.router.resolve(&request) {
            Ok(app) => app,
            Err(e) => {
                debug!(host = %request.host, uri = %request.uri, "request not routed: {e}");
                return error_response(response, &e);
            }
        };

        let Some(pool) = self.pools.get(app.name()) else {
            let e = EngineError::Internal(format!("no worker pool for {}", app.name()));
            return error_response(response, &e);
        };

        match pool.dispatch(request, response) {
            Ok((_, response)) => response,
            Err(e) => {
                warn!(app = %app.name(), "request not dispatched: {e}");
                error_response(Response::new(), &e)
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn applications(&self) -> &ApplicationRegistry {
        &self.registry
    }

    pub fn application(&self, name: &str) -> Option<&Arc<Application>> {
        self.registry.get(name)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn worker_pool(&self, app: &str) -> Option<&Arc<WorkerPool>> {
        self.pools.get(app)
    }

    pub fn session_pool(&self) -> &Arc<SessionPool> {
        &self.session_pool
    }

    /// Stop workers, flush sessions and stop every background thread
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("engine shutting down");

        self.supervisor.shutdown();
        for pool in self.pools.values() {
            pool.shutdown();
        }
        for app in self.registry.iter() {
            app.shutdown();
        }
        self.session_pool.shutdown();

        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn error_response(mut response: Response, e: &EngineError) -> Response {
    response.status = e.status_code();
    response.write(&e.to_string());
    response.mark_dispatched();
    response
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::tests::test_config;
    use crate::auth::{AuthScheme, Credentials, SecuredUrl};
    use crate::servlet::Servlet;
    use base64::Engine as _;
    use std::path::Path;

    fn hello() -> Arc<dyn Servlet> {
        Arc::new(
            |app: &Application, req: &mut Request, resp: &mut Response| -> anyhow::Result<()> {
                resp.write(&format!("{}:{}", app.name(), req.servlet_path));
                Ok(())
            },
        )
    }

    /// `/login` starts a session holding `user`, `/whoami` reads it back
    fn account() -> Arc<dyn Servlet> {
        Arc::new(
            |app: &Application, req: &mut Request, resp: &mut Response| -> anyhow::Result<()> {
                // on the virtual host the servlet path keeps its `/account` prefix
                match req.servlet_path.trim_start_matches("/account") {
                    "/login" => {
                        let session = app.start_session(req, resp)?;
                        session.lock().set("user", "alice")?;
                    }
                    "/whoami" => {
                        let user = match &req.session {
                            Some(session) => session.lock().get::<String>("user")?,
                            None => None,
                        };
                        resp.write(user.as_deref().unwrap_or("anonymous"));
                    }
                    _ => resp.status = 404,
                }
                Ok(())
            },
        )
    }

    fn engine(dir: &Path) -> Engine {
        let mut config = test_config();
        config.session.save_path = dir.to_path_buf();

        let admin = SecuredUrl::new(
            AuthScheme::Basic,
            "admin",
            Arc::new(|c: &Credentials| {
                matches!(c, Credentials::Basic { username, password } if username == "root" && password == "secret")
            }),
        );

        Engine::builder(config)
            .application(
                ApplicationBuilder::new("blog")
                    .servlet("/admin/*", hello())
                    .servlet("/*", hello()),
            )
            .application(
                ApplicationBuilder::new("shop")
                    .virtual_host("shop.example.com")
                    .secured_servlet("/admin/*", hello(), admin)
                    .servlet("/account/*", account())
                    .servlet("/*", hello()),
            )
            .build()
            .unwrap()
    }

    fn cookie_of(resp: &Response) -> String {
        let header = resp.header("Set-Cookie").unwrap();
        header.split(';').next().unwrap().to_string()
    }

    #[test]
    fn test_routes_by_name_and_virtual_host() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let resp = engine.process(Request::new("example.com", "/blog/post/1"), Response::new());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "blog:/post/1");
        assert!(resp.is_dispatched());

        let resp = engine.process(Request::new("SHOP.example.com:443", "/cart"), Response::new());
        assert_eq!(resp.body, "shop:/cart");

        engine.shutdown();
    }

    #[test]
    fn test_unknown_application_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let resp = engine.process(Request::new("example.com", "/missing/x"), Response::new());
        assert_eq!(resp.status, 400);
        assert!(resp.body.contains("Application not found"));
        assert!(resp.is_dispatched());
    }

    #[test]
    fn test_secured_servlet_challenges() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let resp = engine.process(Request::new("shop.example.com", "/admin/users"), Response::new());
        assert_eq!(resp.status, 401);
        assert_eq!(resp.header("WWW-Authenticate"), Some("Basic realm=\"admin\""));
        assert_eq!(resp.body, "401 Unauthorized");

        let token = base64::engine::general_purpose::STANDARD.encode("root:secret");
        let req = Request::new("shop.example.com", "/admin/users")
            .with_header("Authorization", &format!("Basic {token}"));
        let resp = engine.process(req, Response::new());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "shop:/admin/users");
    }

    #[test]
    fn test_session_cookie_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let resp = engine.process(Request::new("shop.example.com", "/account/login"), Response::new());
        assert_eq!(resp.status, 200);
        let cookie = cookie_of(&resp);
        assert!(cookie.starts_with("SESSID="));

        let req = Request::new("shop.example.com", "/account/whoami").with_header("Cookie", &cookie);
        assert_eq!(engine.process(req, Response::new()).body, "alice");

        let req = Request::new("shop.example.com", "/account/whoami");
        assert_eq!(engine.process(req, Response::new()).body, "anonymous");
    }

    #[test]
    fn test_sessions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        let cookie = {
            let engine = engine(dir.path());
            let resp = engine.process(Request::new("shop.example.com", "/account/login"), Response::new());
            engine.shutdown();
            cookie_of(&resp)
        };

        let engine = engine(dir.path());
        let req = Request::new("shop.example.com", "/account/whoami").with_header("Cookie", &cookie);
        assert_eq!(engine.process(req, Response::new()).body, "alice");
    }

    #[test]
    fn test_process_after_shutdown_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.shutdown();
        engine.shutdown();

        let resp = engine.process(Request::new("example.com", "/blog/"), Response::new());
        assert_eq!(resp.status, 503);
        assert!(resp.is_dispatched());
    }

    #[test]
    fn test_builder_rejects_empty_deployment() {
        assert!(EngineBuilder::new(test_config()).build().is_err());
    }
}
