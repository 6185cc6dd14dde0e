//! Valve pipeline
//!
//! Valves run in order; once a valve marks the request dispatched the
//! remaining valves are skipped.

use tracing::{debug, warn};

use crate::application::Application;
use crate::error::EngineResult;
use crate::http::{Request, Response};

/// Request/response interceptor
pub trait Valve: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(
        &self,
        app: &Application,
        request: &mut Request,
        response: &mut Response,
    ) -> EngineResult<()>;
}

/// Ordered valve chain of one application
pub struct Pipeline {
    valves: Vec<Box<dyn Valve>>,
}

impl Pipeline {
    pub fn new(valves: Vec<Box<dyn Valve>>) -> Self {
        Self { valves }
    }

    /// Authentication, session, any `extra` valves, then servlet dispatch
    pub fn standard(extra: Vec<Box<dyn Valve>>) -> Self {
        let mut valves: Vec<Box<dyn Valve>> = vec![Box::new(AuthenticationValve), Box::new(SessionValve)];
        valves.extend(extra);
        valves.push(Box::new(CoreValve));
        Self { valves }
    }

    pub fn run(
        &self,
        app: &Application,
        request: &mut Request,
        response: &mut Response,
    ) -> EngineResult<()> {
        for valve in &self.valves {
            valve.invoke(app, request, response)?;
            if request.dispatched {
                debug!(valve = valve.name(), "request dispatched");
                break;
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.valves.iter().map(|v| v.name()).collect()
    }
}

/// Refuses requests to secured URLs without valid credentials
pub struct AuthenticationValve;

impl Valve for AuthenticationValve {
    fn name(&self) -> &str {
        "authentication"
    }

    fn invoke(
        &self,
        app: &Application,
        request: &mut Request,
        response: &mut Response,
    ) -> EngineResult<()> {
        if !app.auth().handle_request(app.servlets(), request, response) {
            request.dispatched = true;
        }
        Ok(())
    }
}

/// Runs session maintenance and binds the client's session, if any
pub struct SessionValve;

impl Valve for SessionValve {
    fn name(&self) -> &str {
        "session"
    }

    fn invoke(
        &self,
        app: &Application,
        request: &mut Request,
        _response: &mut Response,
    ) -> EngineResult<()> {
        let sessions = app.sessions();
        sessions.service();

        let Some(id) = request.cookie(&sessions.settings().name).map(str::to_string) else {
            return Ok(());
        };
        match sessions.find(&id) {
            Ok(found) => request.session = found,
            Err(e) => warn!(session = %id, "session could not be loaded: {e}"),
        }
        Ok(())
    }
}

/// Resolves the servlet and invokes it
pub struct CoreValve;

impl Valve for CoreValve {
    fn name(&self) -> &str {
        "core"
    }

    fn invoke(
        &self,
        app: &Application,
        request: &mut Request,
        response: &mut Response,
    ) -> EngineResult<()> {
        let mapping = app.servlets().locate(&request.servlet_path)?;
        debug!(pattern = mapping.pattern(), path = %request.servlet_path, "dispatching to servlet");
        mapping.servlet().service(app, request, response)?;
        request.dispatched = true;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
