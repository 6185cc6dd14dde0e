//! Application locator
//!
//! `host + path` is matched against an ordered pattern table. Virtual-host
//! patterns come first, then one wildcard pattern per application name, so a
//! host-specific binding always beats the generic `/<name>` prefix.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::application::{Application, ApplicationRegistry};
use crate::error::{EngineError, EngineResult};
use crate::http::Request;

struct Route {
    matcher: Regex,
    app: Arc<Application>,
}

/// Ordered pattern table, first match wins
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(registry: &ApplicationRegistry) -> EngineResult<Self> {
        let mut vhost_routes = Vec::new();
        let mut wildcard_routes = Vec::new();

        for app in registry.iter() {
            for vhost in app.virtual_hosts() {
                vhost_routes.push(Route {
                    matcher: compile(&format!("^{}/", regex::escape(vhost.name())))?,
                    app: Arc::clone(app),
                });
            }
            wildcard_routes.push(Route {
                matcher: compile(&format!("^[^/]+/{}(?:/|$)", regex::escape(app.name())))?,
                app: Arc::clone(app),
            });
        }

        vhost_routes.extend(wildcard_routes);
        Ok(Self {
            routes: vhost_routes,
        })
    }

    /// Application owning the request's `host + path`
    pub fn resolve(&self, request: &Request) -> EngineResult<Arc<Application>> {
        let target = format!(
            "{}{}",
            request.host_name().to_ascii_lowercase(),
            normalize(request.path())
        );

        let route = self
            .routes
            .iter()
            .find(|route| route.matcher.is_match(&target))
            .ok_or_else(|| EngineError::ApplicationNotFound(target.clone()))?;

        debug!(%target, app = route.app.name(), "application resolved");
        Ok(Arc::clone(&route.app))
    }

    /// Resolve and bind the request to its application
    pub fn route(&self, request: &mut Request) -> EngineResult<Arc<Application>> {
        let app = self.resolve(request)?;
        app.bind_request(request);
        Ok(app)
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.matcher.as_str()).collect()
    }
}

fn compile(pattern: &str) -> EngineResult<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::Internal(format!("bad route pattern {pattern}: {e}")))
}

fn normalize(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::tests::{build, noop};
    use crate::application::ApplicationBuilder;

    fn registry() -> ApplicationRegistry {
        let mut registry = ApplicationRegistry::new();
        registry
            .register(build(ApplicationBuilder::new("blog").servlet("/*", noop())))
            .unwrap();
        registry
            .register(build(
                ApplicationBuilder::new("shop")
                    .virtual_host("shop.example.com")
                    .servlet("/*", noop()),
            ))
            .unwrap();
        registry
    }

    #[test]
    fn test_wildcard_by_application_name() {
        let router = Router::new(&registry()).unwrap();

        let mut req = Request::new("example.com:8080", "/blog/post/1");
        let app = router.route(&mut req).unwrap();
        assert_eq!(app.name(), "blog");
        assert_eq!(req.servlet_path, "/post/1");

        assert!(router.resolve(&Request::new("example.com", "/blogger")).is_err());
    }

    #[test]
    fn test_virtual_host_preferred_over_wildcard() {
        let router = Router::new(&registry()).unwrap();

        // would also match the blog wildcard
        let mut req = Request::new("shop.example.com", "/blog/post");
        let app = router.route(&mut req).unwrap();
        assert_eq!(app.name(), "shop");
        assert_eq!(req.servlet_path, "/blog/post");
    }

    #[test]
    fn test_vhost_patterns_come_first() {
        let router = Router::new(&registry()).unwrap();
        let patterns = router.patterns();
        assert!(patterns[0].contains("shop\\.example\\.com"));
        assert_eq!(patterns.len(), 3);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let router = Router::new(&registry()).unwrap();
        let req = Request::new("shop.example.com", "/shop/cart");
        let first = router.resolve(&req).unwrap();
        for _ in 0..50 {
            assert!(Arc::ptr_eq(&first, &router.resolve(&req).unwrap()));
        }
    }

    #[test]
    fn test_unknown_application() {
        let router = Router::new(&registry()).unwrap();
        let err = router.resolve(&Request::new("example.com", "/nope")).unwrap_err();
        assert!(matches!(err, EngineError::ApplicationNotFound(_)));
        assert_eq!(err.status_code(), 400);
    }
}
