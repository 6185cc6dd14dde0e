//! Servlet contract and the per-application servlet locator

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::application::Application;
use crate::auth::SecuredUrl;
use crate::error::{EngineError, EngineResult};
use crate::http::{Request, Response};

/// Application-supplied request handler
pub trait Servlet: Send + Sync {
    fn service(
        &self,
        app: &Application,
        request: &mut Request,
        response: &mut Response,
    ) -> anyhow::Result<()>;
}

impl<F> Servlet for F
where
    F: Fn(&Application, &mut Request, &mut Response) -> anyhow::Result<()> + Send + Sync,
{
    fn service(
        &self,
        app: &Application,
        request: &mut Request,
        response: &mut Response,
    ) -> anyhow::Result<()> {
        self(app, request, response)
    }
}

/// Translate a glob (`*` any run, `?` one char) into a start-anchored regex
pub fn glob_to_regex(glob: &str) -> EngineResult<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    Regex::new(&pattern).map_err(|e| EngineError::InvalidArgument(format!("{glob}: {e}")))
}

/// One URL pattern bound to a servlet
pub struct ServletMapping {
    pattern: String,
    matcher: Regex,
    servlet: Arc<dyn Servlet>,
    secured: Option<SecuredUrl>,
}

impl ServletMapping {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn servlet(&self) -> &Arc<dyn Servlet> {
        &self.servlet
    }

    pub fn secured(&self) -> Option<&SecuredUrl> {
        self.secured.as_ref()
    }

    pub fn matches(&self, servlet_path: &str) -> bool {
        self.matcher.is_match(servlet_path)
    }
}

impl fmt::Debug for ServletMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServletMapping")
            .field("pattern", &self.pattern)
            .field("secured", &self.secured.is_some())
            .finish()
    }
}

/// Ordered servlet patterns of one application, first match wins
#[derive(Debug, Default)]
pub struct ServletRegistry {
    mappings: Vec<ServletMapping>,
}

impl ServletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        pattern: &str,
        servlet: Arc<dyn Servlet>,
        secured: Option<SecuredUrl>,
    ) -> EngineResult<()> {
        if !pattern.starts_with('/') && !pattern.starts_with('*') {
            return Err(EngineError::InvalidArgument(format!(
                "servlet pattern must start with '/': {pattern}"
            )));
        }
        self.mappings.push(ServletMapping {
            pattern: pattern.to_string(),
            matcher: glob_to_regex(pattern)?,
            servlet,
            secured,
        });
        Ok(())
    }

    /// First mapping whose pattern matches `servlet_path`
    pub fn locate(&self, servlet_path: &str) -> EngineResult<&ServletMapping> {
        self.mappings
            .iter()
            .find(|m| m.matches(servlet_path))
            .ok_or_else(|| EngineError::ServletNotFound(servlet_path.to_string()))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.mappings.iter().map(|m| m.pattern.as_str())
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Servlet> {
        Arc::new(
            |_: &Application, _: &mut Request, _: &mut Response| -> anyhow::Result<()> { Ok(()) },
        )
    }

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("/admin/*").unwrap();
        assert!(re.is_match("/admin/x"));
        assert!(re.is_match("/admin/"));
        assert!(!re.is_match("/administrator"));
        assert!(!re.is_match("/x/admin/y"));

        let re = glob_to_regex("/file?.txt").unwrap();
        assert!(re.is_match("/file1.txt"));
        assert!(!re.is_match("/file1Xtxt"));
    }

    #[test]
    fn test_patterns_are_not_end_anchored() {
        let re = glob_to_regex("/hello").unwrap();
        assert!(re.is_match("/hello"));
        assert!(re.is_match("/hello/world"));
    }

    #[test]
    fn test_first_match_wins() {
        let mut registry = ServletRegistry::new();
        registry.register("/admin/*", noop(), None).unwrap();
        registry.register("/*", noop(), None).unwrap();

        assert_eq!(registry.locate("/admin/x").unwrap().pattern(), "/admin/*");
        assert_eq!(registry.locate("/other").unwrap().pattern(), "/*");

        let mut reversed = ServletRegistry::new();
        reversed.register("/*", noop(), None).unwrap();
        reversed.register("/admin/*", noop(), None).unwrap();
        assert_eq!(reversed.locate("/admin/x").unwrap().pattern(), "/*");
    }

    #[test]
    fn test_unmatched_path_is_an_error() {
        let mut registry = ServletRegistry::new();
        registry.register("/api/*", noop(), None).unwrap();

        assert!(matches!(
            registry.locate("/static/app.js"),
            Err(EngineError::ServletNotFound(path)) if path == "/static/app.js"
        ));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut registry = ServletRegistry::new();
        assert!(registry.register("api", noop(), None).is_err());
        assert!(registry.is_empty());
    }
}
