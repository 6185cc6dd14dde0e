//! Authentication of secured servlet URLs
//!
//! Credential checking is delegated to an `Authenticator`; this module parses
//! the `Authorization` header, validates Digest nonces and writes the `401`
//! challenge when a request is refused.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use crate::error::status;
use crate::http::{Request, Response};
use crate::servlet::ServletRegistry;
use crate::session::entity::now;
use crate::token::{generate_nonce, generate_opaque, verify_nonce};

/// Supported HTTP authentication schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic",
            AuthScheme::Digest => "Digest",
        }
    }
}

/// Digest `Authorization` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
    /// Request method, needed to compute HA2
    pub method: String,
}

/// Credentials presented by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Digest(DigestCredentials),
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Credentials::Basic { username, .. } => username,
            Credentials::Digest(digest) => &digest.username,
        }
    }

    /// Parse an `Authorization` header value for the expected scheme
    pub fn parse(header: &str, scheme: AuthScheme, method: &str) -> Option<Self> {
        let (name, rest) = header.trim().split_once(' ')?;
        if !name.eq_ignore_ascii_case(scheme.as_str()) {
            return None;
        }

        match scheme {
            AuthScheme::Basic => {
                let decoded = BASE64.decode(rest.trim()).ok()?;
                let decoded = String::from_utf8(decoded).ok()?;
                let (username, password) = decoded.split_once(':')?;
                Some(Credentials::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            AuthScheme::Digest => {
                let mut params = parse_params(rest);
                let mut take = |key: &str| params.remove(key);
                Some(Credentials::Digest(DigestCredentials {
                    username: take("username")?,
                    realm: take("realm")?,
                    nonce: take("nonce")?,
                    uri: take("uri")?,
                    response: take("response")?,
                    qop: take("qop"),
                    nc: take("nc"),
                    cnonce: take("cnonce"),
                    opaque: take("opaque"),
                    method: method.to_string(),
                }))
            }
        }
    }
}

/// Split `k="v", k2=v2` pairs, honouring commas inside quotes
fn parse_params(input: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let flush = |part: &str, params: &mut BTreeMap<String, String>| {
        if let Some((k, v)) = part.trim().split_once('=') {
            params.insert(
                k.trim().to_ascii_lowercase(),
                v.trim().trim_matches('"').to_string(),
            );
        }
    };

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                flush(&current, &mut params);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    flush(&current, &mut params);
    params
}

/// Credential checker supplied by the deployment
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&Credentials) -> bool + Send + Sync,
{
    fn authenticate(&self, credentials: &Credentials) -> bool {
        self(credentials)
    }
}

/// Protection attached to a servlet pattern
#[derive(Clone)]
pub struct SecuredUrl {
    pub scheme: AuthScheme,
    pub realm: String,
    pub authenticator: Arc<dyn Authenticator>,
    /// Free-form adapter options passed through from deployment
    pub options: BTreeMap<String, String>,
}

impl SecuredUrl {
    pub fn new(scheme: AuthScheme, realm: &str, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            scheme,
            realm: realm.to_string(),
            authenticator,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }
}

impl fmt::Debug for SecuredUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecuredUrl")
            .field("scheme", &self.scheme)
            .field("realm", &self.realm)
            .field("options", &self.options)
            .finish()
    }
}

/// Decides whether a request may reach its servlet
#[derive(Debug, Clone)]
pub struct AuthenticationManager {
    secret: String,
    nonce_max_age: i64,
}

impl AuthenticationManager {
    pub fn new(secret: &str, nonce_max_age: i64) -> Self {
        Self {
            secret: secret.to_string(),
            nonce_max_age,
        }
    }

    /// `true` lets the request through; `false` means the response already
    /// holds a `401` challenge
    pub fn handle_request(
        &self,
        servlets: &ServletRegistry,
        request: &mut Request,
        response: &mut Response,
    ) -> bool {
        // unmatched paths are reported by the core valve
        let Ok(mapping) = servlets.locate(&request.servlet_path) else {
            return true;
        };
        let Some(secured) = mapping.secured() else {
            return true;
        };

        let credentials = request
            .header("authorization")
            .and_then(|h| Credentials::parse(h, secured.scheme, &request.method));

        let accepted = match &credentials {
            Some(credentials) => {
                self.verify_digest_envelope(secured, credentials)
                    && secured.authenticator.authenticate(credentials)
            }
            None => false,
        };

        if accepted {
            request.remote_user = credentials.map(|c| c.username().to_string());
            return true;
        }

        debug!(path = %request.servlet_path, realm = %secured.realm, "authentication required");
        self.challenge(secured, response);
        false
    }

    /// Realm, nonce and opaque must be the ones we issue
    fn verify_digest_envelope(&self, secured: &SecuredUrl, credentials: &Credentials) -> bool {
        let Credentials::Digest(digest) = credentials else {
            return true;
        };
        digest.realm == secured.realm
            && verify_nonce(&digest.nonce, &self.secret, now(), self.nonce_max_age)
            && digest
                .opaque
                .as_deref()
                .map_or(true, |opaque| opaque == generate_opaque(&secured.realm))
    }

    /// Fill `response` with a `401` and the scheme's challenge header
    pub fn challenge(&self, secured: &SecuredUrl, response: &mut Response) {
        let header = match secured.scheme {
            AuthScheme::Basic => format!("Basic realm=\"{}\"", secured.realm),
            AuthScheme::Digest => format!(
                "Digest realm=\"{}\",qop=\"auth\",nonce=\"{}\",opaque=\"{}\"",
                secured.realm,
                generate_nonce(&self.secret, now()),
                generate_opaque(&secured.realm)
            ),
        };
        response.status = status::UNAUTHORIZED;
        response.set_header("WWW-Authenticate", &header);
        response.body = "401 Unauthorized".to_string();
    }
}

// ============================================================================
// TESTS
// ============================================================================
